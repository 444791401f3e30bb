//! TCP sockets.

use super::error::{AcceptError, ConnectError};
use super::{Socket, TransportEndpoint};
use crate::endpoint::ProtocolEndpoint;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpSocket {
    stream: Option<TcpStream>,
}

impl TcpSocket {
    /// Wraps a connected stream.
    ///
    /// Nagle is disabled, peer-wire traffic is full of small control messages.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Some(stream),
        })
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Socket for TcpSocket {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.stream {
            Some(stream) => stream.poll_read_ready(cx),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.stream {
            Some(stream) => stream.poll_write_ready(cx),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.try_read(buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.try_write(buf)
    }

    fn close(&mut self) {
        // Dropping the stream closes the descriptor.
        self.stream.take();
    }
}

/// Dial a TCP endpoint.
///
/// Fails with [`ConnectError::TimedOut`] if the connection is not established
/// within `connect_timeout`.
pub async fn dial(
    endpoint: Arc<ProtocolEndpoint>,
    connect_timeout: Duration,
) -> Result<TransportEndpoint, ConnectError> {
    let socket_addr = endpoint.socket_addr();
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(socket_addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ConnectError::from(e)),
        Err(_) => return Err(ConnectError::TimedOut),
    };

    let socket = TcpSocket::new(stream).map_err(ConnectError::Unreachable)?;
    log::debug!("TCP connection established to {endpoint}");
    Ok(TransportEndpoint::new(endpoint, socket))
}

/// Accepts inbound TCP connections.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: Option<TcpListener>,
}

impl TcpAcceptor {
    /// Bind a listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener))
    }

    /// Accept on an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener: Some(listener),
        }
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&mut self) -> Result<TransportEndpoint, AcceptError> {
        let listener = self.listener.as_ref().ok_or(AcceptError::ListenerClosed)?;
        let (stream, addr) = listener.accept().await.map_err(classify_accept_error)?;
        let socket = TcpSocket::new(stream)?;
        log::debug!("Accepted TCP connection from {addr}");
        Ok(TransportEndpoint::new(
            Arc::new(ProtocolEndpoint::from(addr)),
            socket,
        ))
    }

    /// Stop listening. Further accepts fail with [`AcceptError::ListenerClosed`].
    pub fn close(&mut self) {
        self.listener.take();
    }
}

fn classify_accept_error(err: io::Error) -> AcceptError {
    // EBADF (9 on every unix) or EINVAL mean the listening socket is unusable.
    if err.kind() == io::ErrorKind::InvalidInput || err.raw_os_error() == Some(9) {
        AcceptError::ListenerClosed
    } else {
        AcceptError::from(err)
    }
}
