//! Peer addressing values.
//!
//! A [`ProtocolEndpoint`] names a remote peer and the network protocol used to
//! reach it. It never touches the network, so it is safe to create, hash and
//! deduplicate in address books long before (or without ever) dialing.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Network protocol used to reach a peer.
///
/// New transports (e.g. a UDP based one) are added as variants here and as a
/// [`Socket`](crate::Socket) implementation. The multiplexer is unaware of the
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ProtocolKind {
    /// Plain TCP stream.
    Tcp,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Address of a remote peer paired with the protocol used to reach it.
///
/// Identity is the `(kind, address, port)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolEndpoint {
    /// The protocol used to reach the peer.
    pub kind: ProtocolKind,
    /// The peer's network address.
    pub address: IpAddr,
    /// The port number the peer is listening on.
    pub port: u16,
}

impl ProtocolEndpoint {
    /// Creates a new endpoint for the given protocol, address and port.
    pub fn new(kind: ProtocolKind, address: IpAddr, port: u16) -> Self {
        Self {
            kind,
            address,
            port,
        }
    }

    /// Creates a new TCP endpoint.
    ///
    /// # Example
    ///
    /// ```
    /// use swarmwire_connection::ProtocolEndpoint;
    /// use std::net::{IpAddr, Ipv4Addr};
    ///
    /// let endpoint = ProtocolEndpoint::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881);
    /// assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:6881");
    /// ```
    pub fn tcp(address: IpAddr, port: u16) -> Self {
        Self::new(ProtocolKind::Tcp, address, port)
    }

    /// The socket address of the peer.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for ProtocolEndpoint {
    /// TCP endpoint for a socket address.
    fn from(addr: SocketAddr) -> Self {
        Self::tcp(addr.ip(), addr.port())
    }
}

impl fmt::Display for ProtocolEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.socket_addr())
    }
}
