//! Application-facing connections.
//!
//! Once a transport has negotiated its framing, the multiplexer hands its owner
//! a [`Connection`]. The connection is intentionally thin: it queues outbound
//! bytes, delivers inbound bytes to a [`ConnectionHandler`], and can be closed.
//! Parsing the peer-wire protocol on top is up to the handler.
//!
//! # Examples
//!
//! Accepting connections and echoing everything back.
//!
//! ```no_run
//! use bytes::Bytes;
//! use swarmwire_connection::{
//!     serve, CloseReason, Connection, ConnectionConfiguration, ConnectionHandler, ConnectionId,
//!     Multiplexer, MultiplexerConfiguration, RateController, TcpAcceptor,
//! };
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_data(&mut self, connection: &Connection, data: Bytes) {
//!         // Nothing useful to do if the connection is already gone.
//!         let _ = connection.send(data);
//!     }
//!
//!     fn on_closed(&mut self, id: ConnectionId, reason: CloseReason) {
//!         println!("{id} closed: {reason}");
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (multiplexer, handle) = Multiplexer::new(
//!     MultiplexerConfiguration::default(),
//!     RateController::unlimited().shared(),
//! );
//! tokio::spawn(multiplexer.run());
//!
//! let acceptor = TcpAcceptor::bind("0.0.0.0:6881".parse()?).await?;
//! serve(acceptor, &handle, ConnectionConfiguration::default(), |_| Echo).await?;
//! # Ok(())
//! # }
//! ```

mod configuration;
mod error;

pub use configuration::{
    Configuration, ConnectionConfiguration, EncryptionPolicy, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
};
pub use error::{CloseReason, ConnectionError};

use crate::endpoint::ProtocolEndpoint;
use crate::multiplexer::{Command, Registry};
use crate::transport::tcp::TcpAcceptor;
use crate::transport::{AcceptError, FramingMode, Origin};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Pause after the process ran out of descriptors before accepting again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to an established connection.
///
/// Cheap to clone. Every clone talks to the same connection through the
/// multiplexer's command queue, nothing here touches the socket.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    endpoint: Arc<ProtocolEndpoint>,
    framing: FramingMode,
    origin: Origin,
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        endpoint: Arc<ProtocolEndpoint>,
        framing: FramingMode,
        origin: Origin,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            endpoint,
            framing,
            origin,
            commands,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote endpoint.
    pub fn protocol_endpoint(&self) -> &Arc<ProtocolEndpoint> {
        &self.endpoint
    }

    /// The negotiated framing.
    pub fn framing(&self) -> FramingMode {
        self.framing
    }

    /// Which side opened the connection.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Queue bytes for the peer.
    ///
    /// Returns immediately. The bytes go out in order, at whatever pace the
    /// socket and the rate limits allow.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.commands
            .send(Command::Send {
                id: self.id,
                data: data.into(),
            })
            .map_err(|_| ConnectionError::MultiplexerShutdown)
    }

    /// Close the connection, discarding anything not yet sent.
    ///
    /// Idempotent. The handler's `on_closed` is called once, from the
    /// multiplexer, before the socket is touched again.
    pub fn close(&self, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // A shut down multiplexer already closed the connection.
        let _ = self.commands.send(Command::Close {
            id: self.id,
            reason: CloseReason::Local(reason.into()),
        });
    }

    /// Whether the connection was closed, by either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Receives the events of one connection.
///
/// Called from the multiplexer loop, so implementations must not block.
pub trait ConnectionHandler: Send {
    /// Framing negotiation finished and the connection is usable.
    fn on_established(&mut self, connection: &Connection) {
        let _ = connection;
    }

    /// Decoded bytes arrived, in order.
    fn on_data(&mut self, connection: &Connection, data: Bytes);

    /// The connection ended. Called exactly once, and nothing after it.
    fn on_closed(&mut self, id: ConnectionId, reason: CloseReason);
}

/// Connection events as delivered by a [`ChannelHandler`].
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Framing negotiated, the connection is usable.
    Established(Connection),
    /// Bytes arrived.
    Data {
        /// Connection the bytes arrived on.
        id: ConnectionId,
        /// Decoded application bytes.
        data: Bytes,
    },
    /// The connection ended.
    Closed {
        /// Connection that ended.
        id: ConnectionId,
        /// Why it ended.
        reason: CloseReason,
    },
}

/// A [`ConnectionHandler`] forwarding every event into a channel.
///
/// Lets async code consume connection events with `recv().await` instead of
/// implementing callbacks. Many connections can share one channel by cloning
/// the handler.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }

    fn forward(&self, event: ConnectionEvent) {
        // Receiver gone means nobody cares anymore.
        let _ = self.events.send(event);
    }
}

impl ConnectionHandler for ChannelHandler {
    fn on_established(&mut self, connection: &Connection) {
        self.forward(ConnectionEvent::Established(connection.clone()));
    }

    fn on_data(&mut self, connection: &Connection, data: Bytes) {
        self.forward(ConnectionEvent::Data {
            id: connection.id(),
            data,
        });
    }

    fn on_closed(&mut self, id: ConnectionId, reason: CloseReason) {
        self.forward(ConnectionEvent::Closed { id, reason });
    }
}

/// Accept inbound connections until the listener closes.
///
/// Every accepted endpoint is registered with `registry` under a handler built
/// by `handler_for`. Accept errors are logged and the loop carries on, pausing
/// briefly if the process ran out of descriptors.
///
/// Returns `Ok(())` once the listener is closed, or an error if the
/// multiplexer shut down.
pub async fn serve<R, F, H>(
    mut acceptor: TcpAcceptor,
    registry: &R,
    configuration: ConnectionConfiguration,
    mut handler_for: F,
) -> Result<(), ConnectionError>
where
    R: Registry,
    F: FnMut(&ProtocolEndpoint) -> H,
    H: ConnectionHandler + 'static,
{
    loop {
        match acceptor.accept().await {
            Ok(endpoint) => {
                let handler = handler_for(endpoint.protocol_endpoint());
                let id = registry.register_endpoint(
                    endpoint,
                    Origin::Inbound,
                    configuration.clone(),
                    Box::new(handler),
                )?;
                log::debug!("Accepted connection {id}");
            }
            Err(AcceptError::ListenerClosed) => {
                log::info!("Listener closed, no longer accepting connections");
                return Ok(());
            }
            Err(AcceptError::ResourceExhausted(e)) => {
                log::warn!("Out of resources accepting connections: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => log::warn!("{e}"),
        }
    }
}
