//! Peer connection plumbing for file-distribution swarms.
//!
//! Transports negotiate plain or obfuscated framing over any connected
//! [`Socket`], a [`Multiplexer`] drives many of them from one task under a
//! shared [`RateController`], and applications see each peer as a
//! [`Connection`] delivering bytes to a [`ConnectionHandler`].

mod connection;
mod endpoint;
mod multiplexer;
mod rate;
mod transport;

pub use connection::{
    serve, ChannelHandler, CloseReason, Configuration, Connection, ConnectionConfiguration,
    ConnectionError, ConnectionEvent, ConnectionHandler, ConnectionId, EncryptionPolicy,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
};
pub use endpoint::{ProtocolEndpoint, ProtocolKind};
pub use multiplexer::{
    Multiplexer, MultiplexerConfiguration, MultiplexerHandle, MultiplexerPool, PassReport,
    Registry, DEFAULT_POLL_INTERVAL, DEFAULT_READ_CHUNK_SIZE,
};
pub use rate::{
    Direction, RateConfiguration, RateController, RateLimit, SharedRateController, TokenBucket,
    MIN_GRANT,
};
pub use transport::tcp::{dial, TcpAcceptor, TcpSocket};
pub use transport::{
    AcceptError, ConnectError, FramingError, FramingMode, HandshakeError, Origin, ReadProgress,
    Socket, Transport, TransportEndpoint, TransportError, TransportState,
    DEFAULT_PLAINTEXT_HEADER, MAX_RECORD_PAYLOAD, PUBLIC_KEY_LEN,
};
