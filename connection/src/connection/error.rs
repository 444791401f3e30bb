//! Error types for connection handling.

use crate::transport::{ConnectError, HandshakeError, TransportError};
use std::error::Error;
use std::fmt;

/// Errors returned by connection and multiplexer handle operations.
#[derive(Debug)]
pub enum ConnectionError {
    /// The outbound connection could not be established.
    Connect(ConnectError),
    /// The connection is already closed.
    Closed,
    /// The multiplexer driving the connection has shut down.
    MultiplexerShutdown,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Connect(err) => write!(f, "Connection failed: {err}"),
            ConnectionError::Closed => write!(f, "Connection closed"),
            ConnectionError::MultiplexerShutdown => write!(f, "Multiplexer has shut down"),
        }
    }
}

impl Error for ConnectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConnectionError::Connect(err) => Some(err),
            ConnectionError::Closed => None,
            ConnectionError::MultiplexerShutdown => None,
        }
    }
}

impl From<ConnectError> for ConnectionError {
    fn from(err: ConnectError) -> Self {
        ConnectionError::Connect(err)
    }
}

/// Why a connection ended.
///
/// Handed to the owner exactly once per connection.
#[derive(Debug)]
pub enum CloseReason {
    /// Closed locally, with a free-form reason.
    Local(String),
    /// Framing negotiation failed.
    Handshake(HandshakeError),
    /// The stream ended or failed after negotiation.
    Transport(TransportError),
    /// No traffic for longer than the idle timeout.
    IdleTimeout,
    /// The outbound dial failed, the connection never existed on the wire.
    Connect(ConnectError),
    /// The multiplexer shut down.
    Shutdown,
}

impl CloseReason {
    /// Whether the connection ended because the local side asked it to.
    pub fn is_local(&self) -> bool {
        matches!(self, CloseReason::Local(_) | CloseReason::Shutdown)
    }
}

impl From<TransportError> for CloseReason {
    /// Handshake failures are lifted out of the transport error.
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Handshake(err) => CloseReason::Handshake(err),
            other => CloseReason::Transport(other),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local(reason) => write!(f, "Closed locally: {reason}"),
            CloseReason::Handshake(err) => write!(f, "Handshake failed: {err}"),
            CloseReason::Transport(err) => write!(f, "Transport ended: {err}"),
            CloseReason::IdleTimeout => write!(f, "Idle timeout"),
            CloseReason::Connect(err) => write!(f, "Connect failed: {err}"),
            CloseReason::Shutdown => write!(f, "Multiplexer shut down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_lifts_handshake_errors() {
        let reason = CloseReason::from(TransportError::Handshake(HandshakeError::Timeout));
        assert!(matches!(reason, CloseReason::Handshake(HandshakeError::Timeout)));

        let reason = CloseReason::from(TransportError::Closed);
        assert!(matches!(reason, CloseReason::Transport(TransportError::Closed)));
        assert!(!reason.is_local());
    }
}
