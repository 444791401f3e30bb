//! Error types for the transport layer.

use super::state::FramingMode;
use crate::connection::EncryptionPolicy;
use std::error::Error;
use std::fmt;
use std::io;

/// Errors establishing an outbound connection.
#[derive(Debug)]
pub enum ConnectError {
    /// The peer actively refused the connection.
    Refused(io::Error),
    /// The peer could not be reached.
    Unreachable(io::Error),
    /// The connection attempt exceeded the configured connect timeout.
    TimedOut,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Refused(err) => write!(f, "Connection refused: {err}"),
            ConnectError::Unreachable(err) => write!(f, "Peer unreachable: {err}"),
            ConnectError::TimedOut => write!(f, "Connection attempt timed out"),
        }
    }
}

impl Error for ConnectError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConnectError::Refused(err) => Some(err),
            ConnectError::Unreachable(err) => Some(err),
            ConnectError::TimedOut => None,
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused(err),
            io::ErrorKind::TimedOut => ConnectError::TimedOut,
            _ => ConnectError::Unreachable(err),
        }
    }
}

/// Errors accepting an inbound connection.
#[derive(Debug)]
pub enum AcceptError {
    /// The listening socket is gone, no further connections will arrive.
    ListenerClosed,
    /// The process ran out of descriptors or memory for a new socket.
    ResourceExhausted(io::Error),
    /// Any other accept failure. Usually transient.
    Io(io::Error),
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::ListenerClosed => write!(f, "Listener closed"),
            AcceptError::ResourceExhausted(err) => {
                write!(f, "Resources exhausted accepting connection: {err}")
            }
            AcceptError::Io(err) => write!(f, "Accept error: {err}"),
        }
    }
}

impl Error for AcceptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AcceptError::ListenerClosed => None,
            AcceptError::ResourceExhausted(err) => Some(err),
            AcceptError::Io(err) => Some(err),
        }
    }
}

impl From<io::Error> for AcceptError {
    fn from(err: io::Error) -> Self {
        // ENFILE and EMFILE.
        if matches!(err.raw_os_error(), Some(23) | Some(24))
            || err.kind() == io::ErrorKind::OutOfMemory
        {
            AcceptError::ResourceExhausted(err)
        } else {
            AcceptError::Io(err)
        }
    }
}

/// Errors negotiating the framing mode of a transport.
///
/// A handshake error always closes the connection. It is never retried by the
/// transport itself, the only automatic recovery is the single plaintext
/// fallback the multiplexer performs for outbound `EncryptedPreferred` dials.
#[derive(Debug)]
pub enum HandshakeError {
    /// The peer did not complete negotiation within the handshake timeout.
    Timeout,
    /// The framing mode the peer used is not allowed by the local policy.
    PolicyViolation {
        /// Local policy in effect.
        policy: EncryptionPolicy,
        /// Mode the peer attempted.
        detected: FramingMode,
    },
    /// The peer closed the connection before negotiation completed.
    Rejected,
    /// Key agreement produced an unusable shared secret.
    KeyExchange,
    /// An I/O error occurred during negotiation.
    Io(io::Error),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Timeout => write!(f, "Handshake timed out"),
            HandshakeError::PolicyViolation { policy, detected } => {
                write!(f, "Peer negotiated {detected} framing, not allowed by {policy}")
            }
            HandshakeError::Rejected => write!(f, "Peer closed the connection during handshake"),
            HandshakeError::KeyExchange => write!(f, "Key exchange failed"),
            HandshakeError::Io(err) => write!(f, "Handshake I/O error: {err}"),
        }
    }
}

impl Error for HandshakeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HandshakeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors in the framing layer of an established transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// A record header announced more bytes than any record may carry.
    RecordTooLarge(usize),
    /// A record could not be sealed.
    Encrypt,
    /// A record failed authentication.
    Decrypt,
    /// The per-direction record counter ran out.
    NonceExhausted,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::RecordTooLarge(len) => write!(f, "Record of {len} bytes exceeds limit"),
            FramingError::Encrypt => write!(f, "Record encryption failed"),
            FramingError::Decrypt => write!(f, "Record authentication failed"),
            FramingError::NonceExhausted => write!(f, "Record counter exhausted"),
        }
    }
}

impl Error for FramingError {}

/// Errors from an individual transport.
///
/// These are always isolated to the one connection they occur on.
#[derive(Debug)]
pub enum TransportError {
    /// The peer closed the stream, or the transport was closed locally.
    Closed,
    /// An I/O error occurred on the socket.
    Io(io::Error),
    /// Framing negotiation failed.
    Handshake(HandshakeError),
    /// The established framing layer failed.
    Framing(FramingError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "Transport closed"),
            TransportError::Io(err) => write!(f, "IO error: {err}"),
            TransportError::Handshake(err) => write!(f, "Handshake failed: {err}"),
            TransportError::Framing(err) => write!(f, "Framing error: {err}"),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Closed => None,
            TransportError::Io(err) => Some(err),
            TransportError::Handshake(err) => Some(err),
            TransportError::Framing(err) => Some(err),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

impl From<HandshakeError> for TransportError {
    fn from(err: HandshakeError) -> Self {
        TransportError::Handshake(err)
    }
}

impl From<FramingError> for TransportError {
    fn from(err: FramingError) -> Self {
        TransportError::Framing(err)
    }
}
