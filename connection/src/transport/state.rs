//! Transport lifecycle tracking.
//!
//! A transport moves through a small state machine.
//!
//! 1. **Negotiating**: the socket is connected, but the framing mode (plain or
//!    obfuscated) is not yet settled. No application bytes cross the boundary.
//! 2. **Established**: framing is settled and application bytes flow.
//! 3. **Failed**: negotiation timed out or violated the local policy.
//! 4. **Closed**: terminal, reached from any state on explicit close or I/O error.
//!
//! Nothing ever leaves `Closed`.

use std::fmt;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Outbound => write!(f, "outbound"),
            Origin::Inbound => write!(f, "inbound"),
        }
    }
}

/// Negotiated framing of a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramingMode {
    /// Bytes pass through untouched.
    Plain,
    /// Bytes are carried in authenticated, encrypted records.
    Obfuscated,
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingMode::Plain => write!(f, "plain"),
            FramingMode::Obfuscated => write!(f, "obfuscated"),
        }
    }
}

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Framing negotiation in progress.
    Negotiating,
    /// Framing negotiated, application bytes flow.
    Established(FramingMode),
    /// Negotiation failed. The socket is released.
    Failed,
    /// Closed locally or by the peer. The socket is released.
    Closed,
}

impl TransportState {
    /// Update the state when negotiation settles on a framing mode.
    pub fn on_established(&self, mode: FramingMode) -> Self {
        match self {
            TransportState::Negotiating => TransportState::Established(mode),
            _ => *self,
        }
    }

    /// Update the state when negotiation fails.
    pub fn on_failed(&self) -> Self {
        match self {
            TransportState::Negotiating => TransportState::Failed,
            _ => *self,
        }
    }

    /// Update the state when the transport is closed.
    ///
    /// A failed transport stays failed, the socket is already gone.
    pub fn on_closed(&self) -> Self {
        match self {
            TransportState::Failed => TransportState::Failed,
            _ => TransportState::Closed,
        }
    }

    /// Whether the socket has been released.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Negotiating => write!(f, "negotiating"),
            TransportState::Established(mode) => write!(f, "established ({mode})"),
            TransportState::Failed => write!(f, "failed"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}
