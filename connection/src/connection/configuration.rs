//! Connection configuration types and constants.

use crate::rate::{RateConfiguration, RateLimit};
use crate::transport::{FramingMode, DEFAULT_PLAINTEXT_HEADER};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Default timeout for connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a connection may spend negotiating its framing.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a connection may go without moving a byte.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Policy for framing selection during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptionPolicy {
    /// Only plaintext framing. Obfuscated peers are refused.
    PlainOnly,
    /// Obfuscated framing is proposed first, plaintext is accepted.
    #[default]
    EncryptedPreferred,
    /// Only obfuscated framing. Plaintext peers are refused.
    EncryptedRequired,
}

impl EncryptionPolicy {
    /// Whether a peer using `mode` is acceptable.
    pub fn allows(&self, mode: FramingMode) -> bool {
        !matches!(
            (self, mode),
            (EncryptionPolicy::PlainOnly, FramingMode::Obfuscated)
                | (EncryptionPolicy::EncryptedRequired, FramingMode::Plain)
        )
    }
}

impl fmt::Display for EncryptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionPolicy::PlainOnly => write!(f, "PlainOnly"),
            EncryptionPolicy::EncryptedPreferred => write!(f, "EncryptedPreferred"),
            EncryptionPolicy::EncryptedRequired => write!(f, "EncryptedRequired"),
        }
    }
}

/// Configuration used to build a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfiguration {
    /// Framing selection policy.
    pub encryption_policy: EncryptionPolicy,
    /// Time allowed for framing negotiation.
    pub handshake_timeout: Duration,
    /// Time allowed without any traffic before the connection is closed.
    pub idle_timeout: Duration,
    /// Timeout for outbound connection establishment.
    pub connect_timeout: Duration,
    /// Leading bytes that identify a plaintext peer on inbound connections.
    pub plaintext_header: Bytes,
    /// Optional upload cap for this connection alone.
    pub upload_limit: RateLimit,
    /// Optional download cap for this connection alone.
    pub download_limit: RateLimit,
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self {
            encryption_policy: EncryptionPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            plaintext_header: Bytes::from_static(DEFAULT_PLAINTEXT_HEADER),
            upload_limit: RateLimit::Unlimited,
            download_limit: RateLimit::Unlimited,
        }
    }
}

impl ConnectionConfiguration {
    /// Set the framing selection policy.
    pub fn with_encryption_policy(mut self, policy: EncryptionPolicy) -> Self {
        self.encryption_policy = policy;
        self
    }

    /// Set the handshake timeout.
    ///
    /// A connection still negotiating when this expires is failed with
    /// [`HandshakeError::Timeout`](crate::HandshakeError::Timeout).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the timeout for connection establishment.
    ///
    /// This timeout applies to the TCP dial only, negotiation has its own.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use swarmwire_connection::{ConnectionConfiguration, EncryptionPolicy};
    ///
    /// let config = ConnectionConfiguration::default()
    ///     .with_encryption_policy(EncryptionPolicy::EncryptedRequired)
    ///     .with_connect_timeout(Duration::from_secs(3));
    /// assert_eq!(config.connect_timeout, Duration::from_secs(3));
    /// ```
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the bytes that identify a plaintext peer.
    pub fn with_plaintext_header(mut self, header: impl Into<Bytes>) -> Self {
        self.plaintext_header = header.into();
        self
    }

    /// Cap this connection's upload on top of the global limit.
    pub fn with_upload_limit(mut self, limit: RateLimit) -> Self {
        self.upload_limit = limit;
        self
    }

    /// Cap this connection's download on top of the global limit.
    pub fn with_download_limit(mut self, limit: RateLimit) -> Self {
        self.download_limit = limit;
        self
    }
}

impl fmt::Display for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionConfiguration {{ policy: {}, handshake: {:?}, idle: {:?}, connect: {:?}, upload: {}, download: {} }}",
            self.encryption_policy,
            self.handshake_timeout,
            self.idle_timeout,
            self.connect_timeout,
            self.upload_limit,
            self.download_limit
        )
    }
}

/// Engine wide options handed down by the embedding application.
///
/// Splits into the process-wide [`RateConfiguration`] and the per-connection
/// [`ConnectionConfiguration`] defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    /// Aggregate upload limit.
    pub upload_rate_limit: RateLimit,
    /// Aggregate download limit.
    pub download_rate_limit: RateLimit,
    /// Token bucket capacity in bytes, twice the rate if `None`.
    pub burst_cap: Option<u64>,
    /// Time allowed for framing negotiation.
    pub handshake_timeout: Duration,
    /// Time allowed without any traffic.
    pub idle_timeout: Duration,
    /// Framing selection policy.
    pub encryption_policy: EncryptionPolicy,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            upload_rate_limit: RateLimit::Unlimited,
            download_rate_limit: RateLimit::Unlimited,
            burst_cap: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            encryption_policy: EncryptionPolicy::default(),
        }
    }
}

impl Configuration {
    /// Set the aggregate upload limit in bytes per second, 0 for unlimited.
    pub fn with_upload_rate_limit(mut self, limit: impl Into<RateLimit>) -> Self {
        self.upload_rate_limit = limit.into();
        self
    }

    /// Set the aggregate download limit in bytes per second, 0 for unlimited.
    pub fn with_download_rate_limit(mut self, limit: impl Into<RateLimit>) -> Self {
        self.download_rate_limit = limit.into();
        self
    }

    /// Set the token bucket capacity.
    pub fn with_burst_cap(mut self, burst_cap: u64) -> Self {
        self.burst_cap = Some(burst_cap);
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the framing selection policy.
    pub fn with_encryption_policy(mut self, policy: EncryptionPolicy) -> Self {
        self.encryption_policy = policy;
        self
    }

    /// The process-wide rate limits.
    pub fn rate(&self) -> RateConfiguration {
        RateConfiguration {
            upload: self.upload_rate_limit,
            download: self.download_rate_limit,
            burst_cap: self.burst_cap,
        }
    }

    /// Per-connection defaults.
    pub fn connection(&self) -> ConnectionConfiguration {
        ConnectionConfiguration::default()
            .with_encryption_policy(self.encryption_policy)
            .with_handshake_timeout(self.handshake_timeout)
            .with_idle_timeout(self.idle_timeout)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Configuration {{ {}, handshake: {:?}, idle: {:?}, policy: {} }}",
            self.rate(),
            self.handshake_timeout,
            self.idle_timeout,
            self.encryption_policy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_configuration_defaults() {
        let config = ConnectionConfiguration::default();
        assert_eq!(config.encryption_policy, EncryptionPolicy::EncryptedPreferred);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(&config.plaintext_header[..], DEFAULT_PLAINTEXT_HEADER);

        let config = config.with_connect_timeout(Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_policy_allows() {
        assert!(EncryptionPolicy::PlainOnly.allows(FramingMode::Plain));
        assert!(!EncryptionPolicy::PlainOnly.allows(FramingMode::Obfuscated));
        assert!(EncryptionPolicy::EncryptedPreferred.allows(FramingMode::Plain));
        assert!(EncryptionPolicy::EncryptedPreferred.allows(FramingMode::Obfuscated));
        assert!(!EncryptionPolicy::EncryptedRequired.allows(FramingMode::Plain));
    }

    #[test]
    fn test_configuration_projections() {
        let config = Configuration::default()
            .with_upload_rate_limit(1000)
            .with_download_rate_limit(0)
            .with_burst_cap(500)
            .with_idle_timeout(Duration::from_secs(5))
            .with_encryption_policy(EncryptionPolicy::PlainOnly);

        let rate = config.rate();
        assert_eq!(rate.upload, RateLimit::BytesPerSecond(1000));
        assert_eq!(rate.download, RateLimit::Unlimited);
        assert_eq!(rate.burst_cap, Some(500));

        let connection = config.connection();
        assert_eq!(connection.encryption_policy, EncryptionPolicy::PlainOnly);
        assert_eq!(connection.idle_timeout, Duration::from_secs(5));
        assert_eq!(connection.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }
}
