//! Byte stream transports and framing negotiation.
//!
//! This module turns connected sockets of any kind into a uniform, non-blocking,
//! framed byte channel:
//!
//! * [`Socket`] is the capability set a concrete network primitive provides.
//!   [`tcp::TcpSocket`] is the only one today.
//! * [`TransportEndpoint`] binds a live socket to the [`ProtocolEndpoint`] it
//!   was reached through.
//! * [`Transport`] owns an endpoint and negotiates a framing mode (plain or
//!   obfuscated) before any application byte crosses it.
//!
//! # Design
//!
//! Nothing in here awaits. The multiplexer polls socket readiness and then
//! calls [`Transport::read_socket`] and [`Transport::write_socket`] with a byte
//! quota, so every read and write is bounded by the rate controller. Handshake
//! negotiation is advanced by those same calls a few bytes at a time.
//!
//! The codecs are selected with an enum for static dispatch, new framings are
//! added as variants rather than trait objects. New network primitives on the
//! other hand are trait objects, so the multiplexer never has to know about
//! them.

mod error;
#[cfg(test)]
pub(crate) mod mock;
mod negotiation;
mod obfuscated;
mod plain;
mod state;
pub mod tcp;

pub use error::{AcceptError, ConnectError, FramingError, HandshakeError, TransportError};
pub use obfuscated::{MAX_RECORD_PAYLOAD, PUBLIC_KEY_LEN};
pub use plain::DEFAULT_PLAINTEXT_HEADER;
pub use state::{FramingMode, Origin, TransportState};

use crate::connection::{ConnectionConfiguration, EncryptionPolicy};
use crate::endpoint::ProtocolEndpoint;
use crate::rate::{Direction, RateLimit, TokenBucket};
use bytes::{Buf, Bytes, BytesMut};
use negotiation::{Context as NegotiationContext, Negotiation, Progress};
use obfuscated::ObfuscatedCodec;
use plain::PlainCodec;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// A connected, non-blocking network primitive.
///
/// Implementations adapt a concrete socket type. Reads and writes must never
/// block, they return [`io::ErrorKind::WouldBlock`] instead. After
/// [`close`](Socket::close) every operation fails.
pub trait Socket: Send + fmt::Debug {
    /// Polls for read readiness.
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Polls for write readiness.
    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Reads without blocking. `Ok(0)` means the peer closed its side.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes without blocking.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Releases the underlying primitive. Must be idempotent.
    fn close(&mut self);
}

/// A live socket bound to the endpoint it was reached through.
///
/// Exactly one exists per open socket. It does no framing and no rate
/// limiting, that is the [`Transport`]'s job.
#[derive(Debug)]
pub struct TransportEndpoint {
    protocol: Arc<ProtocolEndpoint>,
    socket: Box<dyn Socket>,
}

impl TransportEndpoint {
    /// Binds a connected socket to its endpoint.
    pub fn new(protocol: Arc<ProtocolEndpoint>, socket: impl Socket + 'static) -> Self {
        Self {
            protocol,
            socket: Box::new(socket),
        }
    }

    /// The endpoint this socket was reached through.
    pub fn protocol_endpoint(&self) -> &Arc<ProtocolEndpoint> {
        &self.protocol
    }

    /// Polls for read readiness.
    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_read_ready(cx)
    }

    /// Polls for write readiness.
    pub fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_write_ready(cx)
    }

    /// Non-blocking raw read into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.try_read(buf)
    }

    /// Non-blocking raw write from `buf`.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.try_write(buf)
    }

    /// Closes the socket. Idempotent.
    pub fn close(&mut self) {
        self.socket.close();
    }
}

/// Negotiated framing codec.
#[derive(Debug)]
pub(crate) enum Codec {
    Plain(PlainCodec),
    Obfuscated(ObfuscatedCodec),
}

impl Codec {
    pub(crate) fn mode(&self) -> FramingMode {
        match self {
            Codec::Plain(_) => FramingMode::Plain,
            Codec::Obfuscated(_) => FramingMode::Obfuscated,
        }
    }

    pub(crate) fn encode(&mut self, data: &[u8], wire: &mut BytesMut) -> Result<(), FramingError> {
        match self {
            Codec::Plain(plain) => {
                plain.encode(data, wire);
                Ok(())
            }
            Codec::Obfuscated(obfuscated) => obfuscated.encode(data, wire),
        }
    }

    pub(crate) fn decode(
        &mut self,
        wire: &mut BytesMut,
        inbound: &mut BytesMut,
    ) -> Result<(), FramingError> {
        match self {
            Codec::Plain(plain) => {
                plain.decode(wire, inbound);
                Ok(())
            }
            Codec::Obfuscated(obfuscated) => obfuscated.decode(wire, inbound),
        }
    }
}

/// Outcome of one bounded socket read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadProgress {
    /// Raw bytes taken off the socket.
    pub bytes: usize,
    /// Set on the read that completed negotiation.
    pub established: Option<FramingMode>,
    /// The peer closed its side. Already decoded bytes can still be drained.
    pub eof: bool,
}

/// A negotiated, rate-governed byte channel over one [`TransportEndpoint`].
///
/// Application bytes queued with [`write_queued`](Transport::write_queued)
/// before negotiation completes are held back and framed once the mode is
/// known. Bytes the peer sends are never exposed until the transport is
/// established.
#[derive(Debug)]
pub struct Transport {
    endpoint: TransportEndpoint,
    origin: Origin,
    policy: EncryptionPolicy,
    plaintext_header: Bytes,
    state: TransportState,
    negotiation: Option<Negotiation>,
    codec: Option<Codec>,
    /// Application bytes waiting on negotiation.
    pending: VecDeque<Bytes>,
    /// Framed bytes waiting on the socket.
    wire_out: BytesMut,
    /// Raw bytes not yet decoded.
    wire_in: BytesMut,
    /// Decoded application bytes.
    inbound: BytesMut,
    peer_closed: bool,
    upload_limit: Option<TokenBucket>,
    download_limit: Option<TokenBucket>,
    negotiation_started: Instant,
    last_activity: Instant,
}

impl Transport {
    /// Wraps a fresh endpoint. Call [`begin_handshake`](Self::begin_handshake)
    /// before driving any I/O.
    pub fn new(
        endpoint: TransportEndpoint,
        origin: Origin,
        configuration: &ConnectionConfiguration,
        now: Instant,
    ) -> Self {
        let sub_limit = |limit: RateLimit| match limit {
            RateLimit::Unlimited => None,
            limited => Some(TokenBucket::new(limited, None, now)),
        };

        Self {
            endpoint,
            origin,
            policy: configuration.encryption_policy,
            plaintext_header: configuration.plaintext_header.clone(),
            state: TransportState::Negotiating,
            negotiation: None,
            codec: None,
            pending: VecDeque::new(),
            wire_out: BytesMut::new(),
            wire_in: BytesMut::new(),
            inbound: BytesMut::new(),
            peer_closed: false,
            upload_limit: sub_limit(configuration.upload_limit),
            download_limit: sub_limit(configuration.download_limit),
            negotiation_started: now,
            last_activity: now,
        }
    }

    /// Starts framing negotiation.
    ///
    /// Returns the framing mode if it was settled without waiting on the peer,
    /// which happens for outbound plaintext-only connections.
    pub fn begin_handshake(&mut self, now: Instant) -> Result<Option<FramingMode>, TransportError> {
        if self.state != TransportState::Negotiating || self.negotiation.is_some() {
            return Ok(None);
        }
        self.negotiation_started = now;
        self.last_activity = now;

        let ctx = NegotiationContext {
            origin: self.origin,
            policy: self.policy,
            plaintext_header: &self.plaintext_header,
        };
        match negotiation::begin(ctx, &mut self.wire_out) {
            Progress::Established(codec) => self.establish(codec).map(Some),
            Progress::Pending(state) => {
                self.negotiation = Some(state);
                // An empty plaintext header classifies without any bytes.
                self.process_inbound()
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Which side opened the connection.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Local framing policy.
    pub fn policy(&self) -> EncryptionPolicy {
        self.policy
    }

    /// Negotiated framing, if established.
    pub fn framing(&self) -> Option<FramingMode> {
        match self.state {
            TransportState::Established(mode) => Some(mode),
            _ => None,
        }
    }

    /// The endpoint the socket was reached through.
    pub fn protocol_endpoint(&self) -> &Arc<ProtocolEndpoint> {
        self.endpoint.protocol_endpoint()
    }

    /// Returns up to `max_bytes` decoded application bytes.
    ///
    /// An empty result means nothing is ready. Fails with
    /// [`TransportError::Closed`] once the transport is closed, or once the
    /// peer closed its side and every byte it sent was drained.
    pub fn read_available(&mut self, max_bytes: usize) -> Result<Bytes, TransportError> {
        if self.state.is_terminal() {
            return Err(TransportError::Closed);
        }
        if self.inbound.is_empty() {
            return if self.peer_closed {
                Err(TransportError::Closed)
            } else {
                Ok(Bytes::new())
            };
        }
        let n = max_bytes.min(self.inbound.len());
        Ok(self.inbound.split_to(n).freeze())
    }

    /// Queues application bytes for transmission.
    ///
    /// Nothing touches the socket here, the multiplexer flushes the queue on
    /// write readiness.
    pub fn write_queued(&mut self, data: Bytes) -> Result<(), TransportError> {
        if self.state.is_terminal() {
            return Err(TransportError::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }
        match self.codec.as_mut() {
            Some(codec) => {
                if let Err(e) = codec.encode(&data, &mut self.wire_out) {
                    self.close();
                    return Err(e.into());
                }
            }
            None => self.pending.push_back(data),
        }
        Ok(())
    }

    /// Whether framed bytes are waiting on the socket.
    pub fn wants_write(&self) -> bool {
        !self.state.is_terminal() && !self.wire_out.is_empty()
    }

    /// Framed bytes waiting on the socket.
    pub fn queued_bytes(&self) -> usize {
        self.wire_out.len()
    }

    /// Whether more bytes should be read from the socket.
    pub fn wants_read(&self) -> bool {
        !self.state.is_terminal() && !self.peer_closed
    }

    /// Whether queued application bytes are still waiting to go out.
    pub fn has_queued(&self) -> bool {
        !self.pending.is_empty() || !self.wire_out.is_empty()
    }

    /// Polls the socket for read readiness.
    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.endpoint.poll_read_ready(cx)
    }

    /// Polls the socket for write readiness.
    pub fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.endpoint.poll_write_ready(cx)
    }

    /// Bytes the per-connection sub-limit allows in `direction` right now.
    pub fn allowance(&mut self, direction: Direction, now: Instant) -> usize {
        match self.limit_mut(direction) {
            Some(bucket) => {
                bucket.refill(now);
                usize::try_from(bucket.available()).unwrap_or(usize::MAX)
            }
            None => usize::MAX,
        }
    }

    /// Whether the per-connection sub-limit has budget worth a pass.
    pub fn has_allowance(&mut self, direction: Direction, now: Instant) -> bool {
        match self.limit_mut(direction) {
            Some(bucket) => {
                bucket.refill(now);
                bucket.has_budget()
            }
            None => true,
        }
    }

    fn limit_mut(&mut self, direction: Direction) -> Option<&mut TokenBucket> {
        match direction {
            Direction::Upload => self.upload_limit.as_mut(),
            Direction::Download => self.download_limit.as_mut(),
        }
    }

    fn charge(&mut self, direction: Direction, bytes: usize) {
        if let Some(bucket) = self.limit_mut(direction) {
            bucket.take(bytes as u64);
        }
    }

    /// Reads at most `quota` raw bytes off the socket and feeds them through
    /// negotiation or the codec.
    pub fn read_socket(&mut self, quota: usize, now: Instant) -> Result<ReadProgress, TransportError> {
        if self.state.is_terminal() {
            return Err(TransportError::Closed);
        }
        if quota == 0 || self.peer_closed {
            return Ok(ReadProgress::default());
        }

        let start = self.wire_in.len();
        self.wire_in.resize(start + quota, 0);
        let result = self.endpoint.read(&mut self.wire_in[start..]);

        match result {
            Ok(0) => {
                self.wire_in.truncate(start);
                if self.state == TransportState::Negotiating {
                    self.fail();
                    return Err(HandshakeError::Rejected.into());
                }
                log::debug!("Peer {} closed its side", self.protocol_endpoint());
                self.peer_closed = true;
                Ok(ReadProgress {
                    eof: true,
                    ..Default::default()
                })
            }
            Ok(n) => {
                self.wire_in.truncate(start + n);
                self.last_activity = now;
                self.charge(Direction::Download, n);
                let established = self.process_inbound()?;
                Ok(ReadProgress {
                    bytes: n,
                    established,
                    eof: false,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.wire_in.truncate(start);
                Ok(ReadProgress::default())
            }
            Err(e) => {
                self.wire_in.truncate(start);
                Err(self.io_failure(e))
            }
        }
    }

    /// Writes at most `quota` framed bytes to the socket.
    ///
    /// Returns the bytes written, which may be fewer than queued.
    pub fn write_socket(&mut self, quota: usize, now: Instant) -> Result<usize, TransportError> {
        if self.state.is_terminal() {
            return Err(TransportError::Closed);
        }
        if quota == 0 || self.wire_out.is_empty() {
            return Ok(0);
        }

        let len = quota.min(self.wire_out.len());
        match self.endpoint.write(&self.wire_out[..len]) {
            Ok(n) => {
                self.wire_out.advance(n);
                if n > 0 {
                    self.last_activity = now;
                    self.charge(Direction::Upload, n);
                }
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(self.io_failure(e)),
        }
    }

    fn process_inbound(&mut self) -> Result<Option<FramingMode>, TransportError> {
        let mut established = None;

        if let Some(negotiation) = self.negotiation.take() {
            let ctx = NegotiationContext {
                origin: self.origin,
                policy: self.policy,
                plaintext_header: &self.plaintext_header,
            };
            match negotiation.advance(ctx, &mut self.wire_in, &mut self.wire_out) {
                Ok(Progress::Pending(state)) => {
                    self.negotiation = Some(state);
                    return Ok(None);
                }
                Ok(Progress::Established(codec)) => {
                    established = Some(self.establish(codec)?);
                }
                Err(e) => {
                    log::debug!(
                        "Negotiation with {} failed: {e}",
                        self.endpoint.protocol_endpoint()
                    );
                    self.fail();
                    return Err(e.into());
                }
            }
        }

        if let Some(codec) = self.codec.as_mut() {
            if let Err(e) = codec.decode(&mut self.wire_in, &mut self.inbound) {
                self.close();
                return Err(e.into());
            }
        }
        Ok(established)
    }

    fn establish(&mut self, mut codec: Codec) -> Result<FramingMode, TransportError> {
        let mode = codec.mode();
        while let Some(data) = self.pending.pop_front() {
            if let Err(e) = codec.encode(&data, &mut self.wire_out) {
                self.close();
                return Err(e.into());
            }
        }
        self.codec = Some(codec);
        self.state = self.state.on_established(mode);
        log::debug!(
            "Negotiated {mode} framing with {} ({})",
            self.endpoint.protocol_endpoint(),
            self.origin
        );
        Ok(mode)
    }

    fn io_failure(&mut self, err: io::Error) -> TransportError {
        if self.state == TransportState::Negotiating {
            self.fail();
            match err.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => HandshakeError::Rejected.into(),
                _ => HandshakeError::Io(err).into(),
            }
        } else {
            self.close();
            TransportError::Io(err)
        }
    }

    /// Time spent negotiating so far, `None` once negotiation is over.
    pub fn negotiating_for(&self, now: Instant) -> Option<Duration> {
        match self.state {
            TransportState::Negotiating => {
                Some(now.saturating_duration_since(self.negotiation_started))
            }
            _ => None,
        }
    }

    /// Time since the last byte moved in either direction.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Records application traffic.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = self.last_activity.max(now);
    }

    /// Fails an unfinished negotiation with a timeout.
    ///
    /// Returns `None` if the transport was not negotiating.
    pub fn expire_handshake(&mut self) -> Option<HandshakeError> {
        if self.state != TransportState::Negotiating {
            return None;
        }
        self.fail();
        Some(HandshakeError::Timeout)
    }

    fn fail(&mut self) {
        self.state = self.state.on_failed();
        self.release();
    }

    /// Closes the transport, discarding anything still queued. Idempotent.
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = self.state.on_closed();
        self.release();
    }

    fn release(&mut self) {
        self.endpoint.close();
        self.negotiation = None;
        self.codec = None;
        self.pending.clear();
        self.wire_out.clear();
        self.wire_in.clear();
        self.inbound.clear();
    }
}
