//! The I/O multiplexer.
//!
//! A [`Multiplexer`] is a single cooperative event loop that drives every
//! [`Transport`] registered with it. Each pass it:
//!
//! 1. Applies queued commands (registrations, sends, closes, rate changes).
//! 2. Refills the rate buckets.
//! 3. Waits, at most [`MultiplexerConfiguration::poll_interval`], for any
//!    socket it has budget for to become ready, or for a new command.
//! 4. Reads from readable transports within their fair share of the download
//!    budget and hands decoded bytes to the connection handlers.
//! 5. Writes queued bytes within the fair share of the upload budget.
//! 6. Fails connections stuck negotiating or idle for too long.
//! 7. Deregisters closed connections and notifies their handlers.
//!
//! The set of polled transports is only ever changed in step 1 and step 7. A
//! [`MultiplexerHandle`] can be used from anywhere, its requests are queued and
//! picked up by the next pass.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use swarmwire_connection::{
//!     CloseReason, Connection, ConnectionConfiguration, ConnectionHandler, ConnectionId,
//!     Multiplexer, MultiplexerConfiguration, ProtocolEndpoint, RateController,
//! };
//!
//! struct Printer;
//!
//! impl ConnectionHandler for Printer {
//!     fn on_data(&mut self, connection: &Connection, data: Bytes) {
//!         println!("{} sent {} bytes", connection.id(), data.len());
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
//! let peer = ProtocolEndpoint::tcp("127.0.0.1".parse()?, 6881);
//! let id = handle
//!     .connect(peer, ConnectionConfiguration::default(), Printer)
//!     .await?;
//! println!("dialed {id}");
//! # Ok(())
//! # }
//! ```

mod pool;

pub use pool::MultiplexerPool;

use crate::connection::{
    CloseReason, Connection, ConnectionConfiguration, ConnectionError, ConnectionHandler,
    ConnectionId, EncryptionPolicy,
};
use crate::endpoint::ProtocolEndpoint;
use crate::rate::{Direction, RateConfiguration, SharedRateController};
use crate::transport::tcp::dial;
use crate::transport::{
    ConnectError, FramingMode, HandshakeError, Origin, Transport, TransportEndpoint,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Default upper bound on a single readiness wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default largest single socket read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;

/// Configuration of a multiplexer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplexerConfiguration {
    /// Longest a pass waits on readiness before running housekeeping anyway.
    pub poll_interval: Duration,
    /// Largest single read from one socket.
    pub read_chunk_size: usize,
    /// Re-dial in plaintext once when an obfuscated proposal is refused.
    pub fallback_to_plaintext: bool,
}

impl Default for MultiplexerConfiguration {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            fallback_to_plaintext: true,
        }
    }
}

impl MultiplexerConfiguration {
    /// Set the readiness wait bound.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the largest single read.
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Enable or disable the plaintext fallback.
    pub fn with_fallback_to_plaintext(mut self, enabled: bool) -> Self {
        self.fallback_to_plaintext = enabled;
        self
    }
}

impl fmt::Display for MultiplexerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MultiplexerConfiguration {{ poll_interval: {:?}, read_chunk_size: {}, fallback: {} }}",
            self.poll_interval, self.read_chunk_size, self.fallback_to_plaintext
        )
    }
}

/// Requests queued for the loop.
pub(crate) enum Command {
    Register {
        id: ConnectionId,
        endpoint: TransportEndpoint,
        origin: Origin,
        configuration: ConnectionConfiguration,
        handler: Box<dyn ConnectionHandler>,
        can_fall_back: bool,
    },
    Send {
        id: ConnectionId,
        data: Bytes,
    },
    Close {
        id: ConnectionId,
        reason: CloseReason,
    },
    SetRateLimits(RateConfiguration),
    /// A plaintext re-dial failed, the connection is given up.
    Abandon {
        id: ConnectionId,
        handler: Box<dyn ConnectionHandler>,
        error: ConnectError,
    },
    Shutdown,
}

// Manual Debug implementation, handlers are opaque.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register { id, origin, .. } => {
                write!(f, "Register {{ id: {id}, origin: {origin} }}")
            }
            Command::Send { id, data } => write!(f, "Send {{ id: {id}, len: {} }}", data.len()),
            Command::Close { id, reason } => write!(f, "Close {{ id: {id}, reason: {reason} }}"),
            Command::SetRateLimits(config) => write!(f, "SetRateLimits({config})"),
            Command::Abandon { id, error, .. } => {
                write!(f, "Abandon {{ id: {id}, error: {error} }}")
            }
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Statistics for one multiplexer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Registered connections after queued commands were applied.
    pub connections: usize,
    /// Queued commands applied at the start of the pass.
    pub applied: usize,
    /// Connections that were read from.
    pub readable: usize,
    /// Connections that were written to.
    pub writable: usize,
    /// Raw bytes read off sockets.
    pub bytes_read: usize,
    /// Raw bytes written to sockets.
    pub bytes_written: usize,
    /// Ready connections skipped for lack of budget.
    pub deferred: usize,
    /// Connections deregistered at the end of the pass.
    pub closed: usize,
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connections, {} commands, read {} B from {}, wrote {} B to {}, {} deferred, {} closed",
            self.connections,
            self.applied,
            self.bytes_read,
            self.readable,
            self.bytes_written,
            self.writable,
            self.deferred,
            self.closed
        )
    }
}

/// A registered transport and its owner.
struct Entry {
    id: ConnectionId,
    transport: Transport,
    configuration: ConnectionConfiguration,
    handler: Box<dyn ConnectionHandler>,
    /// Handed out once the transport is established.
    connection: Option<Connection>,
    can_fall_back: bool,
    read_interest: bool,
    write_interest: bool,
    readable: bool,
    writable: bool,
    /// First reason wins, the entry is removed at the end of the pass.
    closing: Option<CloseReason>,
}

impl Entry {
    fn close_with(&mut self, reason: CloseReason) {
        if self.closing.is_none() {
            self.closing = Some(reason);
        }
    }

    fn is_active(&self) -> bool {
        self.closing.is_none()
    }

    fn deliver_inbound(&mut self) {
        loop {
            match self.transport.read_available(usize::MAX) {
                Ok(data) if data.is_empty() => break,
                Ok(data) => {
                    if let Some(connection) = &self.connection {
                        self.handler.on_data(connection, data);
                    }
                }
                Err(e) => {
                    self.close_with(e.into());
                    break;
                }
            }
        }
    }
}

/// Anything connected endpoints can be handed to.
///
/// Implemented by a single loop's [`MultiplexerHandle`] and by
/// [`MultiplexerPool`], which routes to one of its loops.
pub trait Registry {
    /// Queue a connected endpoint for registration.
    fn register_endpoint(
        &self,
        endpoint: TransportEndpoint,
        origin: Origin,
        configuration: ConnectionConfiguration,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<ConnectionId, ConnectionError>;
}

/// Queue-based handle to a running [`Multiplexer`].
#[derive(Debug, Clone)]
pub struct MultiplexerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl MultiplexerHandle {
    /// Hand a connected endpoint to the multiplexer.
    ///
    /// The transport joins the polled set at the start of the next pass and
    /// starts negotiating. `handler` hears about establishment, data and
    /// closure.
    pub fn register(
        &self,
        endpoint: TransportEndpoint,
        origin: Origin,
        configuration: ConnectionConfiguration,
        handler: impl ConnectionHandler + 'static,
    ) -> Result<ConnectionId, ConnectionError> {
        self.register_endpoint(endpoint, origin, configuration, Box::new(handler))
    }

    /// Dial `endpoint` and register the resulting connection.
    ///
    /// Dial failures are returned here and the handler is never called.
    /// Anything after the dial is reported to the handler.
    pub async fn connect(
        &self,
        endpoint: ProtocolEndpoint,
        configuration: ConnectionConfiguration,
        handler: impl ConnectionHandler + 'static,
    ) -> Result<ConnectionId, ConnectionError> {
        if self.commands.is_closed() {
            return Err(ConnectionError::MultiplexerShutdown);
        }
        let transport_endpoint = dial(Arc::new(endpoint), configuration.connect_timeout).await?;
        log::debug!("Dialed {endpoint}, registering");
        self.register(transport_endpoint, Origin::Outbound, configuration, handler)
    }

    /// Close a registered connection by id, established or not.
    ///
    /// Queued like every other request. Closing an unknown or already closed
    /// connection does nothing, the handler hears about the first close only.
    pub fn close(&self, id: ConnectionId, reason: impl Into<String>) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::Close {
                id,
                reason: CloseReason::Local(reason.into()),
            })
            .map_err(|_| ConnectionError::MultiplexerShutdown)
    }

    /// Replace the rate limits, effective from the next pass.
    pub fn set_rate_limits(&self, configuration: RateConfiguration) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::SetRateLimits(configuration))
            .map_err(|_| ConnectionError::MultiplexerShutdown)
    }

    /// Close every connection and stop the loop.
    pub fn shutdown(&self) {
        // Already gone is fine.
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Whether the loop has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl Registry for MultiplexerHandle {
    fn register_endpoint(
        &self,
        endpoint: TransportEndpoint,
        origin: Origin,
        configuration: ConnectionConfiguration,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<ConnectionId, ConnectionError> {
        let id = ConnectionId::next();
        self.commands
            .send(Command::Register {
                id,
                endpoint,
                origin,
                configuration,
                handler,
                can_fall_back: true,
            })
            .map_err(|_| ConnectionError::MultiplexerShutdown)?;
        Ok(id)
    }
}

/// A single-task event loop driving many transports.
pub struct Multiplexer {
    configuration: MultiplexerConfiguration,
    rate: SharedRateController,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Weak so the loop never keeps its own queue open. Established
    /// connections hold strong senders.
    sender: mpsc::WeakUnboundedSender<Command>,
    /// Commands that arrived during a readiness wait, applied next pass.
    deferred: VecDeque<Command>,
    entries: Vec<Entry>,
    rotation: usize,
    disconnected: bool,
    shut_down: bool,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("configuration", &self.configuration)
            .field("connections", &self.entries.len())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl Multiplexer {
    /// Create a loop and the handle used to feed it.
    ///
    /// The rate controller may be shared with other loops, they then divide
    /// one budget between them.
    pub fn new(
        configuration: MultiplexerConfiguration,
        rate: SharedRateController,
    ) -> (Self, MultiplexerHandle) {
        let (sender, commands) = mpsc::unbounded_channel();
        let multiplexer = Self {
            configuration,
            rate,
            commands,
            sender: sender.downgrade(),
            deferred: VecDeque::new(),
            entries: Vec::new(),
            rotation: 0,
            disconnected: false,
            shut_down: false,
        };
        (multiplexer, MultiplexerHandle { commands: sender })
    }

    /// Number of registered connections.
    pub fn connections(&self) -> usize {
        self.entries.len()
    }

    /// Whether the loop has shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Run passes until shut down.
    ///
    /// Ends after [`MultiplexerHandle::shutdown`], or once every handle has
    /// been dropped and every established connection has ended. Registered
    /// connections keep the loop alive until they close or idle out.
    pub async fn run(mut self) {
        log::debug!("Multiplexer started ({})", self.configuration);
        while !self.shut_down {
            let report = self.run_pass().await;
            log::trace!("Pass: {report}");
        }
        log::debug!("Multiplexer stopped");
    }

    /// Run one scheduling pass.
    pub async fn run_pass(&mut self) -> PassReport {
        let mut report = PassReport {
            applied: self.apply_commands(),
            ..Default::default()
        };
        report.connections = self.entries.len();
        if self.shut_down {
            return report;
        }

        let now = Instant::now();
        self.refresh_interest(now);
        self.wait_ready().await;

        let now = Instant::now();
        self.rate.lock().refill(now);
        self.read_phase(now, &mut report);
        self.write_phase(now, &mut report);
        self.housekeeping(now);
        report.closed = self.finish_closed();

        if !self.entries.is_empty() {
            self.rotation = (self.rotation + 1) % self.entries.len();
        }
        report
    }

    fn apply_commands(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let command = match self.deferred.pop_front() {
                Some(command) => command,
                None => match self.commands.try_recv() {
                    Ok(command) => command,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.disconnected = true;
                        break;
                    }
                },
            };
            applied += 1;
            self.apply(command);
        }

        if self.disconnected && !self.shut_down {
            log::debug!("All multiplexer handles dropped, shutting down");
            self.shutdown();
        }
        applied
    }

    fn apply(&mut self, command: Command) {
        log::trace!("Applying {command:?}");
        match command {
            Command::Register {
                id,
                endpoint,
                origin,
                configuration,
                mut handler,
                can_fall_back,
            } => {
                if self.shut_down {
                    let mut endpoint = endpoint;
                    endpoint.close();
                    handler.on_closed(id, CloseReason::Shutdown);
                    return;
                }
                self.register(id, endpoint, origin, configuration, handler, can_fall_back);
            }
            Command::Send { id, data } => {
                if let Some(entry) = self.entry_mut(id) {
                    entry.transport.touch(Instant::now());
                    if let Err(e) = entry.transport.write_queued(data) {
                        entry.close_with(e.into());
                    }
                }
            }
            Command::Close { id, reason } => {
                if let Some(index) = self.entries.iter().position(|entry| entry.id == id) {
                    let entry = self.entries.swap_remove(index);
                    self.finish(entry, reason);
                }
            }
            Command::SetRateLimits(configuration) => {
                log::info!("Rate limits changed to {configuration}");
                self.rate.lock().set_limits(&configuration);
            }
            Command::Abandon {
                id,
                mut handler,
                error,
            } => {
                log::debug!("Plaintext fallback for {id} failed: {error}");
                handler.on_closed(id, CloseReason::Connect(error));
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    fn register(
        &mut self,
        id: ConnectionId,
        endpoint: TransportEndpoint,
        origin: Origin,
        configuration: ConnectionConfiguration,
        handler: Box<dyn ConnectionHandler>,
        can_fall_back: bool,
    ) {
        let now = Instant::now();
        let mut transport = Transport::new(endpoint, origin, &configuration, now);
        log::debug!(
            "Registering {id} {origin} {} ({})",
            transport.protocol_endpoint(),
            configuration.encryption_policy
        );
        let started = transport.begin_handshake(now);

        let mut entry = Entry {
            id,
            transport,
            configuration,
            handler,
            connection: None,
            can_fall_back,
            read_interest: false,
            write_interest: false,
            readable: false,
            writable: false,
            closing: None,
        };
        match started {
            Ok(Some(mode)) => establish(&self.sender, &mut entry, mode),
            Ok(None) => {}
            Err(e) => entry.close_with(e.into()),
        }
        self.entries.push(entry);
    }

    fn entry_mut(&mut self, id: ConnectionId) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == id && entry.is_active())
    }

    fn refresh_interest(&mut self, now: Instant) {
        let (download, upload) = {
            let rate = self.rate.lock();
            (
                rate.has_budget(Direction::Download),
                rate.has_budget(Direction::Upload),
            )
        };

        for entry in self.entries.iter_mut() {
            entry.readable = false;
            entry.writable = false;
            let active = entry.is_active();
            entry.read_interest = active
                && download
                && entry.transport.wants_read()
                && entry.transport.has_allowance(Direction::Download, now);
            entry.write_interest = active
                && upload
                && entry.transport.wants_write()
                && entry.transport.has_allowance(Direction::Upload, now);
        }
    }

    /// Wait for readiness on any socket with interest, or for a new command.
    async fn wait_ready(&mut self) {
        let poll_interval = self.configuration.poll_interval;
        let entries = &mut self.entries;
        let commands = &mut self.commands;
        let deferred = &mut self.deferred;
        let disconnected = &mut self.disconnected;

        let ready = std::future::poll_fn(|cx| {
            let mut ready = false;
            for entry in entries.iter_mut() {
                // Errors count as ready, the following read or write reports them.
                if entry.read_interest && entry.transport.poll_read_ready(cx).is_ready() {
                    entry.readable = true;
                    ready = true;
                }
                if entry.write_interest && entry.transport.poll_write_ready(cx).is_ready() {
                    entry.writable = true;
                    ready = true;
                }
            }
            if !*disconnected {
                match commands.poll_recv(cx) {
                    Poll::Ready(Some(command)) => {
                        deferred.push_back(command);
                        ready = true;
                    }
                    Poll::Ready(None) => {
                        *disconnected = true;
                        ready = true;
                    }
                    Poll::Pending => {}
                }
            }
            if ready {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        });

        // Elapsing is normal, housekeeping still has to run.
        let _ = tokio::time::timeout(poll_interval, ready).await;
    }

    /// Connection indices starting at the rotation point.
    fn rotated(&self) -> Vec<usize> {
        let len = self.entries.len();
        (0..len).map(|k| (k + self.rotation) % len).collect()
    }

    fn read_phase(&mut self, now: Instant, report: &mut PassReport) {
        let chunk = self.configuration.read_chunk_size;
        let mut candidates = Vec::new();
        for i in self.rotated() {
            let entry = &mut self.entries[i];
            if !entry.readable || !entry.is_active() {
                continue;
            }
            let request = chunk.min(entry.transport.allowance(Direction::Download, now));
            if request > 0 {
                candidates.push((i, request));
            }
        }
        if candidates.is_empty() {
            return;
        }

        let grants = reserve(&self.rate, Direction::Download, &candidates);
        let mut settled = Vec::with_capacity(grants.len());

        for (i, granted) in grants {
            if granted == 0 {
                report.deferred += 1;
                continue;
            }
            report.readable += 1;

            let entry = &mut self.entries[i];
            let used = match entry.transport.read_socket(granted, now) {
                Ok(progress) => {
                    if let Some(mode) = progress.established {
                        establish(&self.sender, entry, mode);
                    }
                    if progress.eof {
                        log::debug!("Peer ended connection {}, draining", entry.id);
                    }
                    entry.deliver_inbound();
                    progress.bytes
                }
                Err(e) => {
                    entry.close_with(e.into());
                    0
                }
            };
            report.bytes_read += used;
            settled.push((granted, used));
        }

        settle(&self.rate, Direction::Download, &settled);
    }

    fn write_phase(&mut self, now: Instant, report: &mut PassReport) {
        // Bytes queued during this pass, handshake replies included, go out
        // right away as long as there is budget.
        let has_budget = self.rate.lock().has_budget(Direction::Upload);
        let mut candidates = Vec::new();
        for i in self.rotated() {
            let entry = &mut self.entries[i];
            if !entry.is_active() || !entry.transport.wants_write() {
                continue;
            }
            if !entry.writable
                && !(has_budget && entry.transport.has_allowance(Direction::Upload, now))
            {
                report.deferred += 1;
                continue;
            }
            let allowance = entry.transport.allowance(Direction::Upload, now);
            let request = entry.transport.queued_bytes().min(allowance);
            if request > 0 {
                candidates.push((i, request));
            }
        }
        if candidates.is_empty() {
            return;
        }

        let grants = reserve(&self.rate, Direction::Upload, &candidates);
        let mut settled = Vec::with_capacity(grants.len());

        for (i, granted) in grants {
            if granted == 0 {
                report.deferred += 1;
                continue;
            }

            let entry = &mut self.entries[i];
            let used = match entry.transport.write_socket(granted, now) {
                Ok(written) => written,
                Err(e) => {
                    entry.close_with(e.into());
                    0
                }
            };
            if used > 0 {
                report.writable += 1;
            }
            report.bytes_written += used;
            settled.push((granted, used));
        }

        settle(&self.rate, Direction::Upload, &settled);
    }

    fn housekeeping(&mut self, now: Instant) {
        for entry in self.entries.iter_mut().filter(|entry| entry.is_active()) {
            if let Some(negotiating) = entry.transport.negotiating_for(now) {
                if negotiating >= entry.configuration.handshake_timeout {
                    if let Some(err) = entry.transport.expire_handshake() {
                        log::debug!("Handshake with {} timed out", entry.id);
                        entry.close_with(CloseReason::Handshake(err));
                    }
                }
            } else if entry.transport.idle_for(now) >= entry.configuration.idle_timeout
                && !entry.transport.has_queued()
            {
                log::debug!("Connection {} idle, closing", entry.id);
                entry.close_with(CloseReason::IdleTimeout);
            }
        }
    }

    fn finish_closed(&mut self) -> usize {
        let mut closed = 0;
        let mut i = self.entries.len();
        while i > 0 {
            i -= 1;
            if self.entries[i].closing.is_some() {
                let mut entry = self.entries.swap_remove(i);
                if let Some(reason) = entry.closing.take() {
                    self.finish(entry, reason);
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Release a deregistered entry and notify its owner, unless a plaintext
    /// re-dial takes over.
    fn finish(&mut self, mut entry: Entry, reason: CloseReason) {
        if self.should_fall_back(&entry, &reason) {
            if let Some(sender) = self.sender.upgrade() {
                fall_back(entry, sender, reason);
                return;
            }
        }

        entry.transport.close();
        if let Some(connection) = &entry.connection {
            connection.mark_closed();
        }
        match &reason {
            CloseReason::Handshake(HandshakeError::PolicyViolation { .. }) => {
                log::warn!("Connection {} refused: {reason}", entry.id)
            }
            _ => log::debug!("Connection {} closed: {reason}", entry.id),
        }
        entry.handler.on_closed(entry.id, reason);
    }

    fn should_fall_back(&self, entry: &Entry, reason: &CloseReason) -> bool {
        self.configuration.fallback_to_plaintext
            && !self.shut_down
            && entry.can_fall_back
            && entry.connection.is_none()
            && entry.transport.origin() == Origin::Outbound
            && entry.transport.policy() == EncryptionPolicy::EncryptedPreferred
            && matches!(
                reason,
                CloseReason::Handshake(HandshakeError::Rejected | HandshakeError::Timeout)
            )
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        log::debug!("Shutting down {} connections", self.entries.len());
        self.shut_down = true;
        for entry in std::mem::take(&mut self.entries) {
            self.finish(entry, CloseReason::Shutdown);
        }
        // Anything still queued is answered, registrations included.
        self.commands.close();
        while let Some(command) = self.deferred.pop_front() {
            self.apply(command);
        }
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }
}

/// Hand the owner a connection once framing is settled.
fn establish(sender: &mpsc::WeakUnboundedSender<Command>, entry: &mut Entry, mode: FramingMode) {
    let Some(commands) = sender.upgrade() else {
        entry.close_with(CloseReason::Shutdown);
        return;
    };
    let connection = Connection::new(
        entry.id,
        entry.transport.protocol_endpoint().clone(),
        mode,
        entry.transport.origin(),
        commands,
    );
    log::info!(
        "Connection {} to {} established ({mode}, {})",
        entry.id,
        connection.protocol_endpoint(),
        connection.origin()
    );
    entry.handler.on_established(&connection);
    entry.connection = Some(connection);
}

/// Split the budget for one direction between the candidates and reserve it.
fn reserve(
    rate: &SharedRateController,
    direction: Direction,
    candidates: &[(usize, usize)],
) -> Vec<(usize, usize)> {
    let mut rate = rate.lock();
    rate.begin_pass(direction, candidates.len());
    candidates
        .iter()
        .map(|&(i, request)| (i, rate.grant(direction, request)))
        .collect()
}

/// Charge what was used and return the rest of each grant.
fn settle(rate: &SharedRateController, direction: Direction, settled: &[(usize, usize)]) {
    let mut rate = rate.lock();
    for &(granted, used) in settled {
        rate.settle(direction, granted, used);
    }
}

/// Re-dial in plaintext and hand the result back to the loop.
fn fall_back(entry: Entry, sender: mpsc::UnboundedSender<Command>, reason: CloseReason) {
    let Entry {
        id,
        transport,
        configuration,
        handler,
        ..
    } = entry;
    let endpoint = transport.protocol_endpoint().clone();
    let configuration = configuration.with_encryption_policy(EncryptionPolicy::PlainOnly);
    log::info!("Obfuscated proposal to {endpoint} failed ({reason}), retrying in plaintext");

    tokio::spawn(async move {
        let command = match dial(endpoint, configuration.connect_timeout).await {
            Ok(endpoint) => Command::Register {
                id,
                endpoint,
                origin: Origin::Outbound,
                configuration,
                handler,
                can_fall_back: false,
            },
            Err(error) => Command::Abandon { id, handler, error },
        };
        // The loop shut down meanwhile, the owner still hears the outcome.
        if let Err(mpsc::error::SendError(command)) = sender.send(command) {
            abandoned(command);
        }
    });
}

/// Notify the owner of a re-dial the loop can no longer take.
fn abandoned(command: Command) {
    match command {
        Command::Register {
            id,
            mut endpoint,
            mut handler,
            ..
        } => {
            endpoint.close();
            log::debug!("Plaintext fallback for {id} finished after shutdown");
            handler.on_closed(id, CloseReason::Shutdown);
        }
        Command::Abandon {
            id,
            mut handler,
            error,
        } => handler.on_closed(id, CloseReason::Connect(error)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ChannelHandler, ConnectionEvent};
    use crate::rate::{RateController, RateLimit};
    use crate::transport::mock::MockSocket;
    use crate::transport::DEFAULT_PLAINTEXT_HEADER;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn endpoint() -> TransportEndpoint {
        TransportEndpoint::new(
            Arc::new(ProtocolEndpoint::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881)),
            MockSocket::new(),
        )
    }

    fn mock_endpoint(socket: &MockSocket) -> TransportEndpoint {
        TransportEndpoint::new(
            Arc::new(ProtocolEndpoint::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881)),
            socket.clone(),
        )
    }

    fn plain() -> ConnectionConfiguration {
        ConnectionConfiguration::default().with_encryption_policy(EncryptionPolicy::PlainOnly)
    }

    fn multiplexer(poll_interval: Duration) -> (Multiplexer, MultiplexerHandle) {
        Multiplexer::new(
            MultiplexerConfiguration::default().with_poll_interval(poll_interval),
            RateController::unlimited().shared(),
        )
    }

    fn next_event(events: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        events.try_recv().expect("expected an event")
    }

    #[tokio::test]
    async fn test_registration_during_pass_joins_next_pass() {
        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(500));
        let (handler, _events) = ChannelHandler::new();

        let registrar = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle
                .register(endpoint(), Origin::Inbound, plain(), handler)
                .unwrap();
            handle
        });

        let first = multiplexer.run_pass().await;
        assert_eq!(first.connections, 0);
        assert_eq!(multiplexer.connections(), 0);

        let _handle = registrar.await.unwrap();
        let second = multiplexer.run_pass().await;
        assert_eq!(second.applied, 1);
        assert_eq!(second.connections, 1);
    }

    #[tokio::test]
    async fn test_data_delivered_and_sent() {
        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(10));
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();

        let id = handle
            .register(mock_endpoint(&socket), Origin::Outbound, plain(), handler)
            .unwrap();
        multiplexer.run_pass().await;

        let connection = match next_event(&mut events) {
            ConnectionEvent::Established(connection) => connection,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(connection.id(), id);
        assert_eq!(connection.framing(), FramingMode::Plain);

        socket.push_incoming(b"bitfield");
        connection.send(&b"have 7"[..]).unwrap();
        multiplexer.run_pass().await;
        multiplexer.run_pass().await;

        match next_event(&mut events) {
            ConnectionEvent::Data { id: from, data } => {
                assert_eq!(from, id);
                assert_eq!(&data[..], b"bitfield");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(socket.take_outgoing(), b"have 7");
    }

    #[tokio::test]
    async fn test_inbound_detection_feeds_header_to_handler() {
        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(10));
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        handle
            .register(
                mock_endpoint(&socket),
                Origin::Inbound,
                ConnectionConfiguration::default(),
                handler,
            )
            .unwrap();

        socket.push_incoming(DEFAULT_PLAINTEXT_HEADER);
        multiplexer.run_pass().await;
        multiplexer.run_pass().await;

        assert!(matches!(
            next_event(&mut events),
            ConnectionEvent::Established(_)
        ));
        match next_event(&mut events) {
            ConnectionEvent::Data { data, .. } => assert_eq!(&data[..], DEFAULT_PLAINTEXT_HEADER),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_timeout_notifies_once() {
        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(10));
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        let configuration =
            ConnectionConfiguration::default().with_handshake_timeout(Duration::from_millis(30));
        let id = handle
            .register(mock_endpoint(&socket), Origin::Inbound, configuration, handler)
            .unwrap();

        for _ in 0..10 {
            multiplexer.run_pass().await;
        }

        match next_event(&mut events) {
            ConnectionEvent::Closed { id: closed, reason } => {
                assert_eq!(closed, id);
                assert!(matches!(
                    reason,
                    CloseReason::Handshake(HandshakeError::Timeout)
                ));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert_eq!(socket.close_count(), 1);
        assert_eq!(multiplexer.connections(), 0);
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(10));
        let (handler, mut events) = ChannelHandler::new();
        handle
            .register(
                endpoint(),
                Origin::Outbound,
                plain().with_idle_timeout(Duration::from_millis(30)),
                handler,
            )
            .unwrap();

        for _ in 0..10 {
            multiplexer.run_pass().await;
        }
        assert!(matches!(
            next_event(&mut events),
            ConnectionEvent::Established(_)
        ));
        assert!(matches!(
            next_event(&mut events),
            ConnectionEvent::Closed {
                reason: CloseReason::IdleTimeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_applied_before_next_io() {
        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(10));
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        handle
            .register(mock_endpoint(&socket), Origin::Outbound, plain(), handler)
            .unwrap();
        multiplexer.run_pass().await;
        let connection = match next_event(&mut events) {
            ConnectionEvent::Established(connection) => connection,
            other => panic!("unexpected event {other:?}"),
        };

        socket.push_incoming(b"not delivered");
        connection.close("done");
        connection.close("done again");
        assert!(connection.is_closed());
        assert!(matches!(
            connection.send(&b"late"[..]),
            Err(ConnectionError::Closed)
        ));

        multiplexer.run_pass().await;
        multiplexer.run_pass().await;
        match next_event(&mut events) {
            ConnectionEvent::Closed { reason, .. } => {
                assert!(matches!(reason, CloseReason::Local(ref why) if why == "done"))
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert_eq!(socket.close_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_defers() {
        let rate = RateController::new(
            &RateConfiguration::default()
                .with_upload(RateLimit::BytesPerSecond(100))
                .with_burst_cap(Some(100)),
        )
        .shared();
        let (mut multiplexer, handle) = Multiplexer::new(
            MultiplexerConfiguration::default().with_poll_interval(Duration::from_millis(10)),
            rate.clone(),
        );
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        handle
            .register(mock_endpoint(&socket), Origin::Outbound, plain(), handler)
            .unwrap();
        multiplexer.run_pass().await;
        let connection = match next_event(&mut events) {
            ConnectionEvent::Established(connection) => connection,
            other => panic!("unexpected event {other:?}"),
        };

        connection.send(vec![1u8; 1000]).unwrap();
        let report = multiplexer.run_pass().await;
        assert_eq!(report.bytes_written, 100);

        // The bucket is dry, nothing moves until it refills.
        let report = multiplexer.run_pass().await;
        assert!(report.bytes_written < 100);
        assert_eq!(socket.take_outgoing().len(), 100 + report.bytes_written);
        assert!(rate.lock().total_moved(Direction::Upload) >= 100);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(10));
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        handle
            .register(mock_endpoint(&socket), Origin::Inbound, plain(), handler)
            .unwrap();
        multiplexer.run_pass().await;

        handle.shutdown();
        multiplexer.run_pass().await;
        assert!(multiplexer.is_shut_down());
        assert!(matches!(
            next_event(&mut events),
            ConnectionEvent::Closed {
                reason: CloseReason::Shutdown,
                ..
            }
        ));
        assert!(socket.is_closed());
        assert!(matches!(
            handle.set_rate_limits(RateConfiguration::default()),
            Err(ConnectionError::MultiplexerShutdown)
        ));
    }

    #[tokio::test]
    async fn test_close_by_id_while_negotiating() {
        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(10));
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        let id = handle
            .register(
                mock_endpoint(&socket),
                Origin::Inbound,
                ConnectionConfiguration::default(),
                handler,
            )
            .unwrap();
        multiplexer.run_pass().await;
        assert!(events.try_recv().is_err());
        assert_eq!(multiplexer.connections(), 1);

        handle.close(id, "cancelled").unwrap();
        handle.close(id, "cancelled again").unwrap();
        multiplexer.run_pass().await;

        match next_event(&mut events) {
            ConnectionEvent::Closed { id: closed, reason } => {
                assert_eq!(closed, id);
                assert!(matches!(reason, CloseReason::Local(ref why) if why == "cancelled"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert_eq!(socket.close_count(), 1);
        assert_eq!(multiplexer.connections(), 0);
    }

    #[tokio::test]
    async fn test_fallback_in_flight_at_shutdown_notifies_owner() {
        // Accepts nothing, the kernel backlog completes the re-dial.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(10));
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        socket.close_incoming();
        let id = handle
            .register(
                TransportEndpoint::new(Arc::new(ProtocolEndpoint::from(address)), socket.clone()),
                Origin::Outbound,
                ConnectionConfiguration::default(),
                handler,
            )
            .unwrap();

        // The peer hangs up on the proposal, a plaintext re-dial starts.
        multiplexer.run_pass().await;
        assert_eq!(multiplexer.connections(), 0);
        assert!(events.try_recv().is_err());

        handle.shutdown();
        multiplexer.run_pass().await;
        assert!(multiplexer.is_shut_down());

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no close notification after shutdown")
            .expect("handler dropped without a close notification");
        match event {
            ConnectionEvent::Closed { id: closed, reason } => {
                assert_eq!(closed, id);
                assert!(matches!(reason, CloseReason::Shutdown));
            }
            other => panic!("unexpected event {other:?}"),
        }
        drop(listener);
    }

    #[tokio::test]
    async fn test_set_rate_limits_applies_next_pass() {
        let rate = RateController::unlimited().shared();
        let (mut multiplexer, handle) = Multiplexer::new(
            MultiplexerConfiguration::default().with_poll_interval(Duration::from_millis(10)),
            rate.clone(),
        );
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        handle
            .register(mock_endpoint(&socket), Origin::Outbound, plain(), handler)
            .unwrap();
        multiplexer.run_pass().await;
        let connection = match next_event(&mut events) {
            ConnectionEvent::Established(connection) => connection,
            other => panic!("unexpected event {other:?}"),
        };

        handle
            .set_rate_limits(
                RateConfiguration::default()
                    .with_upload(RateLimit::BytesPerSecond(100))
                    .with_burst_cap(Some(100)),
            )
            .unwrap();
        connection.send(vec![3u8; 1000]).unwrap();
        let report = multiplexer.run_pass().await;

        assert_eq!(report.applied, 2);
        assert_eq!(report.bytes_written, 100);
        assert_eq!(socket.take_outgoing().len(), 100);
        assert!(!rate.lock().is_unlimited(Direction::Upload));
        assert_eq!(rate.lock().total_moved(Direction::Upload), 100);
    }

    #[tokio::test]
    async fn test_connection_sub_limit_caps_writes() {
        let (mut multiplexer, handle) = multiplexer(Duration::from_millis(10));
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        handle
            .register(
                mock_endpoint(&socket),
                Origin::Outbound,
                plain().with_upload_limit(RateLimit::BytesPerSecond(100)),
                handler,
            )
            .unwrap();
        multiplexer.run_pass().await;
        let connection = match next_event(&mut events) {
            ConnectionEvent::Established(connection) => connection,
            other => panic!("unexpected event {other:?}"),
        };

        // The global budget is unlimited, the connection's own bucket holds 200.
        connection.send(vec![5u8; 1000]).unwrap();
        let first = multiplexer.run_pass().await;
        assert_eq!(first.bytes_written, 200);

        let second = multiplexer.run_pass().await;
        assert!(second.bytes_written < 200);
        assert_eq!(socket.take_outgoing().len(), 200 + second.bytes_written);
    }

    #[tokio::test]
    async fn test_idle_timeout_waits_for_queued_bytes() {
        let rate = RateController::new(
            &RateConfiguration::default()
                .with_upload(RateLimit::BytesPerSecond(100))
                .with_burst_cap(Some(100)),
        )
        .shared();
        let (mut multiplexer, handle) = Multiplexer::new(
            MultiplexerConfiguration::default().with_poll_interval(Duration::from_millis(10)),
            rate,
        );
        let (handler, mut events) = ChannelHandler::new();
        let socket = MockSocket::new();
        handle
            .register(
                mock_endpoint(&socket),
                Origin::Outbound,
                plain().with_idle_timeout(Duration::from_millis(30)),
                handler,
            )
            .unwrap();
        multiplexer.run_pass().await;
        let connection = match next_event(&mut events) {
            ConnectionEvent::Established(connection) => connection,
            other => panic!("unexpected event {other:?}"),
        };

        connection.send(vec![9u8; 1000]).unwrap();
        for _ in 0..10 {
            multiplexer.run_pass().await;
        }

        // Well past the idle timeout, but most of the payload is still queued.
        assert!(events.try_recv().is_err());
        assert_eq!(multiplexer.connections(), 1);
        assert!(!connection.is_closed());
        assert!(socket.take_outgoing().len() < 1000);
    }
}
