//! Bandwidth control using token buckets.
//!
//! One bucket per direction holds the bytes the whole process may still move.
//! Buckets refill continuously at the configured rate and are capped at the
//! burst size, so an idle period can't bank unbounded credit.
//!
//! The multiplexer talks to the [`RateController`] in three steps per pass and
//! direction:
//!
//! 1. [`RateController::begin_pass`] with the number of connections that are
//!    ready and actually want to move bytes. This fixes each connection's
//!    share of the currently available budget.
//! 2. [`RateController::grant`] per connection, which reserves at most that
//!    share.
//! 3. [`RateController::settle`] with the bytes the socket actually took. The
//!    unused part of the reservation goes straight back to the bucket.
//!
//! A zero grant is not an error, the connection is just skipped until a later
//! pass finds budget again.
//!
//! # Example
//!
//! ```
//! use swarmwire_connection::{Direction, RateConfiguration, RateController, RateLimit};
//!
//! let config = RateConfiguration::default()
//!     .with_upload(RateLimit::BytesPerSecond(1_000))
//!     .with_burst_cap(Some(1_000));
//! let mut rate = RateController::new(&config);
//!
//! // Two connections have data queued this pass.
//! rate.begin_pass(Direction::Upload, 2);
//! let granted = rate.grant(Direction::Upload, 16_384);
//! assert_eq!(granted, 500);
//!
//! // The socket only took 200 bytes, the other 300 return to the pool.
//! rate.settle(Direction::Upload, granted, 200);
//! assert_eq!(rate.available(Direction::Upload), 800);
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Smallest budget worth waking up for.
///
/// Below this (or below the bucket capacity, if that's smaller) a direction
/// is treated as exhausted until the next refill. Stops the loop from spinning
/// a pass for every handful of bytes.
pub const MIN_GRANT: u64 = 512;

/// Traffic direction, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes we send to peers.
    Upload,
    /// Bytes we receive from peers.
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// A bandwidth limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimit {
    /// No limit, every request is granted in full.
    #[default]
    Unlimited,
    /// At most this many bytes per second on average.
    BytesPerSecond(u64),
}

impl From<u64> for RateLimit {
    /// A limit of 0 means unlimited.
    fn from(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            RateLimit::Unlimited
        } else {
            RateLimit::BytesPerSecond(bytes_per_sec)
        }
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimit::Unlimited => write!(f, "unlimited"),
            RateLimit::BytesPerSecond(rate) => write!(f, "{rate} B/s"),
        }
    }
}

/// A token bucket holding a replenishing budget of bytes.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens added per second, `None` when unlimited.
    tokens_per_sec: Option<f64>,
    max_tokens: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a new, full bucket.
    ///
    /// The capacity is `burst_cap`, or twice the rate if not given.
    pub fn new(limit: RateLimit, burst_cap: Option<u64>, now: Instant) -> Self {
        let mut bucket = Self {
            tokens_per_sec: None,
            max_tokens: 0.0,
            tokens: 0.0,
            last_refill: now,
        };
        bucket.set_limit(limit, burst_cap);
        bucket.tokens = bucket.max_tokens;
        bucket
    }

    /// Updates the rate limit, clamping the current tokens to the new capacity.
    pub fn set_limit(&mut self, limit: RateLimit, burst_cap: Option<u64>) {
        match limit {
            RateLimit::Unlimited => {
                self.tokens_per_sec = None;
                self.max_tokens = 0.0;
                self.tokens = 0.0;
            }
            RateLimit::BytesPerSecond(rate) => {
                let was_unlimited = self.tokens_per_sec.is_none();
                self.tokens_per_sec = Some(rate as f64);
                self.max_tokens = burst_cap.unwrap_or(rate.saturating_mul(2)).max(1) as f64;
                self.tokens = if was_unlimited {
                    self.max_tokens
                } else {
                    self.tokens.min(self.max_tokens)
                };
            }
        }
    }

    /// Whether this bucket grants everything.
    pub fn is_unlimited(&self) -> bool {
        self.tokens_per_sec.is_none()
    }

    /// Adds the tokens accumulated since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = self.last_refill.max(now);

        if let Some(rate) = self.tokens_per_sec {
            self.tokens = (self.tokens + elapsed * rate).min(self.max_tokens);
        }
    }

    /// Whole bytes currently available. `u64::MAX` when unlimited.
    pub fn available(&self) -> u64 {
        if self.is_unlimited() {
            u64::MAX
        } else {
            self.tokens as u64
        }
    }

    /// Maximum tokens the bucket can hold. `u64::MAX` when unlimited.
    pub fn capacity(&self) -> u64 {
        if self.is_unlimited() {
            u64::MAX
        } else {
            self.max_tokens as u64
        }
    }

    /// Takes up to `bytes` tokens and returns how many were taken.
    pub fn take(&mut self, bytes: u64) -> u64 {
        if self.is_unlimited() {
            return bytes;
        }
        let taken = bytes.min(self.available());
        self.tokens -= taken as f64;
        taken
    }

    /// Returns unused tokens to the bucket.
    pub fn give_back(&mut self, bytes: u64) {
        if !self.is_unlimited() {
            self.tokens = (self.tokens + bytes as f64).min(self.max_tokens);
        }
    }

    /// Whether there is enough budget to be worth a pass.
    pub fn has_budget(&self) -> bool {
        self.is_unlimited() || self.available() >= MIN_GRANT.min(self.capacity())
    }
}

/// Process-wide bandwidth limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateConfiguration {
    /// Aggregate upload limit.
    pub upload: RateLimit,
    /// Aggregate download limit.
    pub download: RateLimit,
    /// Bucket capacity in bytes. Defaults to twice the rate if `None`.
    pub burst_cap: Option<u64>,
}

impl RateConfiguration {
    /// Set the aggregate upload limit.
    pub fn with_upload(mut self, limit: RateLimit) -> Self {
        self.upload = limit;
        self
    }

    /// Set the aggregate download limit.
    pub fn with_download(mut self, limit: RateLimit) -> Self {
        self.download = limit;
        self
    }

    /// Set the bucket capacity.
    pub fn with_burst_cap(mut self, burst_cap: Option<u64>) -> Self {
        self.burst_cap = burst_cap;
        self
    }
}

impl fmt::Display for RateConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload: {}, download: {}", self.upload, self.download)?;
        match self.burst_cap {
            Some(cap) => write!(f, ", burst: {cap} B"),
            None => write!(f, ", burst: 2s"),
        }
    }
}

#[derive(Debug, Clone)]
struct Lane {
    bucket: TokenBucket,
    /// Per-connection share fixed at the start of the pass.
    share: u64,
    /// Bytes actually moved, for statistics.
    moved: u64,
}

impl Lane {
    fn new(limit: RateLimit, burst_cap: Option<u64>, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(limit, burst_cap, now),
            share: 0,
            moved: 0,
        }
    }
}

/// Fair-share token bucket limiter for both directions.
#[derive(Debug, Clone)]
pub struct RateController {
    upload: Lane,
    download: Lane,
}

/// A rate controller shared by several multiplexers.
pub type SharedRateController = Arc<Mutex<RateController>>;

impl RateController {
    /// Creates a controller with full buckets.
    pub fn new(config: &RateConfiguration) -> Self {
        Self::starting_at(config, Instant::now())
    }

    /// Creates a controller whose buckets were last refilled at `now`.
    pub fn starting_at(config: &RateConfiguration, now: Instant) -> Self {
        Self {
            upload: Lane::new(config.upload, config.burst_cap, now),
            download: Lane::new(config.download, config.burst_cap, now),
        }
    }

    /// Creates a controller that grants everything.
    pub fn unlimited() -> Self {
        Self::new(&RateConfiguration::default())
    }

    /// Wraps the controller for sharing between multiplexers.
    pub fn shared(self) -> SharedRateController {
        Arc::new(Mutex::new(self))
    }

    fn lane(&self, direction: Direction) -> &Lane {
        match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        }
    }

    fn lane_mut(&mut self, direction: Direction) -> &mut Lane {
        match direction {
            Direction::Upload => &mut self.upload,
            Direction::Download => &mut self.download,
        }
    }

    /// Replaces the limits. Current budgets are clamped to the new capacity.
    pub fn set_limits(&mut self, config: &RateConfiguration) {
        self.upload.bucket.set_limit(config.upload, config.burst_cap);
        self.download
            .bucket
            .set_limit(config.download, config.burst_cap);
    }

    /// Refills both buckets.
    pub fn refill(&mut self, now: Instant) {
        self.upload.bucket.refill(now);
        self.download.bucket.refill(now);
    }

    /// Splits the available budget between `active` connections.
    ///
    /// Only connections that are ready and have something to move count as
    /// active, a zero-byte request must not take a slot.
    pub fn begin_pass(&mut self, direction: Direction, active: usize) {
        let lane = self.lane_mut(direction);
        lane.share = if active == 0 || lane.bucket.is_unlimited() {
            0
        } else {
            lane.bucket.available().div_ceil(active as u64)
        };
    }

    /// Reserves up to `requested` bytes for one connection.
    ///
    /// Returns the reserved amount, which never exceeds the pass share nor the
    /// available budget. The caller must [`settle`](Self::settle) it.
    pub fn grant(&mut self, direction: Direction, requested: usize) -> usize {
        let lane = self.lane_mut(direction);
        if lane.bucket.is_unlimited() {
            return requested;
        }
        let wanted = (requested as u64).min(lane.share);
        lane.bucket.take(wanted) as usize
    }

    /// Charges the bytes actually moved and returns the rest of the grant.
    pub fn settle(&mut self, direction: Direction, granted: usize, used: usize) {
        let lane = self.lane_mut(direction);
        let used = used.min(granted);
        lane.moved = lane.moved.saturating_add(used as u64);
        lane.bucket.give_back((granted - used) as u64);
    }

    /// Whether `direction` currently has budget worth a pass.
    pub fn has_budget(&self, direction: Direction) -> bool {
        self.lane(direction).bucket.has_budget()
    }

    /// Bytes currently available in `direction`. `u64::MAX` when unlimited.
    pub fn available(&self, direction: Direction) -> u64 {
        self.lane(direction).bucket.available()
    }

    /// Whether `direction` is unlimited.
    pub fn is_unlimited(&self, direction: Direction) -> bool {
        self.lane(direction).bucket.is_unlimited()
    }

    /// Total bytes moved in `direction` since creation.
    pub fn total_moved(&self, direction: Direction) -> u64 {
        self.lane(direction).moved
    }
}

impl Default for RateController {
    fn default() -> Self {
        Self::unlimited()
    }
}
