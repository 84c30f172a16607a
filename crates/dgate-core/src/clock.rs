//! Time sources and the monotonic version clock.
//!
//! Every record the safety store writes and every snapshot version the gate
//! compares carries two timestamps: a wall-clock value for humans and a
//! monotonic millisecond value for ordering. [`Clock`] abstracts both so
//! tests can inject a [`ManualClock`]; [`VersionClock`] layers strict
//! monotonicity and unique version identifiers on top of any clock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Abstraction over time sources for testability and monotonic guarantees.
///
/// Production code injects [`SystemClock`]. Tests inject [`ManualClock`] for
/// deterministic window and cooldown behaviour.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current wall-clock time in milliseconds since UNIX epoch.
    fn now_ms(&self) -> u64;

    /// Returns a non-decreasing millisecond timestamp suitable for ordering.
    ///
    /// The value is anchored to the wall clock at construction so that it is
    /// comparable with persisted timestamps across restarts, but it never
    /// moves backwards when the wall clock is adjusted.
    fn monotonic_ms(&self) -> u64;
}

/// Production clock using `SystemTime` for timestamps and `Instant` for the
/// monotonic component.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin_wall_ms: u64,
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock anchored at the current wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin_wall_ms: wall_clock_ms(),
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        wall_clock_ms()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn monotonic_ms(&self) -> u64 {
        self.origin_wall_ms
            .saturating_add(self.origin.elapsed().as_millis() as u64)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Deterministic clock for tests. Both readings return the same value.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_ms),
        })
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute value.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn monotonic_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Strictly increasing timestamps and unique version identifiers.
///
/// Two calls to [`next_ts`](Self::next_ts) never return the same value, even
/// when the underlying clock has not ticked. Version ids have the form
/// `"<monotonic_ms>-<suffix>"` so their leading component parses as a
/// timestamp (see [`parse_version_ts`]).
#[derive(Debug)]
pub struct VersionClock {
    clock: Arc<dyn Clock>,
    last: AtomicU64,
}

impl VersionClock {
    /// Wraps a clock.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicU64::new(0),
        }
    }

    /// Returns the underlying clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns a timestamp strictly greater than every previous one.
    pub fn next_ts(&self) -> u64 {
        let now = self.clock.monotonic_ms();
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Returns a fresh `(version_id, monotonic_ts_ms)` pair.
    pub fn next_version(&self) -> (String, u64) {
        let ts = self.next_ts();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        (format!("{ts}-{}", &suffix[..8]), ts)
    }
}

/// Parses a memory version string into a millisecond timestamp.
///
/// Accepted forms:
/// - `"1712345678901"` (bare milliseconds)
/// - `"1712345678901-3fa9c2d1"` (version id from [`VersionClock`])
/// - an RFC 3339 timestamp such as `"2024-04-05T10:01:18.901Z"`
#[must_use]
pub fn parse_version_ts(version: &str) -> Option<u64> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return u64::try_from(dt.timestamp_millis()).ok();
    }
    let head = trimmed.split_once('-').map_or(trimmed, |(head, _)| head);
    if !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()) {
        return head.parse().ok();
    }
    None
}

/// Formats a millisecond timestamp as RFC 3339 with millisecond precision.
#[must_use]
pub fn rfc3339_ms(ts_ms: u64) -> String {
    let secs = i64::try_from(ts_ms / 1000).unwrap_or(i64::MAX);
    #[allow(clippy::cast_possible_truncation)]
    let nanos = ((ts_ms % 1000) * 1_000_000) as u32;
    chrono::DateTime::from_timestamp(secs, nanos).map_or_else(
        || ts_ms.to_string(),
        |dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    )
}
