//! Time primitives shared by every policy: clocks, sleepers, deadlines.
//!
//! Timing is injected everywhere so tests run fast and deterministic. The
//! `Clock` gives a monotonic millisecond reading, the `Sleeper` performs
//! (or fakes) waits, and a `Deadline` bounds every suspension point a
//! request can reach.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// Cache entries persist across processes, so their timestamps use wall time
/// rather than the process-relative monotonic clock.
pub fn epoch_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Abstraction for sleeping/waiting.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper using the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that doesn't actually sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {
        // no-op
    }
}

/// Test sleeper that records every requested duration without sleeping.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded sleep calls.
    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// A recorded call duration by index, if present.
    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).get(index).copied()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(duration);
    }
}

/// Absolute point on a [`Clock`] after which an operation must give up.
///
/// The per-request deadline propagates through every wait: cache
/// single-flight, sequential queues, connection-slot waits, and retry
/// backoff sleeps all clamp against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at_millis: u64,
}

impl Deadline {
    /// Deadline `after` from now on the given clock.
    pub fn after(clock: &dyn Clock, after: Duration) -> Self {
        Self { at_millis: clock.now_millis().saturating_add(after.as_millis() as u64) }
    }

    /// Absolute millisecond reading at which this deadline fires.
    pub fn at_millis(&self) -> u64 {
        self.at_millis
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        clock.now_millis() >= self.at_millis
    }

    /// Time left, or `None` once expired.
    pub fn remaining(&self, clock: &dyn Clock) -> Option<Duration> {
        let now = clock.now_millis();
        if now >= self.at_millis {
            None
        } else {
            Some(Duration::from_millis(self.at_millis - now))
        }
    }

    /// Clamp a wait so it never runs past the deadline.
    pub fn clamp(&self, wait: Duration, clock: &dyn Clock) -> Duration {
        match self.remaining(clock) {
            Some(left) => wait.min(left),
            None => Duration::ZERO,
        }
    }
}
