//! Rate-limit algorithms: token bucket, sliding window, fixed window.
//!
//! Each strategy answers a single question for one key: may this event pass
//! right now, and if not, when should the caller come back. State is plain
//! data; the evaluator in the parent module owns locking.

use std::collections::VecDeque;
use std::time::Duration;

/// Result of one algorithm evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgoDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the window fully resets.
    pub reset_after: Duration,
    /// Wait suggested to a denied caller.
    pub retry_after: Option<Duration>,
}

/// Token bucket: capacity `rate * burst`, refilled continuously at
/// `rate / window`. One token per decision.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_ms: f64,
    tokens: f64,
    updated_at: u64,
    limit: u32,
}

impl TokenBucket {
    pub fn new(rate: u32, window: Duration, burst_multiplier: f64, now: u64) -> Self {
        let capacity = (rate as f64 * burst_multiplier.max(1.0)).max(1.0);
        let window_ms = window.as_millis().max(1) as f64;
        Self {
            capacity,
            refill_per_ms: rate as f64 / window_ms,
            tokens: capacity,
            updated_at: now,
            limit: rate,
        }
    }

    pub fn check(&mut self, now: u64) -> AlgoDecision {
        let elapsed = now.saturating_sub(self.updated_at) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.updated_at = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            let refill_ms = (self.capacity - self.tokens) / self.refill_per_ms;
            AlgoDecision {
                allowed: true,
                limit: self.limit,
                remaining: self.tokens as u32,
                reset_after: Duration::from_millis(refill_ms as u64),
                retry_after: None,
            }
        } else {
            let wait_ms = ((1.0 - self.tokens) / self.refill_per_ms).ceil();
            AlgoDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_after: Duration::from_millis(
                    ((self.capacity - self.tokens) / self.refill_per_ms) as u64,
                ),
                retry_after: Some(Duration::from_millis(wait_ms as u64)),
            }
        }
    }

    /// True when the bucket is full and carries no state worth keeping.
    pub fn is_idle(&self, now: u64) -> bool {
        let elapsed = now.saturating_sub(self.updated_at) as f64;
        self.tokens + elapsed * self.refill_per_ms >= self.capacity
    }
}

/// Sliding window: keeps event timestamps and admits while fewer than
/// `limit` fall inside the trailing window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    events: VecDeque<u64>,
    limit: u32,
    window_ms: u64,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            limit,
            window_ms: window.as_millis().max(1) as u64,
        }
    }

    fn prune(&mut self, now: u64) {
        let cutoff = now.saturating_sub(self.window_ms);
        while self.events.front().is_some_and(|&t| t <= cutoff) {
            self.events.pop_front();
        }
    }

    /// Events currently inside the window.
    pub fn count(&mut self, now: u64) -> u32 {
        self.prune(now);
        self.events.len() as u32
    }

    pub fn check(&mut self, now: u64) -> AlgoDecision {
        self.prune(now);
        let count = self.events.len() as u32;

        if count < self.limit {
            self.events.push_back(now);
            let reset_after = self
                .events
                .front()
                .map(|&oldest| Duration::from_millis((oldest + self.window_ms).saturating_sub(now)))
                .unwrap_or(Duration::ZERO);
            AlgoDecision {
                allowed: true,
                limit: self.limit,
                remaining: self.limit - count - 1,
                reset_after,
                retry_after: None,
            }
        } else {
            let oldest = self.events.front().copied().unwrap_or(now);
            let wait = Duration::from_millis((oldest + self.window_ms).saturating_sub(now).max(1));
            AlgoDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_after: wait,
                retry_after: Some(wait),
            }
        }
    }

    pub fn is_idle(&mut self, now: u64) -> bool {
        self.prune(now);
        self.events.is_empty()
    }
}

/// Sliding sum of weighted amounts (e.g. tokens consumed per minute).
/// Same pruning discipline as [`SlidingWindow`], but each event carries a
/// weight and the question is "how much was spent in the window".
#[derive(Debug, Clone, Default)]
pub struct WindowedSum {
    entries: VecDeque<(u64, u64)>,
    window_ms: u64,
}

impl WindowedSum {
    pub fn new(window: Duration) -> Self {
        Self { entries: VecDeque::new(), window_ms: window.as_millis().max(1) as u64 }
    }

    fn prune(&mut self, now: u64) {
        let cutoff = now.saturating_sub(self.window_ms);
        while self.entries.front().is_some_and(|&(t, _)| t <= cutoff) {
            self.entries.pop_front();
        }
    }

    pub fn record(&mut self, now: u64, amount: u64) {
        self.prune(now);
        self.entries.push_back((now, amount));
    }

    pub fn sum(&mut self, now: u64) -> u64 {
        self.prune(now);
        self.entries.iter().map(|&(_, amount)| amount).sum()
    }
}

/// Fixed window: plain counter zeroed when the window rolls over.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    count: u32,
    window_start: u64,
    limit: u32,
    window_ms: u64,
}

impl FixedWindow {
    pub fn new(limit: u32, window: Duration, now: u64) -> Self {
        Self { count: 0, window_start: now, limit, window_ms: window.as_millis().max(1) as u64 }
    }

    pub fn check(&mut self, now: u64) -> AlgoDecision {
        if now.saturating_sub(self.window_start) >= self.window_ms {
            self.window_start = now;
            self.count = 0;
        }
        let reset_after =
            Duration::from_millis((self.window_start + self.window_ms).saturating_sub(now));

        if self.count < self.limit {
            self.count += 1;
            AlgoDecision {
                allowed: true,
                limit: self.limit,
                remaining: self.limit - self.count,
                reset_after,
                retry_after: None,
            }
        } else {
            AlgoDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_after,
                retry_after: Some(reset_after),
            }
        }
    }

    pub fn is_idle(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) >= self.window_ms
    }
}
