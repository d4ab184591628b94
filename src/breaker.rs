//! Per-target circuit breakers and their registry.
//!
//! One breaker guards each `(provider, model)` target. Failures counted in a
//! rolling window trip the breaker OPEN; after `reset_timeout` a bounded
//! number of half-open trials probe the target, and enough consecutive
//! successes close it again. Transitions are serialized through CAS on a
//! single state word.

use crate::error::ErrorKind;
use crate::events::{EventBus, FabricEvent};
use crate::request::Target;
use crate::time::Clock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Failures within the rolling window that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// How long the breaker stays OPEN before allowing a trial.
    pub reset_timeout: Duration,
    /// Rolling window over which failures are counted in CLOSED.
    pub window: Duration,
    /// Concurrent trial calls allowed in HALF_OPEN.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            window: Duration::from_secs(60),
            half_open_max: 1,
        }
    }
}

/// Returned by [`CircuitBreaker::admit`] when the call may proceed; handed
/// back with the outcome so half-open bookkeeping stays balanced.
#[derive(Debug)]
#[must_use = "the ticket must be completed with the call outcome"]
pub struct BreakerTicket {
    half_open: bool,
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejection {
    pub failures: u32,
    /// Time until the next half-open trial may run. Zero when refusal came
    /// from the half-open concurrency cap.
    pub retry_in: Duration,
}

/// Point-in-time view of one breaker, for health reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub target: Target,
    pub state: CircuitState,
    pub failures: u32,
    pub retry_in: Option<Duration>,
}

pub struct CircuitBreaker {
    target: Target,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    state: AtomicU8,
    failures: AtomicU32,
    window_start: AtomicU64,
    opened_at: AtomicU64,
    half_open_successes: AtomicU32,
    half_open_inflight: AtomicU32,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.target)
            .field("state", &self.state())
            .field("failures", &self.failures.load(Ordering::Acquire))
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        target: Target,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            target,
            config,
            clock,
            events,
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicU32::new(0),
            window_start: AtomicU64::new(0),
            opened_at: AtomicU64::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_inflight: AtomicU32::new(0),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Ask whether a call to this target may proceed right now.
    ///
    /// OPEN breakers transition to HALF_OPEN once `reset_timeout` has
    /// elapsed; exactly the CAS winner's caller (plus up to
    /// `half_open_max - 1` concurrent peers) may run a trial.
    pub fn admit(&self) -> Result<BreakerTicket, BreakerRejection> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_CLOSED => return Ok(BreakerTicket { half_open: false }),
                STATE_OPEN => {
                    let opened_at = self.opened_at.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    let reset_millis = self.config.reset_timeout.as_millis() as u64;

                    if elapsed < reset_millis {
                        return Err(BreakerRejection {
                            failures: self.failures.load(Ordering::Acquire),
                            retry_in: Duration::from_millis(reset_millis - elapsed),
                        });
                    }

                    match self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.half_open_successes.store(0, Ordering::Release);
                            self.half_open_inflight.store(1, Ordering::Release);
                            self.transition(CircuitState::Open, CircuitState::HalfOpen);
                            return Ok(BreakerTicket { half_open: true });
                        }
                        // Lost the race; re-evaluate whatever state won.
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let prev = self.half_open_inflight.fetch_add(1, Ordering::AcqRel);
                    if prev >= self.config.half_open_max {
                        self.half_open_inflight.fetch_sub(1, Ordering::Release);
                        return Err(BreakerRejection {
                            failures: self.failures.load(Ordering::Acquire),
                            retry_in: Duration::ZERO,
                        });
                    }
                    return Ok(BreakerTicket { half_open: true });
                }
                _ => unreachable!("invalid breaker state"),
            }
        }
    }

    /// Record the outcome of an admitted call. `kind` filters which failures
    /// count: rate limits and auth errors never trip a breaker.
    pub fn complete(&self, ticket: BreakerTicket, outcome: Result<(), ErrorKind>) {
        if ticket.half_open {
            // Saturating: the state may have been manually reset meanwhile.
            let _ = self.half_open_inflight.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |v| v.checked_sub(1),
            );
        }

        match outcome {
            Ok(()) => self.on_success(),
            Err(kind) if kind.counts_against_breaker() => self.on_failure(),
            // A non-counting failure still ends a half-open trial without
            // progress toward closing.
            Err(_) => {}
        }
    }

    /// Manual reset: force CLOSED and clear all counters.
    pub fn reset(&self) {
        let prev = CircuitState::from_raw(self.state.swap(STATE_CLOSED, Ordering::AcqRel));
        self.failures.store(0, Ordering::Release);
        self.opened_at.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_inflight.store(0, Ordering::Release);
        if prev != CircuitState::Closed {
            self.transition(prev, CircuitState::Closed);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let retry_in = match state {
            CircuitState::Open => {
                let opened_at = self.opened_at.load(Ordering::Acquire);
                let reset = self.config.reset_timeout.as_millis() as u64;
                let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                Some(Duration::from_millis(reset.saturating_sub(elapsed)))
            }
            _ => None,
        };
        BreakerSnapshot {
            target: self.target.clone(),
            state,
            failures: self.failures.load(Ordering::Acquire),
            retry_in,
        }
    }

    fn on_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.failures.store(0, Ordering::Release);
                    self.opened_at.store(0, Ordering::Release);
                    self.transition(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            STATE_CLOSED => {
                // Successes bleed the failure count so sporadic noise never
                // accumulates to the threshold.
                let _ = self.failures.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |v| v.checked_sub(1),
                );
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.opened_at.store(self.clock.now_millis(), Ordering::Release);
                    self.transition(CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            STATE_CLOSED => {
                let now = self.clock.now_millis();
                let window = self.config.window.as_millis() as u64;
                let start = self.window_start.load(Ordering::Acquire);

                let failures = if now.saturating_sub(start) > window {
                    self.window_start.store(now, Ordering::Release);
                    self.failures.store(1, Ordering::Release);
                    1
                } else {
                    self.failures.fetch_add(1, Ordering::AcqRel) + 1
                };

                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.opened_at.store(now, Ordering::Release);
                    self.transition(CircuitState::Closed, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) {
        self.events.emit(FabricEvent::BreakerTransition {
            target: self.target.clone(),
            from,
            to,
        });
    }
}

/// Registry handing out one breaker per target, lazily created with a shared
/// configuration.
pub struct BreakerRegistry {
    inner: Mutex<HashMap<Target, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self { inner: Mutex::new(HashMap::new()), config, clock, events }
    }

    #[cfg(test)]
    pub(crate) fn with_defaults() -> Self {
        Self::new(
            BreakerConfig::default(),
            Arc::new(crate::time::MonotonicClock::default()),
            EventBus::new(),
        )
    }

    /// Fetch the breaker for a target, creating it on first use.
    pub fn get(&self, target: &Target) -> Arc<CircuitBreaker> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(target.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    target.clone(),
                    self.config.clone(),
                    Arc::clone(&self.clock),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    /// Manually reset a breaker. Returns false if the target has never been
    /// seen.
    pub fn reset(&self, target: &Target) -> bool {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match map.get(target) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshot of all known breakers, sorted by target.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<BreakerSnapshot> = map.values().map(|b| b.snapshot()).collect();
        entries.sort_by(|a, b| a.target.cmp(&b.target));
        entries
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("BreakerRegistry").field("breakers", &count).finish()
    }
}
