//! Retry engine: bounded re-attempts over classified upstream results.
//!
//! The loop is pure over `Result` values: the operation reports a classified
//! [`UpstreamError`] and the engine decides, from the error kind and the
//! remaining budget, whether to sleep and go again. Rate-limit responses are
//! retried at most once per run and honor the upstream `Retry-After` hint;
//! everything non-retryable passes straight through.

use crate::backoff::Backoff;
use crate::error::{ErrorKind, UpstreamError};
use crate::jitter::Jitter;
use crate::time::{Clock, Deadline, MonotonicClock, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Cap on recorded failure kinds to keep reports bounded.
const MAX_RECORDED_FAILURES: usize = 10;

/// Outcome of a retry run: the final result plus the attempt accounting the
/// failover controller folds into its diagnostics.
#[derive(Debug)]
pub struct RetryReport<T> {
    pub result: Result<T, UpstreamError>,
    /// Number of attempts actually made (1-indexed; at least 1).
    pub attempts: u32,
    /// Failure kinds observed along the way, oldest first, capped.
    pub failures: Vec<ErrorKind>,
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

/// Errors returned when building a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBuildError {
    /// `max_attempts` must be greater than zero.
    InvalidMaxAttempts(u32),
}

impl std::fmt::Display for RetryBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryBuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for RetryBuildError {}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails non-retryably, or the
    /// attempt/deadline budget runs out. The closure receives the 1-indexed
    /// attempt number.
    pub async fn run<T, F, Fut>(&self, deadline: Option<Deadline>, mut operation: F) -> RetryReport<T>
    where
        T: Send,
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, UpstreamError>> + Send,
    {
        let mut failures = Vec::new();
        let mut rate_limit_retries: u32 = 0;

        for attempt in 1..=self.max_attempts {
            let error = match operation(attempt).await {
                Ok(value) => {
                    return RetryReport { result: Ok(value), attempts: attempt, failures };
                }
                Err(e) => e,
            };

            if failures.len() < MAX_RECORDED_FAILURES {
                failures.push(error.kind);
            }

            if !error.is_retryable() || attempt >= self.max_attempts {
                return RetryReport { result: Err(error), attempts: attempt, failures };
            }

            // A rate-limit answer gets one respectful re-attempt, not a
            // hammering loop; the credential pool handles the rest.
            if error.kind == ErrorKind::RateLimited {
                if rate_limit_retries >= 1 {
                    return RetryReport { result: Err(error), attempts: attempt, failures };
                }
                rate_limit_retries += 1;
            }

            let mut delay = self.jitter.apply(self.backoff.delay(attempt));
            if let Some(hint) = error.retry_after {
                delay = delay.max(hint);
            }

            if let Some(deadline) = deadline {
                if deadline.expired(self.clock.as_ref()) {
                    return RetryReport { result: Err(error), attempts: attempt, failures };
                }
                delay = deadline.clamp(delay, self.clock.as_ref());
            }

            tracing::debug!(
                attempt,
                max_attempts = self.max_attempts,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                "retrying upstream call"
            );
            self.sleeper.sleep(delay).await;

            if let Some(deadline) = deadline {
                if deadline.expired(self.clock.as_ref()) {
                    return RetryReport {
                        result: Err(UpstreamError::timeout("deadline exceeded during backoff")),
                        attempts: attempt,
                        failures,
                    };
                }
            }
        }

        unreachable!("retry loop returns from within the final attempt")
    }
}

pub struct RetryPolicyBuilder {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(500)),
            jitter: Jitter::proportional(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Result<Self, RetryBuildError> {
        if attempts == 0 {
            return Err(RetryBuildError::InvalidMaxAttempts(attempts));
        }
        self.max_attempts = attempts;
        Ok(self)
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            sleeper: self.sleeper,
            clock: self.clock,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
