//! Backoff schedules for the retry engine.

use std::time::Duration;

/// Upper bound applied to every schedule unless a tighter cap is set.
/// Guards accidental multi-hour sleeps from misconfigured multipliers.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Fixed delay between retries.
    Constant { delay: Duration },
    /// Linearly increasing delay, capped.
    Linear { base: Duration, max: Duration },
    /// `min(max, base * multiplier^(attempt - 1))`.
    Exponential { base: Duration, multiplier: f64, max: Duration },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base, max: MAX_BACKOFF }
    }

    /// Exponential schedule with the conventional doubling multiplier.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, multiplier: 2.0, max: MAX_BACKOFF }
    }

    /// Override the growth factor of an exponential schedule.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        if let Backoff::Exponential { multiplier: ref mut m, .. } = self {
            *m = multiplier.max(1.0);
        }
        self
    }

    /// Cap the delay of a linear or exponential schedule.
    pub fn with_max(mut self, cap: Duration) -> Self {
        match self {
            Backoff::Linear { ref mut max, .. } => *max = cap,
            Backoff::Exponential { ref mut max, .. } => *max = cap,
            Backoff::Constant { .. } => {}
        }
        self
    }

    /// Delay before the given attempt (1-indexed: `delay(1)` is the wait
    /// after the first failure).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base, max } => base
                .checked_mul(attempt.max(1))
                .map(|d| d.min(*max))
                .unwrap_or(*max),
            Backoff::Exponential { base, multiplier, max } => {
                let exponent = attempt.saturating_sub(1).min(63);
                let factor = multiplier.powi(exponent as i32);
                let millis = (base.as_millis() as f64) * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis as u64).min(*max)
                }
            }
        }
    }
}
