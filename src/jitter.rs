//! Jitter strategies to prevent synchronized retries.

use rand::Rng;
use std::time::Duration;

/// Randomization applied to a computed backoff delay.
#[derive(Debug, Clone, PartialEq)]
pub enum Jitter {
    /// No jitter, use the exact delay.
    None,
    /// Random in `[0, delay]`.
    Full,
    /// Random in `[delay/2, delay]`.
    Equal,
    /// Multiply the delay by a uniform random factor. The retry engine
    /// defaults to `[0.5, 1.5]`.
    Proportional { min_factor: f64, max_factor: f64 },
    /// AWS-style decorrelated jitter: `random(base, delay * 3)`, capped.
    Decorrelated { base: Duration, max: Duration },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// The `[0.5, 1.5]` factor band the retry engine uses by default.
    pub fn proportional() -> Self {
        Jitter::Proportional { min_factor: 0.5, max_factor: 1.5 }
    }

    pub fn decorrelated(base: Duration, max: Duration) -> Self {
        Jitter::Decorrelated { base, max }
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
            Jitter::Proportional { min_factor, max_factor } => {
                let (lo, hi) = if min_factor <= max_factor {
                    (*min_factor, *max_factor)
                } else {
                    (*max_factor, *min_factor)
                };
                let factor = rng.random_range(lo..=hi);
                Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
            }
            Jitter::Decorrelated { base, max } => {
                let base_millis = base.as_millis() as u64;
                let max_millis = max.as_millis() as u64;
                let upper = (delay.as_millis() as u64).saturating_mul(3).min(max_millis);
                if base_millis >= upper {
                    return Duration::from_millis(base_millis);
                }
                Duration::from_millis(rng.random_range(base_millis..=upper))
            }
        }
    }
}
