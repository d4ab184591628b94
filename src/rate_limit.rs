//! Multi-dimensional rate limiting.
//!
//! Rules attach an algorithm to a dimension (global, endpoint, ip, user,
//! credential). A check evaluates every rule applicable to the supplied
//! descriptors and returns the most restrictive decision; a soft threshold
//! flags approaching limits without denying, which ingress can surface via
//! response headers.

use crate::time::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub mod strategies;

use strategies::{AlgoDecision, FixedWindow, SlidingWindow, TokenBucket};

/// Scope a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Global,
    Endpoint,
    Ip,
    User,
    Credential,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::Endpoint => "endpoint",
            Dimension::Ip => "ip",
            Dimension::User => "user",
            Dimension::Credential => "credential",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

/// One rate-limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitRule {
    pub dimension: Dimension,
    pub algorithm: Algorithm,
    /// Events allowed per window.
    pub limit: u32,
    pub window_ms: u64,
    /// Token-bucket capacity factor (`capacity = limit * burst_multiplier`).
    pub burst_multiplier: f64,
    /// Fraction of the limit at which the soft warning flag is raised.
    pub soft_threshold: f64,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            dimension: Dimension::Global,
            algorithm: Algorithm::TokenBucket,
            limit: 600,
            window_ms: 60_000,
            burst_multiplier: 1.0,
            soft_threshold: 0.8,
        }
    }
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Outcome of a rate-limit check across every applicable dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// `dimension:key` of the most restrictive rule evaluated.
    pub scope: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
    pub retry_after: Option<Duration>,
    /// Set when usage passed the soft threshold but the request still
    /// passed; callers may surface it via headers.
    pub soft_warning: bool,
}

impl Decision {
    /// Decision used when no rules apply.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            scope: "none".to_string(),
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_after: Duration::ZERO,
            retry_after: None,
            soft_warning: false,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limit != u32::MAX
    }

    /// Standard headers, emitted verbatim as the algorithm computed them.
    /// `now_epoch_secs` anchors `X-RateLimit-Reset` to wall time.
    pub fn headers(&self, now_epoch_secs: u64) -> Vec<(&'static str, String)> {
        if !self.is_limited() {
            return Vec::new();
        }
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            (
                "X-RateLimit-Reset",
                (now_epoch_secs + self.reset_after.as_secs()).to_string(),
            ),
            ("X-RateLimit-Reset-After", self.reset_after.as_secs().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", retry_after.as_secs().max(1).to_string()));
        }
        headers
    }
}

enum BucketState {
    Token(TokenBucket),
    Sliding(SlidingWindow),
    Fixed(FixedWindow),
}

impl BucketState {
    fn check(&mut self, now: u64) -> AlgoDecision {
        match self {
            BucketState::Token(b) => b.check(now),
            BucketState::Sliding(b) => b.check(now),
            BucketState::Fixed(b) => b.check(now),
        }
    }

    fn is_idle(&mut self, now: u64) -> bool {
        match self {
            BucketState::Token(b) => b.is_idle(now),
            BucketState::Sliding(b) => b.is_idle(now),
            BucketState::Fixed(b) => b.is_idle(now),
        }
    }
}

/// Evaluator over a rule set. Buckets are keyed `(dimension, key)` and
/// created lazily on first sight of a key.
pub struct RateLimiter {
    rules: Vec<RateLimitRule>,
    buckets: Mutex<HashMap<(Dimension, String), BucketState>>,
    clock: std::sync::Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(rules: Vec<RateLimitRule>, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self { rules, buckets: Mutex::new(HashMap::new()), clock }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate every rule whose dimension appears in `descriptors` and fold
    /// to the most restrictive decision. Denial wins over allowance; among
    /// allowances the smallest remaining wins.
    pub fn check(&self, descriptors: &[(Dimension, &str)]) -> Decision {
        let now = self.clock.now_millis();
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let mut most_restrictive: Option<Decision> = None;

        for rule in &self.rules {
            let Some((_, key)) = descriptors.iter().find(|(dim, _)| *dim == rule.dimension)
            else {
                continue;
            };

            let bucket = buckets
                .entry((rule.dimension, key.to_string()))
                .or_insert_with(|| match rule.algorithm {
                    Algorithm::TokenBucket => BucketState::Token(TokenBucket::new(
                        rule.limit,
                        rule.window(),
                        rule.burst_multiplier,
                        now,
                    )),
                    Algorithm::SlidingWindow => {
                        BucketState::Sliding(SlidingWindow::new(rule.limit, rule.window()))
                    }
                    Algorithm::FixedWindow => {
                        BucketState::Fixed(FixedWindow::new(rule.limit, rule.window(), now))
                    }
                });

            let algo = bucket.check(now);
            let used = rule.limit.saturating_sub(algo.remaining);
            let soft_warning =
                algo.allowed && (used as f64) >= (rule.limit as f64) * rule.soft_threshold;
            let decision = Decision {
                allowed: algo.allowed,
                scope: format!("{}:{}", rule.dimension.as_str(), key),
                limit: algo.limit,
                remaining: algo.remaining,
                reset_after: algo.reset_after,
                retry_after: algo.retry_after,
                soft_warning,
            };

            most_restrictive = Some(match most_restrictive.take() {
                None => decision,
                Some(current) => more_restrictive(current, decision),
            });
        }

        most_restrictive.unwrap_or_else(Decision::unlimited)
    }

    /// Drop buckets whose state no longer matters (run from the janitor).
    pub fn prune(&self) {
        let now = self.clock.now_millis();
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets.retain(|_, bucket| !bucket.is_idle(now));
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules.len())
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

fn more_restrictive(a: Decision, b: Decision) -> Decision {
    match (a.allowed, b.allowed) {
        (true, false) => b,
        (false, true) => a,
        (false, false) => {
            if b.retry_after > a.retry_after {
                b
            } else {
                a
            }
        }
        (true, true) => {
            let merged_warning = a.soft_warning || b.soft_warning;
            let mut winner = if b.remaining < a.remaining { b } else { a };
            winner.soft_warning = merged_warning;
            winner
        }
    }
}
