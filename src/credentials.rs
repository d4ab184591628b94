//! Credential pool: per-provider API keys with health, budgets, rotation.
//!
//! Each key carries a 0–100 health score moved by usage outcomes and a
//! four-state health machine: healthy → degraded on sustained errors →
//! rate-limited on explicit 429 signals (auto-recovers after the announced
//! reset plus a safety buffer) → unavailable on auth failures (admin action
//! required). Per-minute budgets use the rate limiter's sliding-window
//! algorithm scoped by key, never point-in-time counts.

use crate::events::{EventBus, FabricEvent};
use crate::rate_limit::strategies::{SlidingWindow, WindowedSum};
use crate::time::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Extra hold applied after an announced rate-limit reset, so a key is not
/// re-tried the instant the provider's own window rolls.
pub const RATE_LIMIT_SAFETY_BUFFER: Duration = Duration::from_secs(5);

/// Cooldown assumed when a 429 carries no reset hint.
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

const SCORE_SUCCESS: f64 = 1.0;
const SCORE_ERROR: f64 = -5.0;
const SCORE_RATE_LIMIT: f64 = -20.0;
const DEGRADED_BELOW: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyHealth {
    Healthy,
    Degraded,
    RateLimited,
    Unavailable,
}

/// How a provider's keys are rotated across requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    LeastRecentlyUsed,
    /// Load = in-window requests + in-window tokens / 1000.
    LeastLoaded,
    /// Weight = priority x health score; weighted random pick.
    Weighted,
}

/// Static description of one key, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialSpec {
    pub key: String,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub requests_per_day: Option<u32>,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl CredentialSpec {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            requests_per_minute: None,
            requests_per_day: None,
            tokens_per_minute: None,
            priority: 1,
            enabled: true,
        }
    }
}

/// A borrowed credential handed to the upstream executor. The key material
/// never appears in Debug output.
#[derive(Clone)]
pub struct CredentialLease {
    pub provider: String,
    pub id: String,
    key: Arc<str>,
}

impl CredentialLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for CredentialLease {
    // Key material never reaches logs; only the tail is shown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chars: Vec<char> = self.key.chars().collect();
        let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
        f.debug_struct("CredentialLease")
            .field("provider", &self.provider)
            .field("id", &self.id)
            .field("key", &format!("…{tail}"))
            .finish()
    }
}

/// Result of one upstream call, fed back into the pool.
#[derive(Debug, Clone)]
pub struct CredentialOutcome {
    pub tokens: u64,
    pub latency: Duration,
    pub result: OutcomeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Success,
    /// Explicit 429; `reset` is the provider's announced hint when present.
    RateLimited { reset: Option<Duration> },
    /// Authentication/authorization failure; the key stays out until an
    /// admin reinstates it.
    Unavailable { reason: String },
    /// Any other failure attributable to the key's usage.
    Errored,
}

/// No key passed the eligibility filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoCredentialAvailable {
    pub provider: String,
}

impl fmt::Display for NoCredentialAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no eligible credential for provider {}", self.provider)
    }
}

impl std::error::Error for NoCredentialAvailable {}

/// Point-in-time view of one key for the health surface.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialSnapshot {
    pub provider: String,
    pub id: String,
    pub health: KeyHealth,
    pub score: f64,
    pub enabled: bool,
    pub requests_in_window: u32,
    pub tokens_in_window: u64,
    pub rate_limited_for: Option<Duration>,
    pub total_requests: u64,
    pub total_errors: u64,
}

struct KeyState {
    id: String,
    provider: String,
    spec: CredentialSpec,
    key: Arc<str>,
    health: KeyHealth,
    score: f64,
    rate_limited_until: Option<u64>,
    last_used: u64,
    minute_requests: SlidingWindow,
    day_requests: SlidingWindow,
    minute_tokens: WindowedSum,
    latency_avg_ms: f64,
    total_requests: u64,
    total_errors: u64,
}

impl KeyState {
    fn new(provider: &str, index: usize, spec: CredentialSpec) -> Self {
        let key: Arc<str> = Arc::from(spec.key.as_str());
        Self {
            id: format!("{provider}-key{index}"),
            provider: provider.to_string(),
            key,
            spec,
            health: KeyHealth::Healthy,
            score: 100.0,
            rate_limited_until: None,
            last_used: 0,
            minute_requests: SlidingWindow::new(u32::MAX, Duration::from_secs(60)),
            day_requests: SlidingWindow::new(u32::MAX, Duration::from_secs(24 * 60 * 60)),
            minute_tokens: WindowedSum::new(Duration::from_secs(60)),
            latency_avg_ms: 0.0,
            total_requests: 0,
            total_errors: 0,
        }
    }

    /// Eligibility filter; recovers a rate-limited key whose hold elapsed.
    fn eligible(&mut self, now: u64, estimated_tokens: u64) -> (bool, Option<FabricEvent>) {
        if !self.spec.enabled || self.health == KeyHealth::Unavailable {
            return (false, None);
        }

        let mut recovered = None;
        if self.health == KeyHealth::RateLimited {
            match self.rate_limited_until {
                Some(until) if now >= until => {
                    self.health = KeyHealth::Healthy;
                    self.rate_limited_until = None;
                    recovered = Some(KeyHealth::RateLimited);
                }
                _ => return (false, None),
            }
        }

        if let Some(rpm) = self.spec.requests_per_minute {
            if self.minute_requests.count(now) >= rpm {
                return (false, recovered.map(|from| self.state_event(from)));
            }
        }
        if let Some(rpd) = self.spec.requests_per_day {
            if self.day_requests.count(now) >= rpd {
                return (false, recovered.map(|from| self.state_event(from)));
            }
        }
        if let Some(tpm) = self.spec.tokens_per_minute {
            if self.minute_tokens.sum(now).saturating_add(estimated_tokens) > tpm {
                return (false, recovered.map(|from| self.state_event(from)));
            }
        }

        (true, recovered.map(|from| self.state_event(from)))
    }

    fn state_event(&self, from: KeyHealth) -> FabricEvent {
        FabricEvent::CredentialStateChanged {
            provider: self.provider.clone(),
            key_id: self.id.clone(),
            from,
            to: self.health,
        }
    }

    fn load(&mut self, now: u64) -> f64 {
        self.minute_requests.count(now) as f64 + self.minute_tokens.sum(now) as f64 / 1000.0
    }

    fn weight(&self) -> f64 {
        (self.spec.priority.max(1) as f64) * (self.score / 100.0).max(0.01)
    }
}

struct ProviderKeys {
    keys: Vec<KeyState>,
    cursor: usize,
    strategy: RotationStrategy,
}

/// Pool of credentials across providers. The pool is the sole writer to key
/// health; everything else observes through snapshots.
pub struct CredentialPool {
    inner: Mutex<HashMap<String, ProviderKeys>>,
    default_strategy: RotationStrategy,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl CredentialPool {
    pub fn new(
        default_strategy: RotationStrategy,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self { inner: Mutex::new(HashMap::new()), default_strategy, clock, events }
    }

    /// Register a provider's key list, replacing any previous registration.
    pub fn register_provider(
        &self,
        provider: &str,
        specs: Vec<CredentialSpec>,
        strategy: Option<RotationStrategy>,
    ) {
        let keys = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| KeyState::new(provider, index, spec))
            .collect();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.insert(
            provider.to_string(),
            ProviderKeys {
                keys,
                cursor: 0,
                strategy: strategy.unwrap_or(self.default_strategy),
            },
        );
    }

    /// Add a key at runtime.
    pub fn add_key(&self, provider: &str, spec: CredentialSpec) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let entry = inner.entry(provider.to_string()).or_insert_with(|| ProviderKeys {
            keys: Vec::new(),
            cursor: 0,
            strategy: self.default_strategy,
        });
        let index = entry.keys.len();
        entry.keys.push(KeyState::new(provider, index, spec));
    }

    /// Pick one eligible credential for the provider, honoring budgets and
    /// the provider's rotation strategy. The pick itself counts toward the
    /// key's request windows.
    pub fn acquire(
        &self,
        provider: &str,
        estimated_tokens: u64,
    ) -> Result<CredentialLease, NoCredentialAvailable> {
        let now = self.clock.now_millis();
        let mut pending_events = Vec::new();
        let lease = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let Some(entry) = inner.get_mut(provider) else {
                return Err(NoCredentialAvailable { provider: provider.to_string() });
            };

            let mut eligible: Vec<usize> = Vec::new();
            for (index, key) in entry.keys.iter_mut().enumerate() {
                let (ok, event) = key.eligible(now, estimated_tokens);
                if let Some(event) = event {
                    pending_events.push(event);
                }
                if ok {
                    eligible.push(index);
                }
            }

            if eligible.is_empty() {
                None
            } else {
                let pick = match entry.strategy {
                    RotationStrategy::RoundRobin => {
                        let pick = eligible[entry.cursor % eligible.len()];
                        entry.cursor = entry.cursor.wrapping_add(1);
                        pick
                    }
                    RotationStrategy::LeastRecentlyUsed => eligible
                        .iter()
                        .copied()
                        .min_by_key(|&i| entry.keys[i].last_used)
                        .expect("eligible is non-empty"),
                    RotationStrategy::LeastLoaded => {
                        let mut best = eligible[0];
                        let mut best_load = entry.keys[best].load(now);
                        for &i in &eligible[1..] {
                            let load = entry.keys[i].load(now);
                            if load < best_load {
                                best = i;
                                best_load = load;
                            }
                        }
                        best
                    }
                    RotationStrategy::Weighted => weighted_pick(&entry.keys, &eligible),
                };

                let key = &mut entry.keys[pick];
                key.last_used = now;
                key.total_requests += 1;
                let _ = key.minute_requests.check(now);
                let _ = key.day_requests.check(now);
                Some(CredentialLease {
                    provider: provider.to_string(),
                    id: key.id.clone(),
                    key: Arc::clone(&key.key),
                })
            }
        };

        for event in pending_events {
            self.events.emit(event);
        }

        lease.ok_or_else(|| NoCredentialAvailable { provider: provider.to_string() })
    }

    /// Non-consuming version of the eligibility filter, used by the failover
    /// controller when it builds the execution order.
    pub fn has_eligible(&self, provider: &str, estimated_tokens: u64) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(entry) = inner.get_mut(provider) else {
            return false;
        };
        entry.keys.iter_mut().any(|key| key.eligible(now, estimated_tokens).0)
    }

    /// Feed back the outcome of an upstream call made with `lease`.
    pub fn record_outcome(&self, lease: &CredentialLease, outcome: CredentialOutcome) {
        let now = self.clock.now_millis();
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let Some(entry) = inner.get_mut(&lease.provider) else {
                return;
            };
            let Some(key) = entry.keys.iter_mut().find(|k| k.id == lease.id) else {
                return;
            };

            if outcome.tokens > 0 {
                key.minute_tokens.record(now, outcome.tokens);
            }
            let latency_ms = outcome.latency.as_millis() as f64;
            key.latency_avg_ms = if key.latency_avg_ms == 0.0 {
                latency_ms
            } else {
                key.latency_avg_ms * 0.9 + latency_ms * 0.1
            };

            let from = key.health;
            match outcome.result {
                OutcomeKind::Success => {
                    key.score = (key.score + SCORE_SUCCESS).min(100.0);
                    if key.health == KeyHealth::Degraded && key.score >= DEGRADED_BELOW {
                        key.health = KeyHealth::Healthy;
                        events.push(key.state_event(from));
                    }
                }
                OutcomeKind::Errored => {
                    key.score = (key.score + SCORE_ERROR).max(0.0);
                    key.total_errors += 1;
                    if key.health == KeyHealth::Healthy && key.score < DEGRADED_BELOW {
                        key.health = KeyHealth::Degraded;
                        events.push(key.state_event(from));
                    }
                }
                OutcomeKind::RateLimited { reset } => {
                    key.score = (key.score + SCORE_RATE_LIMIT).max(0.0);
                    key.total_errors += 1;
                    let hold = reset.unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN)
                        + RATE_LIMIT_SAFETY_BUFFER;
                    key.health = KeyHealth::RateLimited;
                    key.rate_limited_until = Some(now + hold.as_millis() as u64);
                    events.push(FabricEvent::CredentialRateLimited {
                        provider: lease.provider.clone(),
                        key_id: key.id.clone(),
                        resume_in: hold,
                    });
                    if from != KeyHealth::RateLimited {
                        events.push(key.state_event(from));
                    }
                }
                OutcomeKind::Unavailable { ref reason } => {
                    key.health = KeyHealth::Unavailable;
                    key.total_errors += 1;
                    tracing::error!(
                        provider = %lease.provider,
                        key_id = %key.id,
                        reason,
                        "credential marked unavailable"
                    );
                    if from != KeyHealth::Unavailable {
                        events.push(key.state_event(from));
                    }
                }
            }
        }
        for event in events {
            self.events.emit(event);
        }
    }

    /// Admin switch: enable or disable a key.
    pub fn set_enabled(&self, provider: &str, key_id: &str, enabled: bool) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(entry) = inner.get_mut(provider) else {
            return false;
        };
        match entry.keys.iter_mut().find(|k| k.id == key_id) {
            Some(key) => {
                key.spec.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Admin action bringing an unavailable key back into rotation.
    pub fn reinstate(&self, provider: &str, key_id: &str) -> bool {
        let mut events = Vec::new();
        let found = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let Some(entry) = inner.get_mut(provider) else {
                return false;
            };
            match entry.keys.iter_mut().find(|k| k.id == key_id) {
                Some(key) => {
                    let from = key.health;
                    key.health = KeyHealth::Healthy;
                    key.rate_limited_until = None;
                    key.score = key.score.max(DEGRADED_BELOW);
                    if from != KeyHealth::Healthy {
                        events.push(key.state_event(from));
                    }
                    true
                }
                None => false,
            }
        };
        for event in events {
            self.events.emit(event);
        }
        found
    }

    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        for (provider, entry) in inner.iter_mut() {
            for key in entry.keys.iter_mut() {
                out.push(CredentialSnapshot {
                    provider: provider.clone(),
                    id: key.id.clone(),
                    health: key.health,
                    score: key.score,
                    enabled: key.spec.enabled,
                    requests_in_window: key.minute_requests.count(now),
                    tokens_in_window: key.minute_tokens.sum(now),
                    rate_limited_for: key.rate_limited_until.and_then(|until| {
                        (until > now).then(|| Duration::from_millis(until - now))
                    }),
                    total_requests: key.total_requests,
                    total_errors: key.total_errors,
                });
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers = self.inner.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("CredentialPool").field("providers", &providers).finish()
    }
}

fn weighted_pick(keys: &[KeyState], eligible: &[usize]) -> usize {
    use rand::Rng;
    let total: f64 = eligible.iter().map(|&i| keys[i].weight()).sum();
    if total <= 0.0 {
        return eligible[0];
    }
    let mut roll = rand::rng().random_range(0.0..total);
    for &i in eligible {
        roll -= keys[i].weight();
        if roll <= 0.0 {
            return i;
        }
    }
    *eligible.last().expect("eligible is non-empty")
}
