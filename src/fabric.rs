//! The container wiring every component together.
//!
//! One `Fabric` per process replaces hidden module-global registries: it is
//! built from a validated [`Config`], owns the cache, pools, breakers,
//! queues, limiter, and metrics, wires event subscribers at build time, and
//! runs the janitor tasks (pool sweep, session reap, limiter prune,
//! optional target health probes). Tests build as many independent fabrics
//! as they like.

use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::cache::{CacheStats, KvStore, RequestCache, SemanticMatcher};
use crate::config::{Config, ConfigError};
use crate::credentials::{CredentialPool, CredentialSnapshot};
use crate::error::RelayError;
use crate::events::{EventBus, EventSink, LogSink};
use crate::failover::{ControllerDeps, FailoverController, FailoverOptions};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::{ConnectionPool, PoolSnapshot};
use crate::rate_limit::{Decision, Dimension, RateLimiter};
use crate::request::{InferenceRequest, ResponseEnvelope};
use crate::retry::RetryPolicy;
use crate::sequential::{QueueSnapshot, SequentialManager};
use crate::session::{SessionIndex, SessionReconciler};
use crate::time::{Clock, Deadline, MonotonicClock, Sleeper, TokioSleeper};
use crate::upstream::UpstreamClient;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Aggregated operational view for the admin surface.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub breakers: Vec<BreakerSnapshot>,
    pub credentials: Vec<CredentialSnapshot>,
    pub pools: Vec<PoolSnapshot>,
    pub queues: Vec<QueueSnapshot>,
    pub sessions: usize,
    pub cache: CacheStats,
    pub metrics: MetricsSnapshot,
}

pub struct FabricBuilder {
    config: Config,
    upstream: Option<Arc<dyn UpstreamClient>>,
    kv_store: Option<Arc<dyn KvStore>>,
    matcher: Option<Arc<dyn SemanticMatcher>>,
    sinks: Vec<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl FabricBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            upstream: None,
            kv_store: None,
            matcher: None,
            sinks: Vec::new(),
            clock: None,
            sleeper: None,
        }
    }

    /// The wire-format translator executing upstream calls. Required.
    pub fn upstream(mut self, upstream: Arc<dyn UpstreamClient>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Backend for the cache's KV tier (only consulted when the tier is
    /// enabled in configuration).
    pub fn kv_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.kv_store = Some(store);
        self
    }

    /// Replace the semantic similarity plug point.
    pub fn matcher(mut self, matcher: Arc<dyn SemanticMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Register an event subscriber. [`LogSink`] is always subscribed.
    pub fn subscribe(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn build(self) -> Result<Fabric, ConfigError> {
        self.config.validate()?;
        let upstream = self
            .upstream
            .ok_or_else(|| ConfigError::Invalid("an upstream client is required".into()))?;

        let clock: Arc<dyn Clock> =
            self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let sleeper: Arc<dyn Sleeper> = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));

        let events = EventBus::new();
        events.subscribe(Arc::new(LogSink));
        for sink in self.sinks {
            events.subscribe(sink);
        }

        let sessions =
            Arc::new(SessionIndex::new(self.config.session_config(), Arc::clone(&clock)));
        events.subscribe(Arc::new(SessionReconciler(Arc::clone(&sessions))));

        let credentials = Arc::new(CredentialPool::new(
            self.config.credentials.strategy,
            Arc::clone(&clock),
            events.clone(),
        ));
        for (provider, section) in &self.config.credentials.providers {
            let mut keys = section.keys.clone();
            if !self.config.credentials.enabled {
                // Pool management off: keys stay usable but budgets and
                // scoring have nothing to enforce.
                for key in &mut keys {
                    key.requests_per_minute = None;
                    key.requests_per_day = None;
                    key.tokens_per_minute = None;
                }
            }
            credentials.register_provider(provider, keys, section.strategy);
        }

        let limiter = Arc::new(RateLimiter::new(
            self.config.rate_limit.rules.clone(),
            Arc::clone(&clock),
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            self.config.breaker_config(),
            Arc::clone(&clock),
            events.clone(),
        ));
        let pool = Arc::new(ConnectionPool::new(
            self.config.pool_config(),
            Arc::clone(&clock),
            events.clone(),
        ));
        let sequential = Arc::new(SequentialManager::new(
            self.config.sequential_settings(),
            Arc::clone(&clock),
            Arc::clone(&sleeper),
            events.clone(),
        ));

        let mut cache = RequestCache::new(
            self.config.cache_options(),
            self.config.cache.fingerprint.clone(),
            Arc::clone(&clock),
            events.clone(),
        )?;
        if let Some(store) = self.kv_store {
            cache = cache.with_kv_store(store);
        }
        if let Some(matcher) = self.matcher {
            cache = cache.with_matcher(matcher);
        }
        let cache = Arc::new(cache);

        let metrics = Arc::new(Metrics::new(Arc::clone(&clock)));

        let retry = RetryPolicy::builder()
            .max_attempts(self.config.failover.max_retries)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
            .backoff(
                crate::backoff::Backoff::exponential(Duration::from_millis(
                    self.config.failover.retry_base_delay_ms,
                ))
                .with_multiplier(self.config.failover.backoff_multiplier)
                .with_max(Duration::from_millis(self.config.failover.max_delay_ms)),
            )
            .with_jitter(crate::jitter::Jitter::proportional())
            .with_shared_sleeper(Arc::clone(&sleeper))
            .with_shared_clock(Arc::clone(&clock))
            .build();

        let controller = FailoverController::new(
            FailoverOptions {
                enabled: self.config.failover.enabled,
                targets: self.config.failover_targets(),
                request_timeout: Duration::from_millis(self.config.failover.request_timeout_ms),
            },
            retry,
            ControllerDeps {
                cache: Arc::clone(&cache),
                credentials: Arc::clone(&credentials),
                pool: Arc::clone(&pool),
                sessions: Arc::clone(&sessions),
                sequential: Arc::clone(&sequential),
                breakers: Arc::clone(&breakers),
                upstream: Arc::clone(&upstream),
                metrics: Arc::clone(&metrics),
                clock: Arc::clone(&clock),
                events: events.clone(),
            },
        );

        Ok(Fabric {
            config: self.config,
            controller,
            cache,
            credentials,
            pool,
            sessions,
            sequential,
            breakers,
            limiter,
            metrics,
            upstream,
            events,
            clock,
            janitors: Mutex::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
        })
    }
}

pub struct Fabric {
    config: Config,
    controller: FailoverController,
    cache: Arc<RequestCache>,
    credentials: Arc<CredentialPool>,
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionIndex>,
    sequential: Arc<SequentialManager>,
    breakers: Arc<BreakerRegistry>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    upstream: Arc<dyn UpstreamClient>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    janitors: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl Fabric {
    pub fn builder(config: Config) -> FabricBuilder {
        FabricBuilder::new(config)
    }

    /// Run one request through inbound rate limiting and the failover
    /// controller.
    pub async fn execute(
        &self,
        request: &InferenceRequest,
    ) -> Result<ResponseEnvelope, RelayError> {
        self.execute_with_deadline(request, None).await
    }

    pub async fn execute_with_deadline(
        &self,
        request: &InferenceRequest,
        deadline: Option<Deadline>,
    ) -> Result<ResponseEnvelope, RelayError> {
        if !self.limiter.is_empty() {
            let mut descriptors: Vec<(Dimension, &str)> = vec![(Dimension::Global, "global")];
            if let Some(session) = request.metadata.session.as_deref() {
                descriptors.push((Dimension::User, session));
            }
            let decision = self.limiter.check(&descriptors);
            if !decision.allowed {
                return Err(RelayError::RateLimited {
                    scope: decision.scope,
                    retry_after: decision.retry_after.unwrap_or(Duration::from_secs(1)),
                });
            }
        }
        self.controller.execute(request, deadline).await
    }

    /// Evaluate rate-limit rules for arbitrary ingress descriptors (ip,
    /// endpoint, ...) so the caller can emit the standard headers.
    pub fn check_rate(&self, descriptors: &[(Dimension, &str)]) -> Decision {
        self.limiter.check(descriptors)
    }

    /// Start background janitors: pool sweep, session reap, limiter prune,
    /// and (when configured) upstream health probes. Idempotent enough for
    /// one call per fabric; repeated calls stack extra janitors.
    pub async fn start(&self) {
        for pattern in &self.config.cache.invalidation.patterns {
            let removed = self.cache.invalidate(Some(pattern)).await;
            tracing::info!(pattern, removed, "startup cache invalidation");
        }

        let interval =
            Duration::from_millis(self.config.credentials.health_check_interval_ms.max(1_000));
        let pool = Arc::clone(&self.pool);
        let sessions = Arc::clone(&self.sessions);
        let limiter = Arc::clone(&self.limiter);
        let shutdown = Arc::clone(&self.shutdown);
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.sweep();
                        let reaped = sessions.reap();
                        if reaped > 0 {
                            tracing::debug!(reaped, "reaped inactive sessions");
                        }
                        limiter.prune();
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
        self.janitors.lock().unwrap_or_else(|p| p.into_inner()).push(sweep);

        if self.config.failover.health_check.enabled {
            let targets = self.config.failover_targets();
            let breakers = Arc::clone(&self.breakers);
            let upstream = Arc::clone(&self.upstream);
            let shutdown = Arc::clone(&self.shutdown);
            let probe_interval =
                Duration::from_millis(self.config.failover.health_check.interval_ms.max(1_000));
            let probe_timeout =
                Duration::from_millis(self.config.failover.health_check.timeout_ms.max(100));
            let prober = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(probe_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for target in &targets {
                                let breaker = breakers.get(target);
                                // Probes behave like free trials: they can
                                // close a half-open breaker or keep an open
                                // one shut, but never race real traffic.
                                let Ok(ticket) = breaker.admit() else { continue };
                                let outcome = tokio::time::timeout(
                                    probe_timeout,
                                    upstream.probe(target),
                                )
                                .await;
                                match outcome {
                                    Ok(Ok(())) => breaker.complete(ticket, Ok(())),
                                    Ok(Err(e)) => breaker.complete(ticket, Err(e.kind)),
                                    Err(_) => breaker.complete(
                                        ticket,
                                        Err(crate::error::ErrorKind::TransientNetwork),
                                    ),
                                }
                            }
                        }
                        _ = shutdown.notified() => break,
                    }
                }
            });
            self.janitors.lock().unwrap_or_else(|p| p.into_inner()).push(prober);
        }
    }

    /// Stop janitors and drain sequential queues.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let janitors: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.janitors.lock().unwrap_or_else(|p| p.into_inner()));
        for janitor in janitors {
            janitor.abort();
        }
        self.sequential.set_mode(None, crate::sequential::QueueMode::Normal);
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            breakers: self.breakers.snapshot(),
            credentials: self.credentials.snapshot(),
            pools: self.pool.snapshot(),
            queues: self.sequential.snapshot(),
            sessions: self.sessions.len(),
            cache: self.cache.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    // Component handles for the admin surface (manual breaker reset, key
    // reinstatement, cache invalidation, mode switches).

    pub fn cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.credentials
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn sequential(&self) -> &Arc<SequentialManager> {
        &self.sequential
    }

    pub fn sessions(&self) -> &Arc<SessionIndex> {
        &self.sessions
    }

    pub fn connections(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("providers", &self.config.credentials.providers.len())
            .field("targets", &self.config.failover.targets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::rate_limit::{Algorithm, RateLimitRule};
    use crate::request::{Message, UpstreamResponse};
    use crate::upstream::UpstreamCall;
    use async_trait::async_trait;

    struct OkUpstream;

    #[async_trait]
    impl UpstreamClient for OkUpstream {
        async fn call(
            &self,
            _call: UpstreamCall<'_>,
        ) -> Result<UpstreamResponse, UpstreamError> {
            Ok(UpstreamResponse::new(serde_json::json!({ "content": "ok" })))
        }
    }

    fn config_with_target() -> Config {
        let raw = r#"{
            "credentials": {
                "providers": { "prov": { "keys": [{ "key": "sk-test" }] } }
            },
            "failover": { "targets": ["prov,model"] }
        }"#;
        Config::from_json_str(raw).unwrap()
    }

    fn request(text: &str) -> InferenceRequest {
        InferenceRequest::new("claude", vec![Message::new("user", text)])
    }

    #[tokio::test]
    async fn builds_and_executes_end_to_end() {
        let fabric = Fabric::builder(config_with_target())
            .upstream(Arc::new(OkUpstream))
            .build()
            .unwrap();

        let envelope = fabric.execute(&request("hello")).await.unwrap();
        assert_eq!(envelope.target_used, "prov,model");
        assert!(!envelope.failover);
    }

    #[tokio::test]
    async fn build_requires_an_upstream() {
        let err = Fabric::builder(config_with_target()).build().unwrap_err();
        assert!(err.to_string().contains("upstream"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_build() {
        let mut config = config_with_target();
        config.failover.max_retries = 0;
        let err = Fabric::builder(config).upstream(Arc::new(OkUpstream)).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn inbound_rate_limit_denies_with_scope() {
        let mut config = config_with_target();
        config.rate_limit.rules = vec![RateLimitRule {
            dimension: Dimension::Global,
            algorithm: Algorithm::FixedWindow,
            limit: 1,
            window_ms: 60_000,
            ..RateLimitRule::default()
        }];
        let fabric =
            Fabric::builder(config).upstream(Arc::new(OkUpstream)).build().unwrap();

        assert!(fabric.execute(&request("one")).await.is_ok());
        let err = fabric.execute(&request("two two")).await.unwrap_err();
        match err {
            RelayError::RateLimited { scope, retry_after } => {
                assert_eq!(scope, "global:global");
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected rate limiting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_snapshot_reflects_traffic() {
        let fabric = Fabric::builder(config_with_target())
            .upstream(Arc::new(OkUpstream))
            .build()
            .unwrap();

        let _ = fabric.execute(&request("hello")).await.unwrap();
        let health = fabric.health();
        assert_eq!(health.metrics.requests, 1);
        assert_eq!(health.credentials.len(), 1);
        assert_eq!(health.pools.len(), 1);
        assert_eq!(health.cache.stores, 1);
    }

    #[tokio::test]
    async fn janitors_start_and_shut_down() {
        let fabric = Fabric::builder(config_with_target())
            .upstream(Arc::new(OkUpstream))
            .build()
            .unwrap();
        fabric.start().await;
        fabric.shutdown().await;
        assert!(fabric.janitors.lock().unwrap().is_empty());
    }
}
