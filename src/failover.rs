//! Failover controller: the per-request target-selection loop.
//!
//! One request flows: fingerprint → cache (single-flight) → ordered target
//! chain gated by breakers and credential availability → sequential-mode
//! turn → per-attempt credential/connection acquisition → upstream via the
//! retry engine → outcome recording. Failures advance to the next target;
//! exhaustion surfaces the last underlying error with the per-target trail.
//! No synthetic success is ever returned.

use crate::breaker::BreakerRegistry;
use crate::cache::{BuildGuard, CacheDecision, EntryMetadata, RequestCache};
use crate::credentials::{CredentialOutcome, CredentialPool, OutcomeKind};
use crate::error::{ErrorKind, RelayError, UpstreamError, MAX_TRAIL};
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use crate::request::{
    CacheSource, InferenceRequest, ResponseEnvelope, Target, UpstreamResponse,
};
use crate::retry::RetryPolicy;
use crate::sequential::{SequentialManager, Turn};
use crate::session::SessionIndex;
use crate::time::{Clock, Deadline};
use crate::upstream::{UpstreamCall, UpstreamClient};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct FailoverOptions {
    /// When false, only the primary target is ever attempted.
    pub enabled: bool,
    /// Declared chain, primary first. A request pinning its own target
    /// prepends it.
    pub targets: Vec<Target>,
    /// Default per-request deadline when the caller supplies none.
    pub request_timeout: Duration,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self { enabled: true, targets: Vec::new(), request_timeout: Duration::from_secs(120) }
    }
}

/// Everything the controller orchestrates, wired by the container.
pub struct ControllerDeps {
    pub cache: Arc<RequestCache>,
    pub credentials: Arc<CredentialPool>,
    pub pool: Arc<ConnectionPool>,
    pub sessions: Arc<SessionIndex>,
    pub sequential: Arc<SequentialManager>,
    pub breakers: Arc<BreakerRegistry>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
}

struct TargetSuccess {
    response: UpstreamResponse,
    target: Target,
}

pub struct FailoverController {
    options: FailoverOptions,
    retry: RetryPolicy,
    deps: ControllerDeps,
}

impl FailoverController {
    pub fn new(options: FailoverOptions, retry: RetryPolicy, deps: ControllerDeps) -> Self {
        Self { options, retry, deps }
    }

    /// Run one request through cache, targets, and retries.
    pub async fn execute(
        &self,
        request: &InferenceRequest,
        deadline: Option<Deadline>,
    ) -> Result<ResponseEnvelope, RelayError> {
        let started = self.deps.clock.now_millis();
        let deadline = deadline.or_else(|| {
            Some(Deadline::after(self.deps.clock.as_ref(), self.options.request_timeout))
        });

        let guard: Option<BuildGuard> = if self.deps.cache.enabled() {
            match self.deps.cache.begin(request, deadline).await? {
                CacheDecision::Hit { entry, source } => {
                    let target_used = match &entry.metadata.model {
                        Some(model) => format!("{},{}", entry.metadata.provider, model),
                        None => entry.metadata.provider.clone(),
                    };
                    tracing::debug!(%source, fingerprint = %entry.fingerprint, "cache hit");
                    return Ok(ResponseEnvelope {
                        response: entry.response.clone(),
                        target_used,
                        failover: false,
                        cached: source,
                        attempts: 0,
                        total_latency_ms: self.deps.clock.now_millis() - started,
                    });
                }
                CacheDecision::Build(guard) => Some(guard),
            }
        } else {
            None
        };

        let mut attempts_total: u32 = 0;
        let outcome = self.run_targets(request, deadline, &mut attempts_total).await;

        match outcome {
            Ok(success) => {
                if let Some(guard) = guard {
                    let metadata = EntryMetadata {
                        provider: success.target.provider.clone(),
                        model: success.target.model.clone(),
                        input_tokens: success.response.input_tokens,
                        output_tokens: success.response.output_tokens,
                    };
                    self.deps
                        .cache
                        .commit(guard, request, &success.response, metadata)
                        .await;
                }
                let primary = self.primary_for(request);
                Ok(ResponseEnvelope {
                    failover: primary.as_ref() != Some(&success.target),
                    target_used: success.target.to_string(),
                    response: success.response,
                    cached: CacheSource::None,
                    attempts: attempts_total,
                    total_latency_ms: self.deps.clock.now_millis() - started,
                })
            }
            Err(error) => {
                if let Some(guard) = guard {
                    // Waiters get the classified upstream error when one
                    // exists; orchestration failures degrade to a generic
                    // server-class failure for them.
                    match error.upstream() {
                        Some(upstream) => self.deps.cache.abandon(guard, upstream),
                        None => self.deps.cache.abandon(
                            guard,
                            &UpstreamError::new(ErrorKind::Server, error.to_string()),
                        ),
                    }
                }
                Err(error)
            }
        }
    }

    /// The declared primary for this request (pinned target wins).
    fn primary_for(&self, request: &InferenceRequest) -> Option<Target> {
        request
            .pinned_target()
            .or_else(|| self.options.targets.first().cloned())
    }

    fn chain_for(&self, request: &InferenceRequest) -> Result<Vec<Target>, RelayError> {
        let mut chain: Vec<Target> = Vec::new();
        if let Some(pinned) = request.pinned_target() {
            chain.push(pinned);
        } else if request.model.contains(',') {
            // Contains a comma but failed to parse.
            return Err(RelayError::InvalidTarget { spec: request.model.clone() });
        }
        for target in &self.options.targets {
            if !chain.contains(target) {
                chain.push(target.clone());
            }
        }
        if chain.is_empty() {
            return Err(RelayError::InvalidTarget { spec: request.model.clone() });
        }
        if !self.options.enabled {
            chain.truncate(1);
        }
        Ok(chain)
    }

    async fn run_targets(
        &self,
        request: &InferenceRequest,
        deadline: Option<Deadline>,
        attempts_total: &mut u32,
    ) -> Result<TargetSuccess, RelayError> {
        let chain = self.chain_for(request)?;
        let estimated_tokens = request.estimated_tokens();

        // Eligibility pass: skip OPEN breakers and dry credential pools. If
        // that empties the list, run the declared order anyway so the caller
        // sees the real refusal instead of a synthetic one.
        let eligible: Vec<Target> = chain
            .iter()
            .filter(|target| {
                let breaker = self.deps.breakers.get(target);
                let snapshot = breaker.snapshot();
                let breaker_ok = snapshot.state != crate::breaker::CircuitState::Open
                    || snapshot.retry_in.map_or(true, |d| d.is_zero());
                breaker_ok
                    && self
                        .deps
                        .credentials
                        .has_eligible(&target.provider, estimated_tokens)
            })
            .cloned()
            .collect();
        let order = if eligible.is_empty() {
            tracing::debug!("no target passed eligibility; proceeding with declared order");
            chain.clone()
        } else {
            eligible
        };

        let mut trail: Vec<(Target, ErrorKind)> = Vec::new();
        let mut last_error: Option<RelayError> = None;

        for target in &order {
            if let Some(deadline) = deadline {
                if deadline.expired(self.deps.clock.as_ref()) {
                    last_error = Some(RelayError::DeadlineExceeded);
                    break;
                }
            }

            let breaker = self.deps.breakers.get(target);
            let ticket = match breaker.admit() {
                Ok(ticket) => ticket,
                Err(rejection) => {
                    tracing::debug!(%target, "breaker refused target");
                    last_error = Some(RelayError::BreakerOpen {
                        target: target.clone(),
                        retry_in: rejection.retry_in,
                    });
                    continue;
                }
            };

            let priority = request.priority();
            let turn = match self
                .deps
                .sequential
                .submit(&target.provider, priority, deadline)
                .await
            {
                Ok(turn) => turn,
                Err(error) => {
                    // The admission never reached upstream; end the trial
                    // without counting it either way.
                    breaker.complete(ticket, Err(ErrorKind::Canceled));
                    last_error = Some(error);
                    continue;
                }
            };

            let target_started = self.deps.clock.now_millis();
            let report = self.attempt_target(request, target, estimated_tokens, deadline).await;
            *attempts_total += report.attempts;
            let latency =
                Duration::from_millis(self.deps.clock.now_millis() - target_started);

            match report.result {
                Ok(response) => {
                    breaker.complete(ticket, Ok(()));
                    self.deps.metrics.record(
                        &target.to_string(),
                        &target.provider,
                        latency,
                        true,
                        Some(target) != chain.first(),
                    );
                    if let Turn::Ticket(ticket) = turn {
                        // The dwell delays the next grant, not this caller.
                        tokio::spawn(ticket.complete());
                    }
                    return Ok(TargetSuccess { response, target: target.clone() });
                }
                Err(error) => {
                    breaker.complete(ticket, Err(error.kind));
                    self.deps.metrics.record(
                        &target.to_string(),
                        &target.provider,
                        latency,
                        false,
                        false,
                    );
                    drop(turn);
                    tracing::warn!(%target, kind = %error.kind, "target failed, advancing");
                    if trail.len() < MAX_TRAIL {
                        trail.push((target.clone(), error.kind));
                    }
                    last_error = Some(RelayError::Upstream(error));
                }
            }
        }

        match last_error {
            Some(RelayError::Upstream(last)) => Err(RelayError::TargetsExhausted {
                attempts: *attempts_total,
                last,
                trail,
            }),
            Some(other) => Err(other),
            None => Err(RelayError::InvalidTarget { spec: request.model.clone() }),
        }
    }

    /// One target's retry run. Credentials and connections are acquired per
    /// attempt so a key rate-limited mid-run rotates out and session
    /// affinity is re-evaluated each time.
    async fn attempt_target(
        &self,
        request: &InferenceRequest,
        target: &Target,
        estimated_tokens: u64,
        deadline: Option<Deadline>,
    ) -> crate::retry::RetryReport<UpstreamResponse> {
        // Holds a lease across attempts unless the previous attempt decided
        // the key must rotate out.
        let held_lease = Mutex::new(None);
        let session_id = request.metadata.session.as_deref();

        self.retry
            .run(deadline, |attempt| {
                let held_lease = &held_lease;
                async move {
                    let lease = {
                        let mut slot =
                            held_lease.lock().unwrap_or_else(|p| p.into_inner());
                        match slot.take() {
                            Some(lease) => lease,
                            None => self
                                .deps
                                .credentials
                                .acquire(&target.provider, estimated_tokens)
                                .map_err(|_| {
                                    UpstreamError::new(
                                        ErrorKind::RateLimited,
                                        format!(
                                            "no eligible credential for {}",
                                            target.provider
                                        ),
                                    )
                                })?,
                        }
                    };

                    let affinity = session_id.map(|sid| {
                        self.deps.sessions.touch(sid, &target.provider, request.priority())
                    });

                    let connection = self
                        .deps
                        .pool
                        .get(&target.provider, affinity.as_ref(), deadline)
                        .await
                        .map_err(|e| {
                            UpstreamError::new(ErrorKind::Timeout, e.to_string())
                        })?;
                    let connection_id = connection.id();

                    let call_started = self.deps.clock.now_millis();
                    let result = self
                        .deps
                        .upstream
                        .call(UpstreamCall {
                            target,
                            credential: &lease,
                            connection: connection_id,
                            request,
                            attempt,
                        })
                        .await;
                    let call_latency = Duration::from_millis(
                        self.deps.clock.now_millis() - call_started,
                    );

                    match result {
                        Ok(response) => {
                            self.deps.credentials.record_outcome(
                                &lease,
                                CredentialOutcome {
                                    tokens: response.total_tokens(),
                                    latency: call_latency,
                                    result: OutcomeKind::Success,
                                },
                            );
                            if let Some(sid) = session_id {
                                self.deps.sessions.record_result(
                                    sid,
                                    connection_id,
                                    call_latency,
                                );
                            }
                            connection.release();
                            Ok(response)
                        }
                        Err(error) => {
                            let outcome = match error.kind {
                                ErrorKind::RateLimited => OutcomeKind::RateLimited {
                                    reset: error.retry_after,
                                },
                                ErrorKind::Auth => OutcomeKind::Unavailable {
                                    reason: error.message.clone(),
                                },
                                _ => OutcomeKind::Errored,
                            };
                            // Rate-limited and auth-failed keys rotate out;
                            // other failures keep the lease for the next
                            // attempt.
                            let rotate = matches!(
                                error.kind,
                                ErrorKind::RateLimited | ErrorKind::Auth
                            );
                            self.deps.credentials.record_outcome(
                                &lease,
                                CredentialOutcome {
                                    tokens: 0,
                                    latency: call_latency,
                                    result: outcome,
                                },
                            );
                            if !rotate {
                                *held_lease
                                    .lock()
                                    .unwrap_or_else(|p| p.into_inner()) = Some(lease);
                            }
                            if error.kind.is_connection_fatal() {
                                self.deps
                                    .pool
                                    .mark_fatal(&target.provider, connection_id);
                            }
                            connection.release();
                            Err(error)
                        }
                    }
                }
            })
            .await
    }
}

impl std::fmt::Debug for FailoverController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverController").field("options", &self.options).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::cache::{CacheOptions, FingerprintOptions};
    use crate::credentials::{CredentialSpec, KeyHealth, RotationStrategy};
    use crate::jitter::Jitter;
    use crate::pool::PoolConfig;
    use crate::request::Message;
    use crate::sequential::SequentialSettings;
    use crate::session::SessionConfig;
    use crate::time::{InstantSleeper, ManualClock};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};

    #[derive(Default)]
    struct ScriptedUpstream {
        script: Mutex<HashMap<String, VecDeque<Result<UpstreamResponse, UpstreamError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        fn push(&self, target: &str, result: Result<UpstreamResponse, UpstreamError>) {
            self.script
                .lock()
                .unwrap()
                .entry(target.to_string())
                .or_default()
                .push_back(result);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedUpstream {
        async fn call(
            &self,
            call: UpstreamCall<'_>,
        ) -> Result<UpstreamResponse, UpstreamError> {
            let target = call.target.to_string();
            self.calls.lock().unwrap().push(target.clone());
            self.script
                .lock()
                .unwrap()
                .get_mut(&target)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_else(|| Ok(ok_response("default")))
        }
    }

    fn ok_response(text: &str) -> UpstreamResponse {
        UpstreamResponse {
            body: serde_json::json!({ "content": text }),
            input_tokens: 10,
            output_tokens: 10,
        }
    }

    struct Harness {
        controller: FailoverController,
        upstream: Arc<ScriptedUpstream>,
        credentials: Arc<CredentialPool>,
        breakers: Arc<BreakerRegistry>,
        clock: ManualClock,
    }

    fn harness(targets: &[&str], max_retries: u32) -> Harness {
        let clock = ManualClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let events = EventBus::new();
        let upstream = Arc::new(ScriptedUpstream::default());

        let credentials = Arc::new(CredentialPool::new(
            RotationStrategy::RoundRobin,
            Arc::clone(&shared_clock),
            events.clone(),
        ));
        for target in targets {
            let provider = Target::parse(target).unwrap().provider;
            credentials.register_provider(
                &provider,
                vec![CredentialSpec::new(format!("sk-{provider}-1")),
                     CredentialSpec::new(format!("sk-{provider}-2"))],
                None,
            );
        }

        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig::default(),
            Arc::clone(&shared_clock),
            events.clone(),
        ));

        let retry = RetryPolicy::builder()
            .max_attempts(max_retries)
            .unwrap()
            .backoff(crate::backoff::Backoff::constant(Duration::from_millis(1)))
            .with_jitter(Jitter::None)
            .with_sleeper(InstantSleeper)
            .with_shared_clock(Arc::clone(&shared_clock))
            .build();

        let deps = ControllerDeps {
            cache: Arc::new(
                RequestCache::new(
                    CacheOptions::default(),
                    FingerprintOptions::default(),
                    Arc::clone(&shared_clock),
                    events.clone(),
                )
                .unwrap(),
            ),
            credentials: Arc::clone(&credentials),
            pool: Arc::new(ConnectionPool::new(
                PoolConfig::default(),
                Arc::clone(&shared_clock),
                events.clone(),
            )),
            sessions: Arc::new(SessionIndex::new(
                SessionConfig::default(),
                Arc::clone(&shared_clock),
            )),
            sequential: Arc::new(SequentialManager::new(
                SequentialSettings::default(),
                Arc::clone(&shared_clock),
                Arc::new(InstantSleeper),
                events.clone(),
            )),
            breakers: Arc::clone(&breakers),
            upstream: Arc::clone(&upstream) as Arc<dyn UpstreamClient>,
            metrics: Arc::new(Metrics::new(Arc::clone(&shared_clock))),
            clock: shared_clock,
            events,
        };

        let options = FailoverOptions {
            enabled: true,
            targets: targets.iter().map(|t| Target::parse(t).unwrap()).collect(),
            request_timeout: Duration::from_secs(120),
        };
        Harness {
            controller: FailoverController::new(options, retry, deps),
            upstream,
            credentials,
            breakers,
            clock,
        }
    }

    fn request(text: &str) -> InferenceRequest {
        InferenceRequest::new("claude", vec![Message::new("user", text)])
    }

    #[tokio::test]
    async fn primary_success_is_not_a_failover() {
        let h = harness(&["prov-a,model-1", "prov-b,model-2"], 2);
        h.upstream.push("prov-a,model-1", Ok(ok_response("hi")));

        let envelope = h.controller.execute(&request("hello"), None).await.unwrap();
        assert!(!envelope.failover);
        assert_eq!(envelope.target_used, "prov-a,model-1");
        assert_eq!(envelope.attempts, 1);
        assert_eq!(envelope.cached, CacheSource::None);
    }

    #[tokio::test]
    async fn advances_to_fallback_after_retry_exhaustion() {
        let h = harness(&["prov-a,model-1", "prov-b,model-2"], 2);
        h.upstream.push("prov-a,model-1", Err(UpstreamError::from_status(503, "down")));
        h.upstream.push("prov-a,model-1", Err(UpstreamError::from_status(503, "down")));
        h.upstream.push("prov-b,model-2", Ok(ok_response("rescued")));

        let envelope = h.controller.execute(&request("hello"), None).await.unwrap();
        assert!(envelope.failover);
        assert_eq!(envelope.target_used, "prov-b,model-2");
        assert_eq!(envelope.attempts, 3);
        assert_eq!(
            h.upstream.calls(),
            vec!["prov-a,model-1", "prov-a,model-1", "prov-b,model-2"]
        );
    }

    #[tokio::test]
    async fn open_breaker_skips_straight_to_fallback() {
        let h = harness(&["prov-a,model-1", "prov-b,model-2"], 1);
        // Trip the primary's breaker.
        let primary = Target::parse("prov-a,model-1").unwrap();
        let breaker = h.breakers.get(&primary);
        for _ in 0..BreakerConfig::default().failure_threshold {
            let ticket = breaker.admit().unwrap();
            breaker.complete(ticket, Err(ErrorKind::Server));
        }

        let envelope = h.controller.execute(&request("hello"), None).await.unwrap();
        assert!(envelope.failover);
        assert_eq!(envelope.target_used, "prov-b,model-2");
        assert!(
            h.upstream.calls().iter().all(|c| c == "prov-b,model-2"),
            "open primary must not be contacted"
        );
    }

    #[tokio::test]
    async fn open_breaker_with_no_fallback_surfaces_without_upstream_contact() {
        let h = harness(&["prov-a,model-1"], 1);
        let primary = Target::parse("prov-a,model-1").unwrap();
        let breaker = h.breakers.get(&primary);
        for _ in 0..BreakerConfig::default().failure_threshold {
            let ticket = breaker.admit().unwrap();
            breaker.complete(ticket, Err(ErrorKind::Server));
        }

        let err = h.controller.execute(&request("hello"), None).await.unwrap_err();
        assert!(err.is_breaker_open(), "got {err:?}");
        assert!(h.upstream.calls().is_empty(), "upstream must not be invoked");
    }

    #[tokio::test]
    async fn exhaustion_carries_last_error_and_trail() {
        let h = harness(&["prov-a,model-1", "prov-b,model-2"], 1);
        h.upstream.push("prov-a,model-1", Err(UpstreamError::from_status(500, "a down")));
        h.upstream.push("prov-b,model-2", Err(UpstreamError::from_status(404, "b lost")));

        let err = h.controller.execute(&request("hello"), None).await.unwrap_err();
        match err {
            RelayError::TargetsExhausted { attempts, last, trail } => {
                assert_eq!(attempts, 2);
                assert_eq!(last.status, Some(404));
                assert_eq!(
                    trail,
                    vec![
                        (Target::parse("prov-a,model-1").unwrap(), ErrorKind::Server),
                        (Target::parse("prov-b,model-2").unwrap(), ErrorKind::Client),
                    ]
                );
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_failure_marks_the_key_and_surfaces() {
        let h = harness(&["prov-a,model-1"], 3);
        h.upstream.push("prov-a,model-1", Err(UpstreamError::from_status(401, "bad key")));

        let err = h.controller.execute(&request("hello"), None).await.unwrap_err();
        assert_eq!(err.upstream().unwrap().kind, ErrorKind::Auth);
        // Auth is non-retryable: exactly one call.
        assert_eq!(h.upstream.calls().len(), 1);

        let unavailable = h
            .credentials
            .snapshot()
            .into_iter()
            .filter(|k| k.health == KeyHealth::Unavailable)
            .count();
        assert_eq!(unavailable, 1);
    }

    #[tokio::test]
    async fn rate_limited_key_rotates_within_the_retry_run() {
        let h = harness(&["prov-a,model-1"], 3);
        h.upstream.push(
            "prov-a,model-1",
            Err(UpstreamError::rate_limited(Some(Duration::from_secs(30)))),
        );
        h.upstream.push("prov-a,model-1", Ok(ok_response("second key works")));

        let envelope = h.controller.execute(&request("hello"), None).await.unwrap();
        assert_eq!(envelope.attempts, 2);

        let snapshots = h.credentials.snapshot();
        let limited: Vec<_> =
            snapshots.iter().filter(|k| k.health == KeyHealth::RateLimited).collect();
        assert_eq!(limited.len(), 1, "first key parked as rate-limited");
        // 30s reset + 5s safety buffer.
        let hold = limited[0].rate_limited_for.unwrap();
        assert!(hold > Duration::from_secs(30) && hold <= Duration::from_secs(35));
    }

    #[tokio::test]
    async fn pinned_target_prepends_the_chain() {
        let h = harness(&["prov-a,model-1", "prov-b,model-2"], 1);
        let mut req = request("hello");
        req.model = "prov-b,model-2".to_string();
        h.upstream.push("prov-b,model-2", Ok(ok_response("pinned")));

        let envelope = h.controller.execute(&req, None).await.unwrap();
        assert_eq!(envelope.target_used, "prov-b,model-2");
        assert!(!envelope.failover, "the pinned target is the primary");
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let h = harness(&["prov-a,model-1"], 1);
        h.upstream.push("prov-a,model-1", Ok(ok_response("cache me")));

        let first = h.controller.execute(&request("hello"), None).await.unwrap();
        assert_eq!(first.cached, CacheSource::None);

        let second = h.controller.execute(&request("hello"), None).await.unwrap();
        assert_eq!(second.cached, CacheSource::Memory);
        assert_eq!(second.attempts, 0);
        assert_eq!(second.response, first.response);
        assert_eq!(h.upstream.calls().len(), 1, "no second upstream call");
    }

    #[tokio::test]
    async fn expired_deadline_short_circuits() {
        let h = harness(&["prov-a,model-1"], 1);
        let deadline = Deadline::after(&h.clock, Duration::from_millis(10));
        h.clock.advance(11);

        let err = h.controller.execute(&request("hello"), Some(deadline)).await.unwrap_err();
        assert_eq!(err, RelayError::DeadlineExceeded);
        assert!(h.upstream.calls().is_empty());
    }
}
