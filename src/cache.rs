//! Multi-tier request cache.
//!
//! Lookup order: in-memory LRU, then the out-of-process KV store (when
//! injected), then the on-disk overflow, then an optional bounded semantic
//! scan over recent entries. Hits from lower tiers are promoted upward.
//! Builds are single-flight per fingerprint: one caller talks to upstream
//! while concurrent lookups wait on its result with a bounded timeout.
//!
//! A failed KV or disk tier degrades silently — the lookup proceeds through
//! the remaining tiers and the degradation is logged once per window. A
//! cache store failure never fails the user request.

use crate::error::{RelayError, UpstreamError};
use crate::events::{DegradedTier, EventBus, FabricEvent};
use crate::request::{CacheSource, InferenceRequest, UpstreamResponse};
use crate::time::{epoch_millis, Clock, Deadline};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod disk;
pub mod fingerprint;
pub mod kv;
pub mod memory;
pub mod semantic;
pub mod single_flight;

pub use disk::{DiskError, DiskTier};
pub use fingerprint::{Fingerprint, FingerprintAlgorithm, FingerprintOptions, VaryBy};
pub use kv::{InMemoryKvStore, KvError, KvStore};
pub use memory::MemoryTier;
pub use semantic::{JaccardMatcher, SemanticMatcher};
pub use single_flight::{BuildFailure, FlightGuard, FlightRole, SingleFlight};

/// Provider/model provenance and token counts carried with each entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// One cached response. Owned by the cache; callers receive `Arc` views.
#[derive(Debug)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    /// Snapshot of the request that produced the response.
    pub request: serde_json::Value,
    pub response: UpstreamResponse,
    /// Wall-clock creation time (epoch millis); entries persist across
    /// processes.
    pub created_at: u64,
    pub ttl_ms: u64,
    pub size_bytes: u64,
    pub metadata: EntryMetadata,
    hits: AtomicU64,
}

impl CacheEntry {
    pub fn expired(&self, now_epoch_millis: u64) -> bool {
        self.created_at + self.ttl_ms <= now_epoch_millis
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Serialized form of an entry, shared by the KV and disk tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub fingerprint: String,
    pub request: serde_json::Value,
    pub response: UpstreamResponse,
    pub created_at: u64,
    pub ttl_ms: u64,
    pub hits: u64,
    pub size: u64,
    pub metadata: EntryMetadata,
}

impl StoredEntry {
    pub fn from_entry(entry: &CacheEntry, ttl_ms: u64) -> Self {
        Self {
            fingerprint: entry.fingerprint.as_str().to_string(),
            request: entry.request.clone(),
            response: entry.response.clone(),
            created_at: entry.created_at,
            ttl_ms,
            hits: entry.hits(),
            size: entry.size_bytes,
            metadata: entry.metadata.clone(),
        }
    }

    pub fn into_entry(self) -> CacheEntry {
        CacheEntry {
            fingerprint: Fingerprint::from_hex(self.fingerprint),
            request: self.request,
            response: self.response,
            created_at: self.created_at,
            ttl_ms: self.ttl_ms,
            size_bytes: self.size,
            metadata: self.metadata,
            hits: AtomicU64::new(self.hits),
        }
    }
}

/// Assembled cache behavior knobs (built from configuration).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOptions {
    pub enabled: bool,
    pub memory_max_entries: usize,
    pub memory_ttl: Duration,
    /// KV tier engages only when a store is injected as well.
    pub kv_enabled: bool,
    pub kv_ttl: Duration,
    pub disk_enabled: bool,
    pub disk_path: PathBuf,
    pub disk_max_bytes: u64,
    pub disk_ttl: Duration,
    /// Responses below this serialized size never spill to disk.
    pub disk_spill_threshold: u64,
    pub semantic_enabled: bool,
    pub semantic_threshold: f64,
    pub semantic_max_comparisons: usize,
    /// Uniform random TTL variance, defeating synchronized expiry.
    pub ttl_variance: Duration,
    pub single_flight_wait: Duration,
    /// Waiters allowed to retry individually after a failed build.
    pub flight_retry_quota: u32,
    pub degradation_log_window: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_max_entries: 1_000,
            memory_ttl: Duration::from_secs(3_600),
            kv_enabled: false,
            kv_ttl: Duration::from_secs(3_600),
            disk_enabled: false,
            disk_path: PathBuf::from("cache"),
            disk_max_bytes: 256 * 1024 * 1024,
            disk_ttl: Duration::from_secs(24 * 3_600),
            disk_spill_threshold: 32 * 1024,
            semantic_enabled: false,
            semantic_threshold: 0.85,
            semantic_max_comparisons: 20,
            ttl_variance: Duration::from_secs(30),
            single_flight_wait: Duration::from_secs(30),
            flight_retry_quota: 1,
            degradation_log_window: Duration::from_secs(60),
        }
    }
}

/// Counters behind [`RequestCache::stats`].
#[derive(Debug, Default)]
struct CacheCounters {
    hits_memory: AtomicU64,
    hits_kv: AtomicU64,
    hits_disk: AtomicU64,
    hits_semantic: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub hits_memory: u64,
    pub hits_kv: u64,
    pub hits_disk: u64,
    pub hits_semantic: u64,
    pub misses: u64,
    pub stores: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub bytes_memory: u64,
    pub bytes_disk: u64,
    pub top_fingerprints: Vec<(String, u64)>,
}

/// Once-per-window reporter for tier degradations.
struct DegradationGate {
    tier: DegradedTier,
    last: AtomicU64,
    window_ms: u64,
}

impl DegradationGate {
    fn new(tier: DegradedTier, window: Duration) -> Self {
        Self { tier, last: AtomicU64::new(0), window_ms: window.as_millis() as u64 }
    }

    fn report(&self, clock: &dyn Clock, events: &EventBus, message: &str) {
        let now = clock.now_millis().max(1);
        let last = self.last.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.window_ms && last != 0 {
            return;
        }
        if self
            .last
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(tier = ?self.tier, message, "cache tier degraded");
            events.emit(FabricEvent::CacheDegraded {
                tier: self.tier,
                message: message.to_string(),
            });
        }
    }
}

/// Outcome of [`RequestCache::begin`].
#[derive(Debug)]
pub enum CacheDecision {
    /// A tier (or a concurrent build) satisfied the request.
    Hit { entry: Arc<CacheEntry>, source: CacheSource },
    /// This caller builds the response and must settle the guard through
    /// [`RequestCache::commit`] or [`RequestCache::abandon`].
    Build(BuildGuard),
}

/// Leadership over one fingerprint's upstream build.
pub struct BuildGuard {
    guard: FlightGuard,
}

impl BuildGuard {
    pub fn fingerprint(&self) -> &Fingerprint {
        self.guard.fingerprint()
    }
}

impl std::fmt::Debug for BuildGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildGuard").field("fingerprint", self.fingerprint()).finish()
    }
}

pub struct RequestCache {
    options: CacheOptions,
    fingerprint_options: FingerprintOptions,
    memory: MemoryTier,
    kv: Option<Arc<dyn KvStore>>,
    disk: Option<DiskTier>,
    matcher: Arc<dyn SemanticMatcher>,
    flight: SingleFlight,
    counters: CacheCounters,
    degrade_kv: DegradationGate,
    degrade_disk: DegradationGate,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl RequestCache {
    pub fn new(
        options: CacheOptions,
        fingerprint_options: FingerprintOptions,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self, DiskError> {
        let disk = if options.disk_enabled {
            Some(DiskTier::new(options.disk_path.clone(), options.disk_max_bytes)?)
        } else {
            None
        };
        Ok(Self {
            memory: MemoryTier::new(options.memory_max_entries),
            kv: None,
            disk,
            matcher: Arc::new(JaccardMatcher),
            flight: SingleFlight::new(options.flight_retry_quota),
            counters: CacheCounters::default(),
            degrade_kv: DegradationGate::new(DegradedTier::Kv, options.degradation_log_window),
            degrade_disk: DegradationGate::new(
                DegradedTier::Disk,
                options.degradation_log_window,
            ),
            clock,
            events,
            options,
            fingerprint_options,
        })
    }

    /// Inject the out-of-process KV backend.
    pub fn with_kv_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.kv = Some(store);
        self
    }

    /// Swap the semantic matcher plug point.
    pub fn with_matcher(mut self, matcher: Arc<dyn SemanticMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn fingerprint(&self, request: &InferenceRequest) -> Fingerprint {
        fingerprint::compute(request, &self.fingerprint_options)
    }

    /// Look the request up across tiers, or take the build lead.
    ///
    /// Concurrent callers for the same unseen fingerprint produce exactly
    /// one [`CacheDecision::Build`]; the rest wait here for its result,
    /// bounded by the single-flight wait and the request deadline.
    pub async fn begin(
        &self,
        request: &InferenceRequest,
        deadline: Option<Deadline>,
    ) -> Result<CacheDecision, RelayError> {
        let fingerprint = self.fingerprint(request);
        // Bound the waiter → leader promotion cycle: a request re-enters the
        // loop only on a failed or cancelled build.
        for _ in 0..4 {
            if let Some((entry, source)) = self.probe(request, &fingerprint).await {
                self.count_hit(source);
                return Ok(CacheDecision::Hit { entry, source });
            }

            match self.flight.join(&fingerprint) {
                FlightRole::Leader(guard) => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheDecision::Build(BuildGuard { guard }));
                }
                FlightRole::Waiter(mut rx) => {
                    let mut wait = self.options.single_flight_wait;
                    if let Some(deadline) = deadline {
                        wait = deadline.clamp(wait, self.clock.as_ref());
                    }
                    match tokio::time::timeout(wait, rx.recv()).await {
                        Ok(Ok(Ok(entry))) => {
                            // The leader stored before broadcasting, so this
                            // is a memory-tier serve.
                            self.count_hit(CacheSource::Memory);
                            return Ok(CacheDecision::Hit {
                                entry,
                                source: CacheSource::Memory,
                            });
                        }
                        Ok(Ok(Err(failure))) => {
                            if self.flight.try_retry(&fingerprint) {
                                continue;
                            }
                            return Err(RelayError::Upstream(failure.into_upstream()));
                        }
                        // Leader cancelled without a result; try again.
                        Ok(Err(_)) => continue,
                        Err(_) => {
                            return Err(RelayError::SingleFlightTimeout { waited: wait })
                        }
                    }
                }
            }
        }
        Err(RelayError::SingleFlightTimeout { waited: self.options.single_flight_wait })
    }

    /// Ingest a built response: write tiers, publish to waiters. Tier
    /// failures degrade silently.
    pub async fn commit(
        &self,
        guard: BuildGuard,
        request: &InferenceRequest,
        response: &UpstreamResponse,
        metadata: EntryMetadata,
    ) -> Arc<CacheEntry> {
        let size_bytes = serde_json::to_vec(response).map(|b| b.len() as u64).unwrap_or(0);
        let entry = Arc::new(CacheEntry {
            fingerprint: guard.fingerprint().clone(),
            request: serde_json::to_value(request).unwrap_or(serde_json::Value::Null),
            response: response.clone(),
            created_at: epoch_millis(),
            ttl_ms: with_variance(self.options.memory_ttl, self.options.ttl_variance),
            size_bytes,
            metadata,
            hits: AtomicU64::new(0),
        });

        self.memory.put(Arc::clone(&entry));

        if self.options.kv_enabled {
            if let Some(kv) = &self.kv {
                let ttl_ms = with_variance(self.options.kv_ttl, self.options.ttl_variance);
                let record = StoredEntry::from_entry(&entry, ttl_ms);
                match serde_json::to_vec(&record) {
                    Ok(bytes) => {
                        if let Err(e) = kv
                            .put(
                                entry.fingerprint.as_str(),
                                bytes,
                                Duration::from_millis(ttl_ms),
                            )
                            .await
                        {
                            self.degrade_kv.report(
                                self.clock.as_ref(),
                                &self.events,
                                &e.to_string(),
                            );
                        }
                    }
                    Err(e) => {
                        self.degrade_kv.report(
                            self.clock.as_ref(),
                            &self.events,
                            &e.to_string(),
                        );
                    }
                }
            }
        }

        if let Some(disk) = &self.disk {
            if size_bytes >= self.options.disk_spill_threshold {
                let ttl_ms = with_variance(self.options.disk_ttl, self.options.ttl_variance);
                let record = StoredEntry::from_entry(&entry, ttl_ms);
                if let Err(e) = disk.write(&record).await {
                    self.degrade_disk.report(
                        self.clock.as_ref(),
                        &self.events,
                        &e.to_string(),
                    );
                }
            }
        }

        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        guard.guard.complete(Arc::clone(&entry));
        entry
    }

    /// Publish a failed build to waiters, arming the bounded retry quota.
    pub fn abandon(&self, guard: BuildGuard, error: &UpstreamError) {
        guard.guard.fail(BuildFailure::from_error(error));
    }

    /// Remove entries whose stored request stringifies to a match; with no
    /// pattern, clear every tier. The KV tier cannot be enumerated through
    /// its narrow contract, so pattern invalidation there relies on TTL;
    /// full clears are forwarded.
    pub async fn invalidate(&self, pattern: Option<&str>) -> usize {
        match pattern {
            None => {
                let removed = self.memory.len();
                self.memory.clear();
                if let Some(kv) = &self.kv {
                    if let Err(e) = kv.clear().await {
                        self.degrade_kv.report(
                            self.clock.as_ref(),
                            &self.events,
                            &e.to_string(),
                        );
                    }
                }
                if let Some(disk) = &self.disk {
                    if let Err(e) = disk.clear().await {
                        self.degrade_disk.report(
                            self.clock.as_ref(),
                            &self.events,
                            &e.to_string(),
                        );
                    }
                }
                removed
            }
            Some(pattern) => {
                let mut removed = self
                    .memory
                    .invalidate_matching(|entry| entry.request.to_string().contains(pattern));
                if let Some(disk) = &self.disk {
                    match disk
                        .remove_matching(|record| record.request.to_string().contains(pattern))
                        .await
                    {
                        Ok(count) => removed += count,
                        Err(e) => self.degrade_disk.report(
                            self.clock.as_ref(),
                            &self.events,
                            &e.to_string(),
                        ),
                    }
                }
                removed
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits_memory = self.counters.hits_memory.load(Ordering::Relaxed);
        let hits_kv = self.counters.hits_kv.load(Ordering::Relaxed);
        let hits_disk = self.counters.hits_disk.load(Ordering::Relaxed);
        let hits_semantic = self.counters.hits_semantic.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let hits = hits_memory + hits_kv + hits_disk + hits_semantic;
        let lookups = hits + misses;
        CacheStats {
            hits,
            hits_memory,
            hits_kv,
            hits_disk,
            hits_semantic,
            misses,
            stores: self.counters.stores.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            entries: self.memory.len(),
            bytes_memory: self.memory.bytes(),
            bytes_disk: self.disk.as_ref().map(|d| d.bytes()).unwrap_or(0),
            top_fingerprints: self
                .memory
                .top_hits(10)
                .into_iter()
                .map(|(fp, hits)| (fp.as_str().to_string(), hits))
                .collect(),
        }
    }

    async fn probe(
        &self,
        request: &InferenceRequest,
        fingerprint: &Fingerprint,
    ) -> Option<(Arc<CacheEntry>, CacheSource)> {
        if let Some(entry) = self.memory.get(fingerprint) {
            return Some((entry, CacheSource::Memory));
        }

        if self.options.kv_enabled {
            if let Some(kv) = &self.kv {
                match kv.get(fingerprint.as_str()).await {
                    Ok(Some(bytes)) => {
                        if let Ok(record) = serde_json::from_slice::<StoredEntry>(&bytes) {
                            let entry = Arc::new(record.into_entry());
                            if !entry.expired(epoch_millis()) {
                                entry.record_hit();
                                self.memory.put(Arc::clone(&entry));
                                return Some((entry, CacheSource::Kv));
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => self.degrade_kv.report(
                        self.clock.as_ref(),
                        &self.events,
                        &e.to_string(),
                    ),
                }
            }
        }

        if let Some(disk) = &self.disk {
            match disk.read(fingerprint).await {
                Ok(Some(record)) => {
                    let entry = Arc::new(record.into_entry());
                    entry.record_hit();
                    self.memory.put(Arc::clone(&entry));
                    // Promote upward into the KV tier as well.
                    if self.options.kv_enabled {
                        if let Some(kv) = &self.kv {
                            let record = StoredEntry::from_entry(&entry, entry.ttl_ms);
                            if let Ok(bytes) = serde_json::to_vec(&record) {
                                let _ = kv
                                    .put(
                                        fingerprint.as_str(),
                                        bytes,
                                        Duration::from_millis(entry.ttl_ms),
                                    )
                                    .await;
                            }
                        }
                    }
                    return Some((entry, CacheSource::Disk));
                }
                Ok(None) => {}
                Err(e) => self.degrade_disk.report(
                    self.clock.as_ref(),
                    &self.events,
                    &e.to_string(),
                ),
            }
        }

        if self.options.semantic_enabled {
            let query = semantic::text_of(
                &serde_json::to_value(&request.messages).unwrap_or(serde_json::Value::Null),
            );
            if !query.is_empty() {
                let now = epoch_millis();
                let mut best: Option<(Arc<CacheEntry>, f64)> = None;
                for candidate in self.memory.recent(self.options.semantic_max_comparisons) {
                    if candidate.expired(now) {
                        continue;
                    }
                    let score = self.matcher.score(&query, &semantic::text_of(&candidate.request));
                    if score >= self.options.semantic_threshold
                        && best.as_ref().map_or(true, |(_, b)| score > *b)
                    {
                        best = Some((candidate, score));
                    }
                }
                if let Some((entry, score)) = best {
                    tracing::debug!(
                        fingerprint = %entry.fingerprint,
                        score,
                        "semantic cache hit"
                    );
                    entry.record_hit();
                    return Some((entry, CacheSource::Semantic));
                }
            }
        }

        None
    }

    fn count_hit(&self, source: CacheSource) {
        let counter = match source {
            CacheSource::Memory => &self.counters.hits_memory,
            CacheSource::Kv => &self.counters.hits_kv,
            CacheSource::Disk => &self.counters.hits_disk,
            CacheSource::Semantic => &self.counters.hits_semantic,
            CacheSource::None => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("enabled", &self.options.enabled)
            .field("entries", &self.memory.len())
            .finish()
    }
}

/// TTL plus a uniform random variance, in milliseconds.
fn with_variance(ttl: Duration, variance: Duration) -> u64 {
    use rand::Rng;
    let base = ttl.as_millis() as u64;
    let spread = variance.as_millis() as u64;
    if spread == 0 {
        base
    } else {
        base + rand::rng().random_range(0..=spread)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn entry_with(fp: &str, text: &str, ttl: Duration) -> Arc<CacheEntry> {
        let response = UpstreamResponse {
            body: serde_json::json!({ "content": text }),
            input_tokens: 1,
            output_tokens: 1,
        };
        let size_bytes = serde_json::to_vec(&response).unwrap().len() as u64;
        Arc::new(CacheEntry {
            fingerprint: Fingerprint::from_hex(fp),
            request: serde_json::json!({ "messages": [{ "role": "user", "content": text }] }),
            response,
            created_at: epoch_millis(),
            ttl_ms: ttl.as_millis() as u64,
            size_bytes,
            metadata: EntryMetadata { provider: "prov".into(), ..Default::default() },
            hits: AtomicU64::new(0),
        })
    }

    pub(crate) fn stored_with(fp: &str, text: &str, ttl: Duration) -> StoredEntry {
        StoredEntry::from_entry(&entry_with(fp, text, ttl), ttl.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Message;
    use crate::time::ManualClock;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;

    fn request(text: &str) -> InferenceRequest {
        InferenceRequest::new("prov,model", vec![Message::new("user", text)])
    }

    fn metadata() -> EntryMetadata {
        EntryMetadata { provider: "prov".into(), model: Some("model".into()), ..Default::default() }
    }

    fn response(text: &str) -> UpstreamResponse {
        UpstreamResponse {
            body: serde_json::json!({ "content": text }),
            input_tokens: 5,
            output_tokens: 7,
        }
    }

    fn cache(options: CacheOptions) -> RequestCache {
        RequestCache::new(
            options,
            FingerprintOptions::default(),
            Arc::new(ManualClock::new()),
            EventBus::new(),
        )
        .expect("cache")
    }

    #[tokio::test]
    async fn store_then_lookup_hits_memory() {
        let cache = cache(CacheOptions::default());
        let req = request("what is rust");

        let guard = match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            CacheDecision::Hit { .. } => panic!("fresh cache cannot hit"),
        };
        cache.commit(guard, &req, &response("a language"), metadata()).await;

        match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Hit { entry, source } => {
                assert_eq!(source, CacheSource::Memory);
                assert_eq!(entry.response, response("a language"));
            }
            CacheDecision::Build(_) => panic!("expected a memory hit"),
        }

        let stats = cache.stats();
        assert_eq!(stats.hits_memory, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ten_concurrent_lookups_one_build() {
        let cache = Arc::new(cache(CacheOptions::default()));
        let builds = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                tokio::spawn(async move {
                    let req = request("same question");
                    match cache.begin(&req, None).await.unwrap() {
                        CacheDecision::Build(guard) => {
                            builds.fetch_add(1, Ordering::SeqCst);
                            // Simulate upstream latency before committing.
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            let entry = cache
                                .commit(guard, &req, &response("the answer"), metadata())
                                .await;
                            entry.response.clone()
                        }
                        CacheDecision::Hit { entry, .. } => entry.response.clone(),
                    }
                })
            })
            .collect();

        let responses: Vec<UpstreamResponse> =
            join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(builds.load(Ordering::SeqCst), 1, "exactly one upstream build");
        assert!(responses.iter().all(|r| *r == response("the answer")));
    }

    #[tokio::test]
    async fn failed_build_lets_one_waiter_retry() {
        let options = CacheOptions { flight_retry_quota: 1, ..CacheOptions::default() };
        let cache = Arc::new(cache(options));
        let req = request("flaky question");

        let leader = match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            _ => panic!("leader expected"),
        };

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let req = request("flaky question");
                cache.begin(&req, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.abandon(leader, &UpstreamError::from_status(503, "boom"));

        // The single retry permit promotes the waiter to leader.
        match waiter.await.unwrap().unwrap() {
            CacheDecision::Build(guard) => cache.abandon(guard, &UpstreamError::from_status(503, "boom")),
            CacheDecision::Hit { .. } => panic!("no entry exists to hit"),
        }
    }

    #[tokio::test]
    async fn waiters_beyond_quota_surface_the_failure() {
        let options = CacheOptions { flight_retry_quota: 0, ..CacheOptions::default() };
        let cache = Arc::new(cache(options));
        let req = request("doomed question");

        let leader = match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            _ => panic!("leader expected"),
        };
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let req = request("doomed question");
                cache.begin(&req, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.abandon(leader, &UpstreamError::from_status(500, "down"));

        let err = waiter.await.unwrap().unwrap_err();
        match err {
            RelayError::Upstream(e) => assert_eq!(e.kind, crate::error::ErrorKind::Server),
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_flight_wait_is_bounded() {
        let options = CacheOptions {
            single_flight_wait: Duration::from_millis(30),
            ..CacheOptions::default()
        };
        let cache = Arc::new(cache(options));
        let req = request("slow question");

        let _leader = match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            _ => panic!("leader expected"),
        };

        let err = cache.begin(&req, None).await.unwrap_err();
        assert!(err.is_single_flight_timeout());
    }

    #[tokio::test]
    async fn kv_tier_serves_and_promotes() {
        let store = Arc::new(InMemoryKvStore::new());
        let options = CacheOptions { kv_enabled: true, ..CacheOptions::default() };
        let cache = cache(options).with_kv_store(store.clone());
        let req = request("kv backed");

        // Build once so the KV tier holds the record, then wipe memory only.
        let guard = match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            _ => panic!("leader expected"),
        };
        cache.commit(guard, &req, &response("persisted"), metadata()).await;
        cache.memory.clear();

        match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Hit { source, entry } => {
                assert_eq!(source, CacheSource::Kv);
                assert_eq!(entry.response, response("persisted"));
            }
            CacheDecision::Build(_) => panic!("kv tier should have answered"),
        }

        // Promotion: the next lookup is a memory hit.
        match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Hit { source, .. } => assert_eq!(source, CacheSource::Memory),
            CacheDecision::Build(_) => panic!("promotion failed"),
        }
    }

    #[tokio::test]
    async fn failing_kv_degrades_silently() {
        struct BrokenKv;

        #[async_trait]
        impl KvStore for BrokenKv {
            async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, KvError> {
                Err(KvError("connection refused".into()))
            }
            async fn put(&self, _k: &str, _v: Vec<u8>, _t: Duration) -> Result<(), KvError> {
                Err(KvError("connection refused".into()))
            }
            async fn remove(&self, _key: &str) -> Result<(), KvError> {
                Err(KvError("connection refused".into()))
            }
            async fn clear(&self) -> Result<(), KvError> {
                Err(KvError("connection refused".into()))
            }
        }

        let bus = EventBus::new();
        let sink = crate::events::MemorySink::new();
        bus.subscribe(Arc::new(sink.clone()));
        let options = CacheOptions { kv_enabled: true, ..CacheOptions::default() };
        let cache = RequestCache::new(
            options,
            FingerprintOptions::default(),
            Arc::new(ManualClock::new()),
            bus,
        )
        .unwrap()
        .with_kv_store(Arc::new(BrokenKv));

        let req = request("kv down");
        let guard = match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            _ => panic!("leader expected"),
        };
        // Store succeeds despite the broken KV tier.
        cache.commit(guard, &req, &response("still fine"), metadata()).await;

        match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Hit { source, .. } => assert_eq!(source, CacheSource::Memory),
            CacheDecision::Build(_) => panic!("memory should still serve"),
        }

        // Degradation reported once within the window, not per operation.
        let degradations = sink
            .events()
            .iter()
            .filter(|e| matches!(e, FabricEvent::CacheDegraded { tier: DegradedTier::Kv, .. }))
            .count();
        assert_eq!(degradations, 1);
    }

    #[tokio::test]
    async fn disk_spill_honors_size_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let options = CacheOptions {
            disk_enabled: true,
            disk_path: dir.path().to_path_buf(),
            disk_spill_threshold: 200,
            ..CacheOptions::default()
        };
        let cache = cache(options);

        let small_req = request("small");
        let guard = match cache.begin(&small_req, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            _ => panic!("leader expected"),
        };
        cache.commit(guard, &small_req, &response("tiny"), metadata()).await;
        assert_eq!(cache.stats().bytes_disk, 0, "small responses stay off disk");

        let big_req = request("big");
        let guard = match cache.begin(&big_req, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            _ => panic!("leader expected"),
        };
        cache.commit(guard, &big_req, &response(&"x".repeat(500)), metadata()).await;
        assert!(cache.stats().bytes_disk > 0, "large responses spill to disk");

        // Disk tier serves after memory is wiped.
        cache.memory.clear();
        match cache.begin(&big_req, None).await.unwrap() {
            CacheDecision::Hit { source, .. } => assert_eq!(source, CacheSource::Disk),
            CacheDecision::Build(_) => panic!("disk tier should have answered"),
        }
    }

    #[tokio::test]
    async fn semantic_lookup_finds_near_duplicates() {
        let options = CacheOptions {
            semantic_enabled: true,
            semantic_threshold: 0.6,
            ..CacheOptions::default()
        };
        let cache = cache(options);

        let seeded = request("how do i parse json in rust");
        let guard = match cache.begin(&seeded, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            _ => panic!("leader expected"),
        };
        cache.commit(guard, &seeded, &response("use serde"), metadata()).await;

        // Different fingerprint, heavily overlapping token set.
        let similar = request("how do i parse json in rust please");
        match cache.begin(&similar, None).await.unwrap() {
            CacheDecision::Hit { source, entry } => {
                assert_eq!(source, CacheSource::Semantic);
                assert_eq!(entry.response, response("use serde"));
            }
            CacheDecision::Build(guard) => {
                drop(guard);
                panic!("semantic scan should have matched");
            }
        }
        assert_eq!(cache.stats().hits_semantic, 1);

        // An unrelated request stays a miss.
        let unrelated = request("completely different topic entirely");
        assert!(matches!(
            cache.begin(&unrelated, None).await.unwrap(),
            CacheDecision::Build(_)
        ));
    }

    #[tokio::test]
    async fn invalidate_by_pattern_and_full_clear() {
        let cache = cache(CacheOptions::default());
        for text in ["cats are great", "dogs are great"] {
            let req = request(text);
            let guard = match cache.begin(&req, None).await.unwrap() {
                CacheDecision::Build(guard) => guard,
                _ => panic!("leader expected"),
            };
            cache.commit(guard, &req, &response(text), metadata()).await;
        }

        assert_eq!(cache.invalidate(Some("cats")).await, 1);
        assert_eq!(cache.stats().entries, 1);

        assert_eq!(cache.invalidate(None).await, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn top_fingerprints_track_hot_entries() {
        let cache = cache(CacheOptions::default());
        let req = request("hot");
        let guard = match cache.begin(&req, None).await.unwrap() {
            CacheDecision::Build(guard) => guard,
            _ => panic!("leader expected"),
        };
        cache.commit(guard, &req, &response("hot"), metadata()).await;

        for _ in 0..3 {
            let _ = cache.begin(&req, None).await.unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.top_fingerprints.len(), 1);
        assert_eq!(stats.top_fingerprints[0].1, 3);
    }
}
