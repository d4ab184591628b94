//! Request counters, latency histograms, rolling throughput.
//!
//! Kept deliberately in-process: persistence and scraping belong to outside
//! collaborators. The health surface reads [`Metrics::snapshot`].

use crate::rate_limit::strategies::SlidingWindow;
use crate::time::Clock;
use hdrhistogram::Histogram;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(60);

pub struct Metrics {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    failovers: AtomicU64,
    overall: Mutex<Histogram<u64>>,
    per_target: Mutex<HashMap<String, Histogram<u64>>>,
    per_provider_minute: Mutex<HashMap<String, SlidingWindow>>,
    clock: Arc<dyn Clock>,
}

/// Latency percentiles for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetLatency {
    pub target: String,
    pub count: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub failovers: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub per_target: Vec<TargetLatency>,
    /// Requests in the trailing minute, per provider.
    pub requests_per_minute: Vec<(String, u32)>,
}

impl Metrics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            overall: Mutex::new(new_histogram()),
            per_target: Mutex::new(HashMap::new()),
            per_provider_minute: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn record(
        &self,
        target: &str,
        provider: &str,
        latency: Duration,
        success: bool,
        failover: bool,
    ) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if failover {
            self.failovers.fetch_add(1, Ordering::Relaxed);
        }

        let millis = latency.as_millis() as u64;
        {
            let mut overall = self.overall.lock().unwrap_or_else(|p| p.into_inner());
            overall.saturating_record(millis);
        }
        {
            let mut per_target = self.per_target.lock().unwrap_or_else(|p| p.into_inner());
            per_target
                .entry(target.to_string())
                .or_insert_with(new_histogram)
                .saturating_record(millis);
        }
        {
            let now = self.clock.now_millis();
            let mut minute =
                self.per_provider_minute.lock().unwrap_or_else(|p| p.into_inner());
            let window = minute
                .entry(provider.to_string())
                .or_insert_with(|| SlidingWindow::new(u32::MAX, WINDOW));
            let _ = window.check(now);
        }
    }

    /// Requests observed for `provider` in the trailing minute.
    pub fn requests_last_minute(&self, provider: &str) -> u32 {
        let now = self.clock.now_millis();
        let mut minute = self.per_provider_minute.lock().unwrap_or_else(|p| p.into_inner());
        minute.get_mut(provider).map(|w| w.count(now)).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let overall = self.overall.lock().unwrap_or_else(|p| p.into_inner());
        let per_target = self.per_target.lock().unwrap_or_else(|p| p.into_inner());
        let now = self.clock.now_millis();
        let mut minute = self.per_provider_minute.lock().unwrap_or_else(|p| p.into_inner());

        let mut targets: Vec<TargetLatency> = per_target
            .iter()
            .map(|(target, histogram)| TargetLatency {
                target: target.clone(),
                count: histogram.len(),
                p50_ms: histogram.value_at_quantile(0.50),
                p95_ms: histogram.value_at_quantile(0.95),
                p99_ms: histogram.value_at_quantile(0.99),
            })
            .collect();
        targets.sort_by(|a, b| a.target.cmp(&b.target));

        let mut requests_per_minute: Vec<(String, u32)> =
            minute.iter_mut().map(|(provider, w)| (provider.clone(), w.count(now))).collect();
        requests_per_minute.sort();

        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            p50_ms: overall.value_at_quantile(0.50),
            p95_ms: overall.value_at_quantile(0.95),
            p99_ms: overall.value_at_quantile(0.99),
            per_target: targets,
            requests_per_minute,
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .finish()
    }
}

fn new_histogram() -> Histogram<u64> {
    // 1ms..1h, three significant figures.
    Histogram::new_with_bounds(1, 3_600_000, 3).expect("static histogram bounds are valid")
}
