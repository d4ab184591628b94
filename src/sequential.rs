//! Sequential mode: per-provider one-at-a-time execution.
//!
//! When a provider runs in sequential mode every request takes a turn
//! through its queue: at most one is in flight at any instant, ordering is
//! priority first ({critical, high, normal, low}) then submission order, and
//! a short dwell after each completion lets the warm connection be reused by
//! the next turn. Submissions near in time land in the same dwell window and
//! are therefore ordered by priority rather than arrival.
//!
//! Switching a provider back to normal mode drains its queue: every waiter
//! is completed with an instruction to proceed through the regular path.

use crate::error::RelayError;
use crate::events::{EventBus, FabricEvent};
use crate::request::Priority;
use crate::time::{Clock, Deadline, Sleeper};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    #[default]
    Normal,
    Sequential,
}

/// Queue lifecycle for the health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Idle,
    Processing,
    Draining,
}

/// Live sequential-mode settings. Held behind an `ArcSwap` so mode switches
/// apply to in-flight traffic without locking.
#[derive(Debug, Clone, PartialEq)]
pub struct SequentialSettings {
    pub default_mode: QueueMode,
    pub overrides: HashMap<String, QueueMode>,
    pub max_queue: usize,
    pub queue_timeout: Duration,
    /// Dwell between turns, letting the next request reuse the warm
    /// connection.
    pub reuse_window: Duration,
}

impl Default for SequentialSettings {
    fn default() -> Self {
        Self {
            default_mode: QueueMode::Normal,
            overrides: HashMap::new(),
            max_queue: 100,
            queue_timeout: Duration::from_secs(60),
            reuse_window: Duration::from_millis(10),
        }
    }
}

impl SequentialSettings {
    pub fn mode_for(&self, provider: &str) -> QueueMode {
        self.overrides.get(provider).copied().unwrap_or(self.default_mode)
    }
}

enum TurnGrant {
    Proceed,
    PassThrough,
}

struct Waiter {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<TurnGrant>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<Waiter>,
    seq: u64,
    busy: bool,
    phase: QueuePhase,
}

struct ProviderQueue {
    provider: String,
    inner: Mutex<QueueInner>,
}

impl ProviderQueue {
    fn new(provider: String) -> Self {
        Self {
            provider,
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                seq: 0,
                busy: false,
                phase: QueuePhase::Idle,
            }),
        }
    }

    /// Grant the best waiter the turn if nothing is in flight. Waiters that
    /// gave up (deadline, cancellation) dropped their receiver and are
    /// skipped here.
    fn grant_if_idle(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.busy || inner.phase == QueuePhase::Draining {
            return;
        }
        while let Some(waiter) = inner.heap.pop() {
            if waiter.tx.send(TurnGrant::Proceed).is_ok() {
                inner.busy = true;
                inner.phase = QueuePhase::Processing;
                return;
            }
        }
        inner.phase = QueuePhase::Idle;
    }

    fn finish(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.busy = false;
            if inner.phase == QueuePhase::Processing {
                inner.phase = QueuePhase::Idle;
            }
        }
        self.grant_if_idle();
    }

    fn drain(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.phase = QueuePhase::Draining;
        while let Some(waiter) = inner.heap.pop() {
            let _ = waiter.tx.send(TurnGrant::PassThrough);
        }
    }
}

/// Permission to run one request against a sequential provider. Completing
/// the ticket (after the upstream call) waits the reuse window and hands the
/// turn to the next waiter; dropping it without completion releases the turn
/// immediately.
#[must_use = "the turn must be completed (or dropped) to unblock the queue"]
pub struct TurnTicket {
    queue: Arc<ProviderQueue>,
    sleeper: Arc<dyn Sleeper>,
    dwell: Duration,
    done: bool,
}

impl TurnTicket {
    pub async fn complete(mut self) {
        self.done = true;
        self.sleeper.sleep(self.dwell).await;
        self.queue.finish();
    }
}

impl Drop for TurnTicket {
    fn drop(&mut self) {
        if !self.done {
            self.queue.finish();
        }
    }
}

impl std::fmt::Debug for TurnTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnTicket").field("provider", &self.queue.provider).finish()
    }
}

/// Result of submitting to the sequential layer.
#[derive(Debug)]
pub enum Turn {
    /// Provider is not serialized (or was drained mid-wait): proceed through
    /// the normal path.
    PassThrough,
    /// The request holds the provider's single in-flight slot.
    Ticket(TurnTicket),
}

/// Per-queue view for the health surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub provider: String,
    pub phase: QueuePhase,
    pub depth: usize,
}

pub struct SequentialManager {
    queues: Mutex<HashMap<String, Arc<ProviderQueue>>>,
    settings: ArcSwap<SequentialSettings>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus,
}

impl SequentialManager {
    pub fn new(
        settings: SequentialSettings,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        events: EventBus,
    ) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            settings: ArcSwap::from_pointee(settings),
            clock,
            sleeper,
            events,
        }
    }

    pub fn mode_for(&self, provider: &str) -> QueueMode {
        self.settings.load().mode_for(provider)
    }

    /// Take a turn for `provider`. Returns immediately with
    /// [`Turn::PassThrough`] when the provider is in normal mode; otherwise
    /// waits for the turn, bounded by the queue timeout and the request
    /// deadline.
    pub async fn submit(
        &self,
        provider: &str,
        priority: Priority,
        deadline: Option<Deadline>,
    ) -> Result<Turn, RelayError> {
        let settings = self.settings.load_full();
        if settings.mode_for(provider) == QueueMode::Normal {
            return Ok(Turn::PassThrough);
        }

        let queue = self.queue(provider);
        let rx = {
            let mut inner = queue.inner.lock().unwrap_or_else(|p| p.into_inner());
            if inner.phase == QueuePhase::Draining {
                // Re-enabled after a drain: the queue starts fresh.
                inner.phase = QueuePhase::Idle;
            }
            if inner.heap.len() >= settings.max_queue {
                return Err(RelayError::QueueFull {
                    provider: provider.to_string(),
                    depth: inner.heap.len(),
                    max: settings.max_queue,
                });
            }
            let (tx, rx) = oneshot::channel();
            inner.seq += 1;
            let seq = inner.seq;
            inner.heap.push(Waiter { priority, seq, tx });
            rx
        };

        // Deferred grant: submissions landing within the same dwell window
        // compete by priority instead of raw arrival order.
        {
            let queue = Arc::clone(&queue);
            let sleeper = Arc::clone(&self.sleeper);
            let dwell = settings.reuse_window;
            tokio::spawn(async move {
                sleeper.sleep(dwell).await;
                queue.grant_if_idle();
            });
        }

        let mut wait = settings.queue_timeout;
        if let Some(deadline) = deadline {
            wait = deadline.clamp(wait, self.clock.as_ref());
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(TurnGrant::Proceed)) => Ok(Turn::Ticket(TurnTicket {
                queue,
                sleeper: Arc::clone(&self.sleeper),
                dwell: settings.reuse_window,
                done: false,
            })),
            Ok(Ok(TurnGrant::PassThrough)) => Ok(Turn::PassThrough),
            // Queue torn down while waiting; fall back to the normal path.
            Ok(Err(_)) => Ok(Turn::PassThrough),
            Err(_) => Err(RelayError::QueueTimeout {
                provider: provider.to_string(),
                waited: wait,
            }),
        }
    }

    /// Switch the global default (`provider = None`) or one provider's mode.
    /// Disabling sequential mode drains affected queues.
    pub fn set_mode(&self, provider: Option<&str>, mode: QueueMode) {
        self.settings.rcu(|settings| {
            let mut next = SequentialSettings::clone(settings);
            match provider {
                Some(provider) => {
                    next.overrides.insert(provider.to_string(), mode);
                }
                None => next.default_mode = mode,
            }
            next
        });
        self.events.emit(FabricEvent::SequentialModeChanged {
            provider: provider.map(str::to_string),
            mode,
        });

        if mode == QueueMode::Normal {
            let settings = self.settings.load();
            let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            for (name, queue) in queues.iter() {
                let affected = match provider {
                    Some(p) => name == p,
                    None => settings.mode_for(name) == QueueMode::Normal,
                };
                if affected {
                    queue.drain();
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<QueueSnapshot> = queues
            .values()
            .map(|queue| {
                let inner = queue.inner.lock().unwrap_or_else(|p| p.into_inner());
                QueueSnapshot {
                    provider: queue.provider.clone(),
                    phase: inner.phase,
                    depth: inner.heap.len(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    fn queue(&self, provider: &str) -> Arc<ProviderQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderQueue::new(provider.to_string())))
            .clone()
    }
}

impl std::fmt::Debug for SequentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialManager")
            .field("settings", &self.settings.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{InstantSleeper, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(settings: SequentialSettings) -> SequentialManager {
        SequentialManager::new(
            settings,
            Arc::new(ManualClock::new()),
            Arc::new(InstantSleeper),
            EventBus::new(),
        )
    }

    fn sequential_settings() -> SequentialSettings {
        SequentialSettings { default_mode: QueueMode::Sequential, ..Default::default() }
    }

    #[tokio::test]
    async fn normal_mode_passes_through() {
        let manager = manager(SequentialSettings::default());
        let turn = manager.submit("prov", Priority::Normal, None).await.unwrap();
        assert!(matches!(turn, Turn::PassThrough));
    }

    #[tokio::test]
    async fn one_in_flight_at_a_time() {
        let manager = Arc::new(manager(sequential_settings()));

        let first = manager.submit("prov", Priority::Normal, None).await.unwrap();
        let Turn::Ticket(first_ticket) = first else {
            panic!("sequential provider must issue tickets");
        };

        // Second submission stays parked while the first turn is held.
        let second = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.submit("prov", Priority::Normal, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "second turn granted while first in flight");

        first_ticket.complete().await;
        let second = second.await.unwrap().unwrap();
        assert!(matches!(second, Turn::Ticket(_)));
    }

    #[tokio::test]
    async fn priority_orders_waiters_fifo_within_class() {
        let manager = Arc::new(manager(sequential_settings()));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the turn so subsequent submissions pile up in the queue.
        let Turn::Ticket(gate) = manager.submit("prov", Priority::Critical, None).await.unwrap()
        else {
            panic!("expected ticket");
        };

        let mut tasks = Vec::new();
        for (label, priority) in
            [("n1", Priority::Normal), ("h", Priority::High), ("n2", Priority::Normal)]
        {
            let manager = Arc::clone(&manager);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let turn = manager.submit("prov", priority, None).await.unwrap();
                if let Turn::Ticket(ticket) = turn {
                    order.lock().unwrap().push(label);
                    ticket.complete().await;
                }
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        gate.complete().await;
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["h", "n1", "n2"]);
    }

    #[tokio::test]
    async fn full_queue_rejects_submissions() {
        let settings = SequentialSettings { max_queue: 1, ..sequential_settings() };
        let manager = Arc::new(manager(settings));

        let Turn::Ticket(_held) = manager.submit("prov", Priority::Normal, None).await.unwrap()
        else {
            panic!("expected ticket");
        };

        // One waiter fits; the next submission bounces.
        let parked = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.submit("prov", Priority::Normal, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = manager.submit("prov", Priority::Normal, None).await.unwrap_err();
        assert!(err.is_queue_full());
        parked.abort();
    }

    #[tokio::test]
    async fn queue_timeout_reports_distinctly() {
        let settings = SequentialSettings {
            queue_timeout: Duration::from_millis(30),
            ..sequential_settings()
        };
        let manager = Arc::new(manager(settings));

        let Turn::Ticket(_held) = manager.submit("prov", Priority::Normal, None).await.unwrap()
        else {
            panic!("expected ticket");
        };

        let err = manager.submit("prov", Priority::Normal, None).await.unwrap_err();
        assert!(err.is_queue_timeout());
    }

    #[tokio::test]
    async fn drain_completes_waiters_as_pass_through() {
        let manager = Arc::new(manager(sequential_settings()));

        let Turn::Ticket(_held) = manager.submit("prov", Priority::Normal, None).await.unwrap()
        else {
            panic!("expected ticket");
        };

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.submit("prov", Priority::Normal, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.set_mode(Some("prov"), QueueMode::Normal);

        let turn = waiter.await.unwrap().unwrap();
        assert!(matches!(turn, Turn::PassThrough), "drained waiter proceeds normally");
        assert_eq!(manager.mode_for("prov"), QueueMode::Normal);

        // New submissions bypass the queue entirely.
        let turn = manager.submit("prov", Priority::Normal, None).await.unwrap();
        assert!(matches!(turn, Turn::PassThrough));
    }

    #[tokio::test]
    async fn dropped_ticket_releases_the_turn() {
        let manager = Arc::new(manager(sequential_settings()));

        let Turn::Ticket(ticket) = manager.submit("prov", Priority::Normal, None).await.unwrap()
        else {
            panic!("expected ticket");
        };
        drop(ticket); // e.g. the request was cancelled mid-flight

        let turn = manager.submit("prov", Priority::Normal, None).await.unwrap();
        assert!(matches!(turn, Turn::Ticket(_)));
    }

    #[tokio::test]
    async fn per_provider_override_beats_default() {
        let mut settings = SequentialSettings::default();
        settings.overrides.insert("slow".to_string(), QueueMode::Sequential);
        let manager = manager(settings);

        assert_eq!(manager.mode_for("slow"), QueueMode::Sequential);
        assert_eq!(manager.mode_for("fast"), QueueMode::Normal);

        let turn = manager.submit("fast", Priority::Normal, None).await.unwrap();
        assert!(matches!(turn, Turn::PassThrough));
        let turn = manager.submit("slow", Priority::Normal, None).await.unwrap();
        assert!(matches!(turn, Turn::Ticket(_)));
    }

    #[tokio::test]
    async fn usage_counter_sanity() {
        // Ten sequential turns never overlap.
        let manager = Arc::new(manager(sequential_settings()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let turn = manager.submit("prov", Priority::Normal, None).await.unwrap();
                if let Turn::Ticket(ticket) = turn {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    ticket.complete().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "sequential mode overlapped");
    }
}
