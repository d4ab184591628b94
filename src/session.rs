//! Session affinity index.
//!
//! Sessions remember which connection served them so follow-up requests can
//! ride the same warm socket. The index is deliberately one-way: sessions
//! store connection ids, connections know nothing about sessions, and
//! retirement events scrub dangling references.

use crate::events::{EventSink, FabricEvent};
use crate::pool::ConnectionId;
use crate::request::Priority;
use crate::time::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Sessions idle beyond this are reaped.
    pub inactivity_timeout: Duration,
    /// Previous preferred connections remembered as fallbacks.
    pub max_fallbacks: usize,
    /// Whether new sessions default to sticky routing.
    pub sticky_by_default: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(30 * 60),
            max_fallbacks: 3,
            sticky_by_default: true,
        }
    }
}

/// Snapshot handed to the connection pool for one checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAffinity {
    pub session_id: String,
    pub sticky: bool,
    pub preferred: Option<ConnectionId>,
    pub fallbacks: Vec<ConnectionId>,
    pub priority: Priority,
}

struct SessionState {
    provider: String,
    priority: Priority,
    sticky: bool,
    preferred: Option<ConnectionId>,
    fallbacks: Vec<ConnectionId>,
    first_seen: u64,
    last_active: u64,
    request_count: u64,
    latency_avg_ms: f64,
}

/// Per-session view for the health surface.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub provider: String,
    pub priority: Priority,
    pub request_count: u64,
    pub latency_avg_ms: f64,
    pub idle_for: Duration,
}

pub struct SessionIndex {
    inner: Mutex<HashMap<String, SessionState>>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl SessionIndex {
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self { inner: Mutex::new(HashMap::new()), config, clock }
    }

    /// Refresh (or create) a session and return its affinity snapshot.
    pub fn touch(&self, session_id: &str, provider: &str, priority: Priority) -> SessionAffinity {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let state = inner.entry(session_id.to_string()).or_insert_with(|| SessionState {
            provider: provider.to_string(),
            priority,
            sticky: self.config.sticky_by_default,
            preferred: None,
            fallbacks: Vec::new(),
            first_seen: now,
            last_active: now,
            request_count: 0,
            latency_avg_ms: 0.0,
        });
        state.last_active = now;
        state.priority = priority;
        // A session that moves providers abandons its old affinity.
        if state.provider != provider {
            state.provider = provider.to_string();
            state.preferred = None;
            state.fallbacks.clear();
        }
        SessionAffinity {
            session_id: session_id.to_string(),
            sticky: state.sticky,
            preferred: state.preferred,
            fallbacks: state.fallbacks.clone(),
            priority: state.priority,
        }
    }

    /// Record a completed request: the connection that served it becomes the
    /// preferred one, the previous preferred joins the fallback list.
    pub fn record_result(&self, session_id: &str, connection: ConnectionId, latency: Duration) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(state) = inner.get_mut(session_id) else {
            return;
        };
        state.last_active = now;
        state.request_count += 1;
        let latency_ms = latency.as_millis() as f64;
        state.latency_avg_ms +=
            (latency_ms - state.latency_avg_ms) / state.request_count as f64;

        if state.preferred != Some(connection) {
            if let Some(previous) = state.preferred.replace(connection) {
                state.fallbacks.retain(|&id| id != previous && id != connection);
                state.fallbacks.insert(0, previous);
                state.fallbacks.truncate(self.config.max_fallbacks);
            } else {
                state.fallbacks.retain(|&id| id != connection);
            }
        }
    }

    /// Scrub references to a retired connection from every session.
    pub fn on_connection_retired(&self, connection: ConnectionId) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for state in inner.values_mut() {
            if state.preferred == Some(connection) {
                state.preferred = None;
            }
            state.fallbacks.retain(|&id| id != connection);
        }
    }

    /// Drop sessions idle beyond the inactivity window. Returns how many
    /// were reaped.
    pub fn reap(&self) -> usize {
        let now = self.clock.now_millis();
        let horizon = self.config.inactivity_timeout.as_millis() as u64;
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = inner.len();
        inner.retain(|_, state| now.saturating_sub(state.last_active) <= horizon);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = self.clock.now_millis();
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<SessionSnapshot> = inner
            .iter()
            .map(|(id, state)| SessionSnapshot {
                session_id: id.clone(),
                provider: state.provider.clone(),
                priority: state.priority,
                request_count: state.request_count,
                latency_avg_ms: state.latency_avg_ms,
                idle_for: Duration::from_millis(now.saturating_sub(state.last_active)),
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }
}

impl std::fmt::Debug for SessionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIndex").field("sessions", &self.len()).finish()
    }
}

/// Event subscriber that keeps the index consistent with the pool. Wired up
/// at container build time.
pub struct SessionReconciler(pub Arc<SessionIndex>);

impl EventSink for SessionReconciler {
    fn on_event(&self, event: &FabricEvent) {
        if let FabricEvent::ConnectionRetired { connection, .. } = event {
            self.0.on_connection_retired(*connection);
        }
    }
}
