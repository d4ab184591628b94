//! Per-provider connection pool with session affinity support.
//!
//! Connections are long-lived multiplexing slots: each carries a capacity
//! (concurrent in-flight calls) and is reused until idle or lifetime expiry.
//! Checkout prefers a sticky session's remembered connection, then its
//! fallbacks, then the least-loaded healthy slot; a new connection is opened
//! while the fleet is under `max_sockets`, otherwise the caller waits with a
//! bounded timeout. A janitor sweep retires expired slots and publishes
//! [`FabricEvent::ConnectionRetired`] so the session index can reconcile.

use crate::error::RelayError;
use crate::events::{EventBus, FabricEvent, RetireReason};
use crate::session::SessionAffinity;
use crate::time::{Clock, Deadline};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Identifier of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first group is plenty for logs.
        let s = self.0.to_string();
        write!(f, "{}", &s[..8])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Connection fleet ceiling per provider.
    pub max_sockets: usize,
    /// Free (zero in-flight) connections kept warm beyond which the sweep
    /// trims, oldest idle first.
    pub max_free_sockets: usize,
    pub idle_timeout: Duration,
    /// Keep-alive deadline for free connections; a shorter horizon than
    /// `idle_timeout` trims warm slots earlier.
    pub keep_alive: Duration,
    pub max_lifetime: Duration,
    /// Concurrent in-flight calls multiplexed on one connection.
    pub capacity_per_connection: u32,
    /// How long a checkout may wait for a free slot.
    pub acquire_timeout: Duration,
    /// A sticky session may ride its preferred connection up to this share
    /// of capacity even when a less-loaded slot exists.
    pub sticky_load_factor: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets: 50,
            max_free_sockets: 10,
            idle_timeout: Duration::from_secs(300),
            keep_alive: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(30 * 60),
            capacity_per_connection: 8,
            acquire_timeout: Duration::from_secs(30),
            sticky_load_factor: 0.8,
        }
    }
}

struct ConnState {
    id: ConnectionId,
    created_at: u64,
    last_used: u64,
    in_flight: u32,
    capacity: u32,
    reuse_count: u64,
    healthy: bool,
}

impl ConnState {
    fn new(now: u64, capacity: u32) -> Self {
        Self {
            id: ConnectionId::new(),
            created_at: now,
            last_used: now,
            in_flight: 1,
            capacity,
            reuse_count: 0,
            healthy: true,
        }
    }

    fn lifetime_expired(&self, now: u64, config: &PoolConfig) -> bool {
        now.saturating_sub(self.created_at) > config.max_lifetime.as_millis() as u64
    }

    fn idle_expired(&self, now: u64, config: &PoolConfig) -> bool {
        let horizon = config.idle_timeout.min(config.keep_alive).as_millis() as u64;
        self.in_flight == 0 && now.saturating_sub(self.last_used) > horizon
    }

    fn usable(&self, now: u64, config: &PoolConfig) -> bool {
        self.healthy && self.in_flight < self.capacity && !self.lifetime_expired(now, config)
    }
}

struct ProviderState {
    conns: Vec<ConnState>,
    notify: Arc<Notify>,
}

impl ProviderState {
    fn new() -> Self {
        Self { conns: Vec::new(), notify: Arc::new(Notify::new()) }
    }
}

struct PoolInner {
    state: Mutex<HashMap<String, ProviderState>>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

/// Checked-out slot on a connection. Dropping the lease releases the slot;
/// [`ConnectionLease::release`] does so explicitly.
pub struct ConnectionLease {
    provider: String,
    id: ConnectionId,
    inner: Arc<PoolInner>,
    released: bool,
}

impl ConnectionLease {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Return the slot: decrement in-flight, refresh last-used, wake one
    /// waiter.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.inner.release_slot(&self.provider, self.id);
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.do_release();
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("provider", &self.provider)
            .field("id", &self.id)
            .finish()
    }
}

/// Per-provider occupancy for the health surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub provider: String,
    pub connections: usize,
    pub in_flight: u32,
    pub free: usize,
    pub total_reuses: u64,
}

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(HashMap::new()),
                config,
                clock,
                events,
            }),
        }
    }

    /// Check out a connection slot for `provider`.
    ///
    /// Selection order: the session's preferred connection (sticky, allowed
    /// up to `sticky_load_factor` of capacity), its fallbacks, the
    /// least-loaded healthy connection, a freshly opened one while under
    /// `max_sockets`, otherwise wait until `acquire_timeout` (clamped by the
    /// request deadline).
    pub async fn get(
        &self,
        provider: &str,
        affinity: Option<&SessionAffinity>,
        deadline: Option<Deadline>,
    ) -> Result<ConnectionLease, RelayError> {
        let notify = {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            let entry = state.entry(provider.to_string()).or_insert_with(ProviderState::new);
            Arc::clone(&entry.notify)
        };

        let mut budget = self.inner.config.acquire_timeout;
        if let Some(deadline) = deadline {
            budget = deadline.clamp(budget, self.inner.clock.as_ref());
        }

        let wait = async {
            loop {
                if let Some(id) = self.inner.try_checkout(provider, affinity) {
                    return id;
                }
                // A release landing between the failed checkout and this
                // await leaves a stored permit, so the wakeup is never lost.
                notify.notified().await;
            }
        };

        match tokio::time::timeout(budget, wait).await {
            Ok(id) => Ok(ConnectionLease {
                provider: provider.to_string(),
                id,
                inner: Arc::clone(&self.inner),
                released: false,
            }),
            Err(_) => Err(RelayError::PoolExhausted {
                provider: provider.to_string(),
                waited: budget,
            }),
        }
    }

    /// Flag a connection after an error classified connection-fatal. The
    /// slot is retired immediately when idle, otherwise on its release.
    pub fn mark_fatal(&self, provider: &str, id: ConnectionId) {
        let retired = {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            let Some(entry) = state.get_mut(provider) else {
                return;
            };
            let Some(conn) = entry.conns.iter_mut().find(|c| c.id == id) else {
                return;
            };
            conn.healthy = false;
            if conn.in_flight == 0 {
                entry.conns.retain(|c| c.id != id);
                entry.notify.notify_one();
                true
            } else {
                false
            }
        };
        if retired {
            self.inner.emit_retired(provider, id, RetireReason::Fatal);
        }
    }

    /// Janitor pass: retire idle-expired, lifetime-expired, and surplus free
    /// connections. Runs on a fixed interval from the container.
    pub fn sweep(&self) {
        let now = self.inner.clock.now_millis();
        let mut retired: Vec<(String, ConnectionId, RetireReason)> = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            for (provider, entry) in state.iter_mut() {
                let config = &self.inner.config;
                entry.conns.retain(|conn| {
                    if conn.in_flight > 0 {
                        return true;
                    }
                    if !conn.healthy {
                        retired.push((provider.clone(), conn.id, RetireReason::Fatal));
                        return false;
                    }
                    if conn.lifetime_expired(now, config) {
                        retired.push((provider.clone(), conn.id, RetireReason::LifetimeExpired));
                        return false;
                    }
                    if conn.idle_expired(now, config) {
                        retired.push((provider.clone(), conn.id, RetireReason::IdleExpired));
                        return false;
                    }
                    true
                });

                // Trim surplus warm connections, oldest idle first.
                let mut free: Vec<(u64, ConnectionId)> = entry
                    .conns
                    .iter()
                    .filter(|c| c.in_flight == 0)
                    .map(|c| (c.last_used, c.id))
                    .collect();
                if free.len() > self.inner.config.max_free_sockets {
                    free.sort();
                    let surplus = free.len() - self.inner.config.max_free_sockets;
                    let victims: Vec<ConnectionId> =
                        free.into_iter().take(surplus).map(|(_, id)| id).collect();
                    entry.conns.retain(|c| {
                        if victims.contains(&c.id) {
                            retired.push((provider.clone(), c.id, RetireReason::IdleExpired));
                            false
                        } else {
                            true
                        }
                    });
                }

                if !retired.is_empty() {
                    entry.notify.notify_waiters();
                }
            }
        }
        for (provider, id, reason) in retired {
            self.inner.emit_retired(&provider, id, reason);
        }
    }

    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        let state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<PoolSnapshot> = state
            .iter()
            .map(|(provider, entry)| PoolSnapshot {
                provider: provider.clone(),
                connections: entry.conns.len(),
                in_flight: entry.conns.iter().map(|c| c.in_flight).sum(),
                free: entry.conns.iter().filter(|c| c.in_flight == 0).count(),
                total_reuses: entry.conns.iter().map(|c| c.reuse_count).sum(),
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool").field("providers", &self.snapshot().len()).finish()
    }
}

impl PoolInner {
    fn try_checkout(&self, provider: &str, affinity: Option<&SessionAffinity>) -> Option<ConnectionId> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let entry = state.get_mut(provider)?;

        // Sticky path: the preferred connection wins even at higher load,
        // up to the configured share of its capacity.
        if let Some(affinity) = affinity.filter(|a| a.sticky) {
            let sticky_cap = |conn: &ConnState| {
                ((conn.capacity as f64) * self.config.sticky_load_factor).floor() as u32
            };
            let candidates =
                affinity.preferred.iter().chain(affinity.fallbacks.iter()).copied();
            for wanted in candidates {
                if let Some(conn) = entry.conns.iter_mut().find(|c| c.id == wanted) {
                    if conn.healthy
                        && !conn.lifetime_expired(now, &self.config)
                        && conn.in_flight < sticky_cap(conn).max(1)
                    {
                        return Some(checkout(conn, now));
                    }
                }
            }
        }

        // Least-loaded healthy connection; ties go to the oldest last-used
        // so recycling stays even.
        let pick = entry
            .conns
            .iter_mut()
            .filter(|c| c.usable(now, &self.config))
            .min_by_key(|c| (c.in_flight, c.last_used));
        if let Some(conn) = pick {
            return Some(checkout(conn, now));
        }

        if entry.conns.len() < self.config.max_sockets {
            let conn = ConnState::new(now, self.config.capacity_per_connection.max(1));
            let id = conn.id;
            entry.conns.push(conn);
            tracing::debug!(provider, connection = %id, "opened connection");
            return Some(id);
        }

        None
    }

    fn release_slot(&self, provider: &str, id: ConnectionId) {
        let now = self.clock.now_millis();
        let mut retired = false;
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let Some(entry) = state.get_mut(provider) else {
                return;
            };
            if let Some(conn) = entry.conns.iter_mut().find(|c| c.id == id) {
                conn.in_flight = conn.in_flight.saturating_sub(1);
                conn.last_used = now;
                if !conn.healthy && conn.in_flight == 0 {
                    entry.conns.retain(|c| c.id != id);
                    retired = true;
                }
            }
            entry.notify.notify_one();
        }
        if retired {
            self.emit_retired(provider, id, RetireReason::Fatal);
        }
    }

    fn emit_retired(&self, provider: &str, id: ConnectionId, reason: RetireReason) {
        self.events.emit(FabricEvent::ConnectionRetired {
            provider: provider.to_string(),
            connection: id,
            reason,
        });
    }
}

fn checkout(conn: &mut ConnState, now: u64) -> ConnectionId {
    conn.in_flight += 1;
    conn.reuse_count += 1;
    conn.last_used = now;
    conn.id
}
