//! Typed lifecycle events and their fan-out bus.
//!
//! Components publish operational transitions (breaker state changes, key
//! health changes, connection retirements, cache degradations) as structured
//! [`FabricEvent`]s. Subscribers are registered when the container is built;
//! emission never blocks request completion, so sinks must stay cheap.

use crate::breaker::CircuitState;
use crate::credentials::KeyHealth;
use crate::pool::ConnectionId;
use crate::request::Target;
use crate::sequential::QueueMode;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Why a pooled connection was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    IdleExpired,
    LifetimeExpired,
    /// An error classified connection-fatal was observed on it.
    Fatal,
    /// Pool shutdown or explicit drain.
    Drained,
}

/// Cache tier that degraded (the memory tier cannot degrade).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedTier {
    Kv,
    Disk,
}

/// Operational events emitted by the core's components.
#[derive(Debug, Clone, PartialEq)]
pub enum FabricEvent {
    BreakerTransition {
        target: Target,
        from: CircuitState,
        to: CircuitState,
    },
    CredentialStateChanged {
        provider: String,
        key_id: String,
        from: KeyHealth,
        to: KeyHealth,
    },
    CredentialRateLimited {
        provider: String,
        key_id: String,
        resume_in: Duration,
    },
    ConnectionRetired {
        provider: String,
        connection: ConnectionId,
        reason: RetireReason,
    },
    CacheDegraded {
        tier: DegradedTier,
        message: String,
    },
    SequentialModeChanged {
        /// `None` means the global default changed.
        provider: Option<String>,
        mode: QueueMode,
    },
}

/// Consumer of fabric events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &FabricEvent);
}

/// Sink that logs every event through `tracing` at a level matching its
/// operational weight.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&self, event: &FabricEvent) {
        match event {
            FabricEvent::BreakerTransition { target, from, to } => {
                if *to == CircuitState::Open {
                    tracing::error!(%target, ?from, ?to, "circuit breaker opened");
                } else {
                    tracing::info!(%target, ?from, ?to, "circuit breaker transition");
                }
            }
            FabricEvent::CredentialStateChanged { provider, key_id, from, to } => {
                if *to == KeyHealth::Unavailable {
                    tracing::error!(provider, key_id, ?from, ?to, "credential unavailable");
                } else {
                    tracing::warn!(provider, key_id, ?from, ?to, "credential health changed");
                }
            }
            FabricEvent::CredentialRateLimited { provider, key_id, resume_in } => {
                tracing::warn!(provider, key_id, ?resume_in, "credential rate limited");
            }
            FabricEvent::ConnectionRetired { provider, connection, reason } => {
                tracing::debug!(provider, %connection, ?reason, "connection retired");
            }
            FabricEvent::CacheDegraded { tier, message } => {
                tracing::warn!(?tier, message, "cache tier degraded");
            }
            FabricEvent::SequentialModeChanged { provider, mode } => {
                tracing::info!(?provider, ?mode, "sequential mode changed");
            }
        }
    }
}

/// Sink that records events in memory. Test helper.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<FabricEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FabricEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl EventSink for MemorySink {
    fn on_event(&self, event: &FabricEvent) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).push(event.clone());
    }
}

/// Fan-out bus handed to every component. Cloning is cheap; all clones share
/// the subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().unwrap_or_else(|p| p.into_inner()).push(sink);
    }

    pub fn emit(&self, event: FabricEvent) {
        let sinks = self.sinks.read().unwrap_or_else(|p| p.into_inner());
        for sink in sinks.iter() {
            sink.on_event(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.sinks.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("sinks", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_fans_out_to_all_sinks() {
        let bus = EventBus::new();
        let a = MemorySink::new();
        let b = MemorySink::new();
        bus.subscribe(Arc::new(a.clone()));
        bus.subscribe(Arc::new(b.clone()));

        bus.emit(FabricEvent::CacheDegraded {
            tier: DegradedTier::Disk,
            message: "io error".into(),
        });

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn empty_bus_emission_is_a_noop() {
        let bus = EventBus::new();
        bus.emit(FabricEvent::SequentialModeChanged { provider: None, mode: QueueMode::Normal });
    }

    #[test]
    fn memory_sink_clears() {
        let bus = EventBus::new();
        let sink = MemorySink::new();
        bus.subscribe(Arc::new(sink.clone()));
        bus.emit(FabricEvent::CacheDegraded { tier: DegradedTier::Kv, message: "x".into() });
        assert!(!sink.is_empty());
        sink.clear();
        assert!(sink.is_empty());
    }
}
