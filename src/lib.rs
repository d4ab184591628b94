#![forbid(unsafe_code)]

//! # Switchyard
//!
//! Request-routing and resilience core for heterogeneous model providers:
//! deterministic failover with circuit breaking, credential rotation with
//! per-key health and budgets, connection pooling with session affinity,
//! per-provider sequential execution, a multi-tier response cache with
//! single-flight builds, and a multi-dimensional rate limiter.
//!
//! The crate is the middle of a gateway: an external router classifies
//! requests and hands them over as [`InferenceRequest`]s; provider
//! wire-format translation happens behind the [`UpstreamClient`] trait.
//! Everything in between — which target, which key, which connection, when
//! to retry, when to give up, when to answer from cache — lives here.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use switchyard::prelude::*;
//!
//! struct EchoUpstream;
//!
//! #[async_trait::async_trait]
//! impl UpstreamClient for EchoUpstream {
//!     async fn call(&self, call: UpstreamCall<'_>) -> Result<UpstreamResponse, UpstreamError> {
//!         Ok(UpstreamResponse::new(serde_json::json!({
//!             "echo": call.request.messages.len(),
//!         })))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_json_str(r#"{
//!         "credentials": { "providers": { "openrouter": { "keys": [{ "key": "sk-demo" }] } } },
//!         "failover": { "targets": ["openrouter,anthropic/claude-3.5-sonnet"] }
//!     }"#)?;
//!
//!     let fabric = Fabric::builder(config)
//!         .upstream(Arc::new(EchoUpstream))
//!         .build()?;
//!
//!     let request = InferenceRequest::new(
//!         "openrouter,anthropic/claude-3.5-sonnet",
//!         vec![Message::new("user", "hello")],
//!     );
//!     let envelope = fabric.execute(&request).await?;
//!     assert_eq!(envelope.attempts, 1);
//!     assert_eq!(envelope.target_used, "openrouter,anthropic/claude-3.5-sonnet");
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod fabric;
pub mod failover;
pub mod jitter;
pub mod metrics;
pub mod pool;
pub mod rate_limit;
pub mod request;
pub mod retry;
pub mod sequential;
pub mod session;
pub mod time;
pub mod upstream;

// Re-exports of the primary surface.
pub use backoff::{Backoff, MAX_BACKOFF};
pub use breaker::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState,
};
pub use cache::{
    CacheDecision, CacheEntry, CacheOptions, CacheStats, Fingerprint, FingerprintOptions,
    InMemoryKvStore, JaccardMatcher, KvStore, RequestCache, SemanticMatcher,
};
pub use config::{Config, ConfigError};
pub use credentials::{
    CredentialLease, CredentialOutcome, CredentialPool, CredentialSpec, KeyHealth,
    NoCredentialAvailable, OutcomeKind, RotationStrategy,
};
pub use error::{ErrorKind, RelayError, UpstreamError};
pub use events::{EventBus, EventSink, FabricEvent, LogSink, MemorySink};
pub use fabric::{Fabric, FabricBuilder, HealthSnapshot};
pub use failover::{FailoverController, FailoverOptions};
pub use jitter::Jitter;
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::{ConnectionId, ConnectionLease, ConnectionPool, PoolConfig};
pub use rate_limit::{Algorithm, Decision, Dimension, RateLimitRule, RateLimiter};
pub use request::{
    CacheSource, InferenceRequest, Message, Priority, RequestMetadata, ResponseEnvelope,
    Target, UpstreamResponse,
};
pub use retry::{RetryPolicy, RetryPolicyBuilder, RetryReport};
pub use sequential::{QueueMode, SequentialManager, SequentialSettings, Turn, TurnTicket};
pub use session::{SessionAffinity, SessionConfig, SessionIndex};
pub use time::{
    Clock, Deadline, InstantSleeper, ManualClock, MonotonicClock, Sleeper, TokioSleeper,
    TrackingSleeper,
};
pub use upstream::{UpstreamCall, UpstreamClient};

pub mod prelude;
