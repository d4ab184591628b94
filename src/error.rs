//! Error taxonomy for the routing core.
//!
//! Upstream failures are classified into [`ErrorKind`]s that drive three
//! independent decisions: whether the retry engine may re-attempt, whether
//! the failure counts against the target's circuit breaker, and whether the
//! credential or connection used must be marked.

use crate::request::Target;
use std::fmt;
use std::time::Duration;

/// How many per-target failure kinds are kept in the diagnostic trail of a
/// [`RelayError::TargetsExhausted`].
pub const MAX_TRAIL: usize = 16;

/// Classification of an upstream call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection reset, DNS failure, socket timeout, refused.
    TransientNetwork,
    /// Explicit 429 or provider-specific rate-limit signal.
    RateLimited,
    /// Upstream 5xx.
    Server,
    /// Upstream 4xx other than 429.
    Client,
    /// 401/403.
    Auth,
    /// Per-request deadline exceeded.
    Timeout,
    /// Caller cancelled.
    Canceled,
    /// Invalid target spec, missing provider, bad configuration.
    Config,
}

impl ErrorKind {
    /// May the retry engine re-attempt after this failure?
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::RateLimited | Self::Server)
    }

    /// Does this failure count against the target's circuit breaker?
    pub fn counts_against_breaker(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::Server)
    }

    /// Must the connection that produced this failure be retired?
    pub fn is_connection_fatal(self) -> bool {
        matches!(self, Self::TransientNetwork)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Client => "client",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified failure from one upstream call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub kind: ErrorKind,
    /// HTTP status when the failure came from a response.
    pub status: Option<u16>,
    /// Reset hint from a rate-limit response (`Retry-After`).
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, status: None, retry_after: None, message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientNetwork, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            status: Some(429),
            retry_after,
            message: "upstream rate limit".to_string(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "request canceled")
    }

    /// Classify a failure by HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => ErrorKind::RateLimited,
            401 | 403 => ErrorKind::Auth,
            500..=599 => ErrorKind::Server,
            400..=499 => ErrorKind::Client,
            _ => ErrorKind::Server,
        };
        Self { kind, status: Some(status), retry_after: None, message: message.into() }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream {} ({}): {}", self.kind, status, self.message),
            None => write!(f, "upstream {}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Unified error surfaced by the routing core.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// The target's circuit breaker refused the call.
    BreakerOpen { target: Target, retry_in: Duration },
    /// No enabled, healthy, in-budget credential for the provider.
    NoCredential { provider: String },
    /// Sequential queue at capacity; the submission was rejected outright.
    QueueFull { provider: String, depth: usize, max: usize },
    /// The queued request's deadline expired before its turn came.
    QueueTimeout { provider: String, waited: Duration },
    /// No connection slot became free within the acquire window.
    PoolExhausted { provider: String, waited: Duration },
    /// Waited on another request building the same fingerprint, timed out.
    SingleFlightTimeout { waited: Duration },
    /// An inbound rate-limit rule denied the request.
    RateLimited { scope: String, retry_after: Duration },
    /// The target spec could not be parsed.
    InvalidTarget { spec: String },
    /// Per-request deadline expired inside the core.
    DeadlineExceeded,
    /// Every target in the failover chain failed; carries the last
    /// underlying error and the per-target outcome trail.
    TargetsExhausted {
        attempts: u32,
        last: UpstreamError,
        trail: Vec<(Target, ErrorKind)>,
    },
    /// A single upstream failure surfaced as-is (non-retryable classes).
    Upstream(UpstreamError),
}

impl RelayError {
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    pub fn is_queue_timeout(&self) -> bool {
        matches!(self, Self::QueueTimeout { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_single_flight_timeout(&self) -> bool {
        matches!(self, Self::SingleFlightTimeout { .. })
    }

    pub fn is_targets_exhausted(&self) -> bool {
        matches!(self, Self::TargetsExhausted { .. })
    }

    /// The underlying upstream error, when one exists.
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            Self::Upstream(e) => Some(e),
            Self::TargetsExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BreakerOpen { target, retry_in } => {
                write!(f, "circuit breaker open for {} (retry in {:?})", target, retry_in)
            }
            Self::NoCredential { provider } => {
                write!(f, "no eligible credential for provider {}", provider)
            }
            Self::QueueFull { provider, depth, max } => {
                write!(f, "sequential queue full for {} ({}/{})", provider, depth, max)
            }
            Self::QueueTimeout { provider, waited } => {
                write!(f, "queued request for {} timed out after {:?}", provider, waited)
            }
            Self::PoolExhausted { provider, waited } => {
                write!(f, "no connection slot for {} within {:?}", provider, waited)
            }
            Self::SingleFlightTimeout { waited } => {
                write!(f, "timed out after {:?} waiting for in-flight build", waited)
            }
            Self::RateLimited { scope, retry_after } => {
                write!(f, "rate limited ({}), retry after {:?}", scope, retry_after)
            }
            Self::InvalidTarget { spec } => {
                write!(f, "invalid target spec {:?}", spec)
            }
            Self::DeadlineExceeded => write!(f, "request deadline exceeded"),
            Self::TargetsExhausted { attempts, last, .. } => {
                write!(f, "all targets failed after {} attempts, last error: {}", attempts, last)
            }
            Self::Upstream(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Upstream(e) => Some(e),
            Self::TargetsExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

impl From<UpstreamError> for RelayError {
    fn from(e: UpstreamError) -> Self {
        Self::Upstream(e)
    }
}

impl From<crate::request::InvalidTarget> for RelayError {
    fn from(e: crate::request::InvalidTarget) -> Self {
        Self::InvalidTarget { spec: e.spec }
    }
}
