//! The seam to provider wire-format translators.
//!
//! The core never speaks a provider protocol itself; it hands a fully
//! selected target, credential, and connection to an [`UpstreamClient`] and
//! gets back either an opaque response or a classified failure. Production
//! wires an HTTP translator here; tests wire scripted doubles.

use crate::credentials::CredentialLease;
use crate::error::UpstreamError;
use crate::pool::ConnectionId;
use crate::request::{InferenceRequest, Target, UpstreamResponse};
use async_trait::async_trait;

/// Everything one upstream attempt needs.
#[derive(Debug)]
pub struct UpstreamCall<'a> {
    pub target: &'a Target,
    pub credential: &'a CredentialLease,
    pub connection: ConnectionId,
    pub request: &'a InferenceRequest,
    /// 1-indexed attempt number within the current target's retry budget.
    pub attempt: u32,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Execute one call. Failures must be classified (see
    /// [`UpstreamError::from_status`]) so retry, breaker, and credential
    /// handling can react correctly.
    async fn call(&self, call: UpstreamCall<'_>) -> Result<UpstreamResponse, UpstreamError>;

    /// Lightweight reachability probe used by the optional health checker.
    /// The default says "fine", which disables probing signal for clients
    /// that don't implement it.
    async fn probe(&self, _target: &Target) -> Result<(), UpstreamError> {
        Ok(())
    }
}
