//! Inbound request and response contracts.
//!
//! The external router hands the core a parsed [`InferenceRequest`]; the
//! core hands back a [`ResponseEnvelope`] carrying the upstream payload plus
//! the diagnostic trail (target used, failover flag, cache source, attempt
//! count, total latency).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A `(provider, model)` pair, encoded on the wire as `"provider,model"`.
///
/// The model part is optional: `"openrouter"` addresses a provider as a
/// whole (circuit breakers for a bare provider gate every model on it).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub provider: String,
    pub model: Option<String>,
}

impl Target {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self { provider: provider.into(), model: Some(model.into()) }
    }

    pub fn provider_only(provider: impl Into<String>) -> Self {
        Self { provider: provider.into(), model: None }
    }

    /// Parse the `"provider,model"` encoding. A missing model part is
    /// allowed; empty components are not.
    pub fn parse(spec: &str) -> Result<Self, InvalidTarget> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(InvalidTarget { spec: spec.to_string() });
        }
        match spec.split_once(',') {
            Some((provider, model)) => {
                let provider = provider.trim();
                let model = model.trim();
                if provider.is_empty() || model.is_empty() {
                    return Err(InvalidTarget { spec: spec.to_string() });
                }
                Ok(Self::new(provider, model))
            }
            None => Ok(Self::provider_only(spec)),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model {
            Some(model) => write!(f, "{},{}", self.provider, model),
            None => write!(f, "{}", self.provider),
        }
    }
}

impl FromStr for Target {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Returned when a target specification cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTarget {
    pub spec: String,
}

impl fmt::Display for InvalidTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid target spec {:?} (expected \"provider,model\")", self.spec)
    }
}

impl std::error::Error for InvalidTarget {}

/// Queue priority. Ordering matters: `Critical` sorts ahead of `High`, and
/// so on down to `Low`; within a class submission order is preserved.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// One chat message. Content is kept opaque (string or structured blocks)
/// because wire-format translation happens outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: serde_json::Value,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: serde_json::Value::String(content.into()) }
    }
}

/// Request metadata supplied by the ingress. `session` carries the caller's
/// session identifier (derived from a user id with a suffix convention the
/// ingress documents); `project` scopes cache vary-by when configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestMetadata {
    pub session: Option<String>,
    pub project: Option<String>,
    pub priority: Option<Priority>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A parsed inference request as handed over by the external router.
///
/// `model` holds the `"provider,model"` encoding when the caller pinned a
/// target; otherwise the classifier resolved one before invoking the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Sampling parameters (temperature, top_p, max_tokens, ...). Kept as a
    /// sorted map so fingerprinting is deterministic.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl InferenceRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            parameters: BTreeMap::new(),
            tools: None,
            stream: None,
            metadata: RequestMetadata::default(),
        }
    }

    /// Target pinned by the caller, if the model field uses the
    /// `"provider,model"` encoding.
    pub fn pinned_target(&self) -> Option<Target> {
        if self.model.contains(',') {
            Target::parse(&self.model).ok()
        } else {
            None
        }
    }

    /// Rough input-token estimate (chars/4) used for credential budget
    /// checks before the provider reports real usage.
    pub fn estimated_tokens(&self) -> u64 {
        let chars: usize = self
            .messages
            .iter()
            .map(|m| match &m.content {
                serde_json::Value::String(s) => s.len(),
                other => other.to_string().len(),
            })
            .sum();
        (chars as u64 / 4).max(1)
    }

    pub fn priority(&self) -> Priority {
        self.metadata.priority.unwrap_or_default()
    }
}

/// Opaque upstream payload plus the usage the provider reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub body: serde_json::Value,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl UpstreamResponse {
    pub fn new(body: serde_json::Value) -> Self {
        Self { body, input_tokens: 0, output_tokens: 0 }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Which tier satisfied a request, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    None,
    Memory,
    Kv,
    Disk,
    Semantic,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheSource::None => "none",
            CacheSource::Memory => "memory",
            CacheSource::Kv => "kv",
            CacheSource::Disk => "disk",
            CacheSource::Semantic => "semantic",
        };
        write!(f, "{s}")
    }
}

/// The core's answer: upstream payload plus the diagnostic fields the
/// ingress forwards to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub response: UpstreamResponse,
    pub target_used: String,
    pub failover: bool,
    pub cached: CacheSource,
    pub attempts: u32,
    pub total_latency_ms: u64,
}
