//! Shared test doubles for the integration suite.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use switchyard::prelude::*;

/// Upstream double with per-target scripted outcomes. Unscripted calls
/// succeed with a default body. Records every call in arrival order.
#[derive(Default)]
pub struct ScriptedUpstream {
    script: Mutex<HashMap<String, VecDeque<Result<UpstreamResponse, UpstreamError>>>>,
    calls: Mutex<Vec<CallRecord>>,
    delay: Mutex<Option<Duration>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub target: String,
    /// First message's content, to tell requests apart.
    pub label: String,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, target: &str, result: Result<UpstreamResponse, UpstreamError>) {
        self.script
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .push_back(result);
    }

    /// Make every call take this long (holds single-flight open in tests).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn targets_called(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.target.clone()).collect()
    }

    pub fn labels_called(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.label.clone()).collect()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn call(&self, call: UpstreamCall<'_>) -> Result<UpstreamResponse, UpstreamError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let label = call
            .request
            .messages
            .first()
            .and_then(|m| m.content.as_str().map(str::to_string))
            .unwrap_or_default();
        let target = call.target.to_string();
        self.calls.lock().unwrap().push(CallRecord { target: target.clone(), label });

        self.script
            .lock()
            .unwrap()
            .get_mut(&target)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(ok_response("default answer")))
    }
}

pub fn ok_response(text: &str) -> UpstreamResponse {
    UpstreamResponse {
        body: serde_json::json!({ "content": text }),
        input_tokens: 12,
        output_tokens: 34,
    }
}

pub fn chat(text: &str) -> InferenceRequest {
    InferenceRequest::new("claude-3.5-sonnet", vec![Message::new("user", text)])
}
