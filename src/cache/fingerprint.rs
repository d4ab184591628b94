//! Request fingerprinting.
//!
//! A fingerprint is a deterministic digest over a normalized view of the
//! request: selected fields only, message text lower-cased and trimmed,
//! parameters in sorted order. Fields outside the include list (and
//! anything on the ignore list — stream flags, caller metadata, timestamps)
//! never influence the digest, so edits to them cannot change cache
//! identity. Optional vary-by dimensions (session, project) partition the
//! cache when configured.

use crate::request::InferenceRequest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Digest choice. SHA-256 is the only algorithm currently shipped; the enum
/// keeps the wire format explicit in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintAlgorithm {
    #[default]
    Sha256,
}

/// Cache dimensions that partition otherwise-identical requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaryBy {
    Session,
    Project,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FingerprintOptions {
    pub algorithm: FingerprintAlgorithm,
    pub include_fields: Vec<String>,
    pub ignore_fields: Vec<String>,
    pub vary_by: Vec<VaryBy>,
}

impl Default for FingerprintOptions {
    fn default() -> Self {
        Self {
            algorithm: FingerprintAlgorithm::Sha256,
            include_fields: vec![
                "model".to_string(),
                "messages".to_string(),
                "parameters".to_string(),
                "tools".to_string(),
            ],
            ignore_fields: vec!["stream".to_string(), "metadata".to_string()],
            vary_by: Vec::new(),
        }
    }
}

/// Hex-encoded digest identifying a normalized request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed digest (used when reading tier records).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the fingerprint of a request under the given options.
pub fn compute(request: &InferenceRequest, options: &FingerprintOptions) -> Fingerprint {
    let mut canonical: BTreeMap<&str, serde_json::Value> = BTreeMap::new();

    for field in &options.include_fields {
        if options.ignore_fields.contains(field) {
            continue;
        }
        match field.as_str() {
            "model" => {
                canonical.insert("model", serde_json::Value::String(request.model.clone()));
            }
            "messages" => {
                let messages: Vec<serde_json::Value> = request
                    .messages
                    .iter()
                    .map(|m| {
                        serde_json::json!({
                            "role": m.role.trim().to_lowercase(),
                            "content": normalize_value(&m.content),
                        })
                    })
                    .collect();
                canonical.insert("messages", serde_json::Value::Array(messages));
            }
            "parameters" => {
                if !request.parameters.is_empty() {
                    // BTreeMap serializes key-sorted, which is exactly the
                    // determinism the digest needs.
                    canonical.insert(
                        "parameters",
                        serde_json::to_value(&request.parameters)
                            .unwrap_or(serde_json::Value::Null),
                    );
                }
            }
            "tools" => {
                if let Some(tools) = &request.tools {
                    canonical
                        .insert("tools", serde_json::Value::Array(tools.clone()));
                }
            }
            // Unknown include fields are ignored rather than guessed at.
            _ => {}
        }
    }

    let mut vary: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    for dimension in &options.vary_by {
        match dimension {
            VaryBy::Session => {
                if let Some(session) = &request.metadata.session {
                    vary.insert("session", serde_json::Value::String(session.clone()));
                }
            }
            VaryBy::Project => {
                if let Some(project) = &request.metadata.project {
                    vary.insert("project", serde_json::Value::String(project.clone()));
                }
            }
        }
    }
    if !vary.is_empty() {
        canonical.insert(
            "vary",
            serde_json::to_value(&vary).unwrap_or(serde_json::Value::Null),
        );
    }

    let serialized =
        serde_json::to_string(&canonical).unwrap_or_else(|_| String::from("{}"));
    match options.algorithm {
        FingerprintAlgorithm::Sha256 => {
            let digest = Sha256::digest(serialized.as_bytes());
            let mut hex = String::with_capacity(64);
            for byte in digest {
                use std::fmt::Write;
                let _ = write!(hex, "{byte:02x}");
            }
            Fingerprint(hex)
        }
    }
}

/// Lower-case and trim every string inside a content value, recursing
/// through arrays and objects (structured content blocks).
fn normalize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            serde_json::Value::String(s.trim().to_lowercase())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(normalize_value).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), normalize_value(v))).collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Message, RequestMetadata};

    fn request(text: &str) -> InferenceRequest {
        InferenceRequest::new("prov,model", vec![Message::new("user", text)])
    }

    #[test]
    fn identical_requests_share_a_fingerprint() {
        let options = FingerprintOptions::default();
        assert_eq!(
            compute(&request("hello world"), &options),
            compute(&request("hello world"), &options)
        );
    }

    #[test]
    fn message_normalization_is_idempotent() {
        let options = FingerprintOptions::default();
        let plain = compute(&request("hello world"), &options);
        assert_eq!(compute(&request("  Hello World  "), &options), plain);
        assert_eq!(compute(&request("HELLO WORLD"), &options), plain);
    }

    #[test]
    fn excluded_fields_never_change_the_digest() {
        let options = FingerprintOptions::default();
        let base = compute(&request("hi"), &options);

        let mut streaming = request("hi");
        streaming.stream = Some(true);
        assert_eq!(compute(&streaming, &options), base);

        let mut tagged = request("hi");
        tagged.metadata = RequestMetadata {
            session: Some("user-abc:chat".into()),
            ..Default::default()
        };
        assert_eq!(compute(&tagged, &options), base);
    }

    #[test]
    fn model_and_content_changes_change_the_digest() {
        let options = FingerprintOptions::default();
        let base = compute(&request("hi"), &options);

        assert_ne!(compute(&request("bye"), &options), base);

        let mut other_model = request("hi");
        other_model.model = "prov,other".to_string();
        assert_ne!(compute(&other_model, &options), base);
    }

    #[test]
    fn parameters_affect_the_digest() {
        let options = FingerprintOptions::default();
        let base = compute(&request("hi"), &options);

        let mut warm = request("hi");
        warm.parameters.insert("temperature".into(), serde_json::json!(0.9));
        assert_ne!(compute(&warm, &options), base);
    }

    #[test]
    fn vary_by_session_partitions_the_cache() {
        let options = FingerprintOptions {
            vary_by: vec![VaryBy::Session],
            ..Default::default()
        };

        let mut a = request("hi");
        a.metadata.session = Some("alice".into());
        let mut b = request("hi");
        b.metadata.session = Some("bob".into());

        assert_ne!(compute(&a, &options), compute(&b, &options));
    }

    #[test]
    fn structured_content_blocks_are_normalized() {
        let options = FingerprintOptions::default();
        let mut a = request("x");
        a.messages = vec![Message {
            role: "user".into(),
            content: serde_json::json!([{ "type": "text", "text": "  Hello  " }]),
        }];
        let mut b = request("x");
        b.messages = vec![Message {
            role: "USER ".into(),
            content: serde_json::json!([{ "type": "text", "text": "hello" }]),
        }];
        assert_eq!(compute(&a, &options), compute(&b, &options));
    }

    #[test]
    fn digest_is_hex_sha256() {
        let fp = compute(&request("hi"), &FingerprintOptions::default());
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
