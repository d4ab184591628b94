//! Semantic neighborhood lookup.
//!
//! When the exact fingerprint misses, the cache may compare the request's
//! normalized message text against the most recent in-memory entries and
//! serve the best match above a threshold. The matcher is a plug point: the
//! shipped implementation is bag-of-words Jaccard, cheap and bounded, with
//! scores in `[0, 1]`.

use std::collections::HashSet;

/// Similarity scorer between two normalized texts. Implementations must
/// return a score in `[0, 1]`.
pub trait SemanticMatcher: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Token-set Jaccard similarity.
#[derive(Debug, Default, Clone, Copy)]
pub struct JaccardMatcher;

impl SemanticMatcher for JaccardMatcher {
    fn score(&self, a: &str, b: &str) -> f64 {
        let set_a: HashSet<&str> = a.split_whitespace().collect();
        let set_b: HashSet<&str> = b.split_whitespace().collect();
        if set_a.is_empty() && set_b.is_empty() {
            return 1.0;
        }
        if set_a.is_empty() || set_b.is_empty() {
            return 0.0;
        }
        let intersection = set_a.intersection(&set_b).count() as f64;
        let union = set_a.union(&set_b).count() as f64;
        intersection / union
    }
}

/// Normalized message text of a request body (already-lowercased content is
/// fine; this lowercases defensively so scores are case-blind).
pub fn text_of(value: &serde_json::Value) -> String {
    let mut out = String::new();
    collect_text(value, &mut out);
    out.trim().to_lowercase()
}

fn collect_text(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(s);
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            // Message shapes keep prose under "content"/"text"; other keys
            // (roles, types) would pollute the token set.
            for key in ["content", "text", "messages"] {
                if let Some(inner) = map.get(key) {
                    collect_text(inner, out);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_texts_score_one() {
        let matcher = JaccardMatcher;
        assert!((matcher.score("the quick brown fox", "the quick brown fox") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disjoint_texts_score_zero() {
        let matcher = JaccardMatcher;
        assert_eq!(matcher.score("alpha beta", "gamma delta"), 0.0);
    }

    #[test]
    fn overlap_scores_between_zero_and_one() {
        let matcher = JaccardMatcher;
        // {a,b,c} vs {b,c,d}: 2 shared of 4 total.
        let score = matcher.score("a b c", "b c d");
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_against_empty_is_identical() {
        let matcher = JaccardMatcher;
        assert_eq!(matcher.score("", ""), 1.0);
        assert_eq!(matcher.score("something", ""), 0.0);
    }

    #[test]
    fn text_extraction_walks_message_shapes() {
        let body = serde_json::json!({
            "messages": [
                { "role": "user", "content": "Hello there" },
                { "role": "assistant", "content": [{ "type": "text", "text": "General reply" }] },
            ]
        });
        let text = text_of(&body);
        assert_eq!(text, "hello there general reply");
        assert!(!text.contains("user"), "roles must not leak into the token set");
    }
}
