//! Hashing, canonical serialization, and text-similarity primitives.
//!
//! Every function here is a pure total function of its inputs: no clock, no
//! randomness, no I/O. This is what lets replay reproduce identical
//! projections and is the substrate that consolidation and retrieval are
//! built on.

use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::rules::{PSEUDO_EMBEDDING_DIM, PSEUDO_EMBEDDING_SALT, STOPWORDS};

/// Canonical JSON: sorted keys, compact separators, ASCII-escaped. `serde_json`
/// escapes non-ASCII by default only when the `Value` is built from `\u{..}`
/// sequences already decoded, so we post-process to guarantee ASCII output
/// matching the reference implementation's `ensure_ascii=True`.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let sorted = sort_json(value);
    let compact = serde_json::to_string(&sorted).expect("canonical json serialization");
    ascii_escape(&compact)
}

fn sort_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), sort_json(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_json).collect())
        }
        other => other.clone(),
    }
}

fn ascii_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

pub fn sha256_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn deterministic_id(prefix: &str, parts: &[&str], size: usize) -> String {
    let src = parts.join("|");
    let hash = sha256_text(&src);
    format!("{}_{}", prefix, &hash[..size.min(hash.len())])
}

/// `[a-z0-9]+` tokens, lowercased, with the fixed stopword set removed.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
        .into_iter()
        .filter(|t| !STOPWORDS.contains(t.as_str()))
        .collect()
}

pub fn normalize_statement(text: &str, max_len: usize) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.chars().count() > max_len {
        let truncated: String = collapsed.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    } else {
        collapsed
    }
}

pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let ta: HashSet<String> = tokenize(a).into_iter().collect();
    let tb: HashSet<String> = tokenize(b).into_iter().collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        inter as f64 / union as f64
    }
}

fn counts(tokens: &[String]) -> std::collections::HashMap<&str, u64> {
    let mut map = std::collections::HashMap::new();
    for t in tokens {
        *map.entry(t.as_str()).or_insert(0) += 1;
    }
    map
}

pub fn cosine_similarity_text(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let ca = counts(&ta);
    let cb = counts(&tb);
    let mut dot = 0.0;
    for (tok, av) in &ca {
        if let Some(bv) = cb.get(tok) {
            dot += (*av as f64) * (*bv as f64);
        }
    }
    let na: f64 = ca.values().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = cb.values().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Deterministic stand-in for a real semantic embedding: token-hash bucketed
/// into a fixed-dimension unit vector. Any swap for a real embedding model
/// must preserve this `(text, salt) -> unit_vector` interface and go through
/// the embedding migration path so digests stay stable under rebuild.
pub fn pseudo_embedding(text: &str, dim: usize, salt: &str) -> Vec<f64> {
    let mut vec = vec![0.0f64; dim];
    for tok in tokenize(text) {
        let mut hasher = Md5::new();
        hasher.update(format!("{}:{}", salt, tok).as_bytes());
        let digest = hasher.finalize();
        let as_u128 = u128::from_be_bytes(digest.into());
        let idx = (as_u128 % dim as u128) as usize;
        vec[idx] += 1.0;
    }
    let norm: f64 = vec.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
    vec
}

pub fn default_pseudo_embedding(text: &str) -> Vec<f64> {
    pseudo_embedding(text, PSEUDO_EMBEDDING_DIM, PSEUDO_EMBEDDING_SALT)
}

pub fn cosine_from_vectors(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|y| y * y).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

const FAILURE_SIGNALS: [&str; 7] =
    ["error", "failed", "exception", "traceback", "non-zero", "timeout", "panic"];

pub fn contains_failure_signal(text: &str) -> bool {
    let lower = text.to_lowercase();
    FAILURE_SIGNALS.iter().any(|s| lower.contains(s))
}

/// First token of length >= 4 chars, else the first token, else "general".
pub fn topic_key(statement: &str) -> String {
    let tokens = tokenize(statement);
    for tok in &tokens {
        if tok.chars().count() >= 4 {
            return tok.clone();
        }
    }
    tokens.into_iter().next().unwrap_or_else(|| "general".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_strips_stopwords_and_punctuation() {
        let toks = tokenize("We must Always pin the versions!");
        assert_eq!(toks, vec!["must", "always", "pin", "versions"]);
    }

    #[test]
    fn jaccard_identical_statements_is_one() {
        let a = "always pin versions";
        assert!((jaccard_similarity(a, a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn jaccard_empty_both_is_one() {
        assert!((jaccard_similarity("the a", "is of") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_statement_truncates_with_ellipsis() {
        let long = "x".repeat(300);
        let normalized = normalize_statement(&long, 280);
        assert_eq!(normalized.chars().count(), 280);
        assert!(normalized.ends_with("..."));
    }

    #[test]
    fn topic_key_prefers_long_token() {
        assert_eq!(topic_key("use tabs for indentation"), "tabs");
    }

    #[test]
    fn topic_key_falls_back_to_general() {
        assert_eq!(topic_key("a is"), "general");
    }

    #[test]
    fn pseudo_embedding_is_unit_length() {
        let v = default_pseudo_embedding("must always pin versions");
        let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9 || norm == 0.0);
    }

    #[test]
    fn contains_failure_signal_detects_timeout() {
        assert!(contains_failure_signal("timeout after 30s"));
        assert!(!contains_failure_signal("command succeeded"));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let v = serde_json::json!({"b": 1, "a": 2});
        assert_eq!(canonical_json(&v), r#"{"a":2,"b":1}"#);
    }
}
