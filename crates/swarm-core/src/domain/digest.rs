//! Canonical JSON and content digests for build inputs.
//!
//! An agent image is identified by the SHA-256 of a canonical JSON document
//! describing everything that goes into the build: project, agent, source
//! tree hash and build arguments. Object keys are sorted by UTF-16 code
//! units so the digest does not depend on map iteration order.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters of the digest used as the image tag.
pub const TAG_LEN: usize = 12;

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Digest of raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Digest of the canonical JSON form of `value`.
    pub fn of_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(Self::of_bytes(canonical_json(value)?.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }

    /// Short form used as a content-addressed image tag.
    pub fn tag(&self) -> &str {
        let hex = self.hex();
        &hex[..hex.len().min(TAG_LEN)]
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sort_keys_utf16(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys_utf16(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys_utf16).collect())
        }
        other => other.clone(),
    }
}

/// Compact JSON with recursively sorted object keys. Array order is kept.
pub fn canonical_json(value: &serde_json::Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&sort_keys_utf16(value))
}

/// Digest of every input that determines an agent image.
pub fn build_input_digest(
    project: &str,
    agent: &str,
    source_hash: &str,
    build_args: &BTreeMap<String, String>,
) -> Result<ContentDigest, serde_json::Error> {
    ContentDigest::of_json(&serde_json::json!({
        "project": project,
        "agent": agent,
        "source": source_hash,
        "build_args": build_args,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_json_field_order_invariant() {
        let a = serde_json::json!({"b": 1, "a": {"z": 1, "y": 2}});
        let b = serde_json::json!({"a": {"y": 2, "z": 1}, "b": 1});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(canonical_json(&a).unwrap(), r#"{"a":{"y":2,"z":1},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_array_order_preserved() {
        let a = serde_json::json!({"deps": ["x", "y"]});
        let b = serde_json::json!({"deps": ["y", "x"]});
        assert_ne!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }

    #[test]
    fn test_digest_format_and_tag() {
        let d = ContentDigest::of_bytes(b"hello");
        assert!(d.as_str().starts_with("sha256:"));
        assert_eq!(d.hex().len(), 64);
        assert_eq!(d.tag().len(), TAG_LEN);
        assert!(d.hex().starts_with(d.tag()));
    }

    #[test]
    fn test_build_input_digest_is_stable() {
        let one = build_input_digest("demo", "triage", "abc", &args(&[("PY", "3.11")])).unwrap();
        let two = build_input_digest("demo", "triage", "abc", &args(&[("PY", "3.11")])).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn test_build_input_digest_changes_with_any_input() {
        let base = build_input_digest("demo", "triage", "abc", &args(&[])).unwrap();
        assert_ne!(
            base,
            build_input_digest("other", "triage", "abc", &args(&[])).unwrap()
        );
        assert_ne!(
            base,
            build_input_digest("demo", "router", "abc", &args(&[])).unwrap()
        );
        assert_ne!(
            base,
            build_input_digest("demo", "triage", "abd", &args(&[])).unwrap()
        );
        assert_ne!(
            base,
            build_input_digest("demo", "triage", "abc", &args(&[("K", "v")])).unwrap()
        );
    }
}
