//! Core data types for the response cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use tollgate_abstraction::Payload;

/// Content fingerprint of a request payload.
///
/// SHA-256 over the canonical serialization of the payload: object keys sorted at every
/// level, no insignificant whitespace. Two payloads differing in any field get different
/// fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of a payload.
    #[must_use]
    pub fn of(payload: &Payload) -> Self {
        let mut canonical = Vec::new();
        write_canonical_map(payload, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Hex-encoded hash, used as the cache file stem.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => write_canonical_map(map, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        // scalars: serde_json's compact form is already canonical
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

fn write_canonical_map(map: &Payload, out: &mut Vec<u8>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push(b'{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(Value::String(key.clone()).to_string().as_bytes());
        out.push(b':');
        if let Some(value) = map.get(key) {
            write_canonical(value, out);
        }
    }
    out.push(b'}');
}

/// One cache file: the request that was sent and the response that came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The request payload exactly as sent.
    pub request: Payload,
    /// The successful response body.
    pub response: Value,
}

/// Cache statistics for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups that returned a stored response.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Responses written.
    pub stores: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0.0 when nothing was looked up.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = payload(json!({"model": "m", "messages": [{"role": "user", "content": "hi"}], "seed": 1}));
        let b = payload(json!({"seed": 1, "messages": [{"content": "hi", "role": "user"}], "model": "m"}));
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_fingerprint_sensitive_to_every_field() {
        let base = payload(json!({"model": "m", "messages": [], "temperature": 0}));
        let warmer = payload(json!({"model": "m", "messages": [], "temperature": 1}));
        let seeded = payload(json!({"model": "m", "messages": [], "temperature": 0, "seed": 7}));
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&warmer));
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&seeded));
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let fp = Fingerprint::of(&payload(json!({"model": "m"})));
        assert_eq!(fp.as_hex().len(), 64);
        assert!(fp.as_hex().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_canonical_form() {
        let mut out = Vec::new();
        write_canonical(&json!({"b": [1, {"d": null, "c": "x"}], "a": true}), &mut out);
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"a":true,"b":[1,{"c":"x","d":null}]}"#);
    }

    #[test]
    fn test_hit_rate() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
        let stats = CacheStats { hits: 3, misses: 1, stores: 1 };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
