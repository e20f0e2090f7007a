// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! FNV-1a hashing for digests and key hashes.
//!
//! Everything hashed here is persisted or compared across runs (plan cache
//! keys, replay logs), so the hash must not depend on a per-process seed.

use serde_json::Value;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Streaming FNV-1a (64-bit) hasher.
#[derive(Copy, Clone, Debug)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(FNV_OFFSET)
    }
}

impl Fnv1a {
    /// Creates a hasher at the FNV offset basis.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes.
    pub fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= u64::from(byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    /// Feeds a string followed by a separator byte.
    pub fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
        self.write(&[0xff]);
    }

    /// Feeds a `u32` in little-endian order.
    pub fn write_u32(&mut self, n: u32) {
        self.write(&n.to_le_bytes());
    }

    /// Returns the hash.
    #[must_use]
    pub fn finish(self) -> u64 {
        self.0
    }
}

/// Returns the canonical key hash of a JSON value, as lowercase hex.
///
/// Object keys are visited in sorted order, so logically equal values hash
/// equally regardless of insertion order.
#[must_use]
pub fn key_hash(value: &Value) -> String {
    let mut hasher = Fnv1a::new();
    feed_value(&mut hasher, value);
    format!("{:016x}", hasher.finish())
}

fn feed_value(hasher: &mut Fnv1a, value: &Value) {
    match value {
        Value::Null => hasher.write(b"n"),
        Value::Bool(b) => hasher.write(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.write(b"#");
            hasher.write_str(&n.to_string());
        }
        Value::String(s) => {
            hasher.write(b"s");
            hasher.write_str(s);
        }
        Value::Array(items) => {
            hasher.write(b"[");
            for item in items {
                feed_value(hasher, item);
            }
            hasher.write(b"]");
        }
        Value::Object(map) => {
            hasher.write(b"{");
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                hasher.write_str(key);
                feed_value(hasher, &map[key.as_str()]);
            }
            hasher.write(b"}");
        }
    }
}

/// Returns a canonical string for a JSON value, suitable as a map key.
#[must_use]
pub fn canonical_key(value: &Value) -> String {
    match value {
        Value::String(s) => format!("s:{s}"),
        other => format!("h:{}", key_hash(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_hash_ignores_object_key_order() {
        let a = json!({ "id": 1, "q": "x" });
        let b: Value = serde_json::from_str(r#"{"q":"x","id":1}"#).unwrap();
        assert_eq!(key_hash(&a), key_hash(&b));
        assert_ne!(key_hash(&a), key_hash(&json!({ "id": 2, "q": "x" })));
    }

    #[test]
    fn key_hash_distinguishes_types() {
        assert_ne!(key_hash(&json!("1")), key_hash(&json!(1)));
        assert_ne!(key_hash(&json!([1, 2])), key_hash(&json!([12])));
        assert_eq!(key_hash(&json!(null)).len(), 16);
    }
}
