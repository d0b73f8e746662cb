//! Canonical serialization and content hashing.
//!
//! Every identity in the control plane (event hashes, replay hashes,
//! snapshot state hashes, flight-record ids) comes through here, so the
//! canonical form has to be stable across runs and machines:
//! object keys sorted, no whitespace, UTF-8 bytes straight into SHA-256.
//!
//! serde_json's `Value::Object` is backed by a BTreeMap (we do not enable
//! `preserve_order`), so serializing a value tree already yields sorted
//! keys at every nesting level. Do not enable `preserve_order` without
//! replacing this module.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Key-sorted, whitespace-free serialization of a JSON value.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of the canonical form of a JSON value.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Digest binding a final replay state to the number of events folded
/// into it. Two runs over the same ordered events must produce the same
/// hash; this is the cross-run determinism witness.
pub fn replay_hash(state: &Value, event_count: usize) -> String {
    let material = format!("{}|{}", canonical_json(state), event_count);
    sha256_hex(material.as_bytes())
}
