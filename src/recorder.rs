//! Flight recorder: one immutable record per control cycle capturing the
//! state hash before and after, a structural diff of what changed, the
//! config hash the cycle ran under, and the reasons the cycle produced.
//! Record ids are derived from content, so re-recording an identical
//! cycle yields the identical id.

use crate::hashing::{hash_value, sha256_hex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const FLIGHT_RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// Dot path from the state root, e.g. "exposure.daily".
    pub path: String,
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightRecord {
    #[serde(rename = "recordId")]
    pub record_id: String,
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub cycle: String,
    #[serde(rename = "configHash")]
    pub config_hash: String,
    #[serde(rename = "beforeHash")]
    pub before_hash: String,
    #[serde(rename = "afterHash")]
    pub after_hash: String,
    pub changes: Vec<StateChange>,
    pub reasons: Vec<String>,
    #[serde(rename = "recordedAtIso")]
    pub recorded_at_iso: String,
}

impl FlightRecord {
    pub fn capture(
        tenant_id: &str,
        cycle: &str,
        config_hash: &str,
        before: &Value,
        after: &Value,
        reasons: Vec<String>,
        now_iso: &str,
    ) -> Self {
        let before_hash = hash_value(before);
        let after_hash = hash_value(after);
        let mut changes = Vec::new();
        diff_values("", before, after, &mut changes);
        let body = json!({
            "tenantId": tenant_id,
            "cycle": cycle,
            "configHash": config_hash,
            "beforeHash": before_hash,
            "afterHash": after_hash,
            "changes": changes,
            "reasons": reasons,
        });
        let record_id = format!("fr-{}", &hash_value(&body)[..16]);
        Self {
            record_id,
            schema_version: FLIGHT_RECORD_SCHEMA_VERSION,
            tenant_id: tenant_id.to_string(),
            cycle: cycle.to_string(),
            config_hash: config_hash.to_string(),
            before_hash,
            after_hash,
            changes,
            reasons,
            recorded_at_iso: now_iso.to_string(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.before_hash == self.after_hash
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Recursive structural diff. Objects recurse per key; everything else
/// (including arrays) is compared as a whole value.
fn diff_values(prefix: &str, before: &Value, after: &Value, out: &mut Vec<StateChange>) {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            for (key, bv) in b {
                match a.get(key) {
                    Some(av) => diff_values(&join_path(prefix, key), bv, av, out),
                    None => out.push(StateChange {
                        path: join_path(prefix, key),
                        before: bv.clone(),
                        after: Value::Null,
                    }),
                }
            }
            for (key, av) in a {
                if !b.contains_key(key) {
                    out.push(StateChange {
                        path: join_path(prefix, key),
                        before: Value::Null,
                        after: av.clone(),
                    });
                }
            }
        }
        (b, a) => {
            if b != a {
                out.push(StateChange {
                    path: prefix.to_string(),
                    before: b.clone(),
                    after: a.clone(),
                });
            }
        }
    }
}

/// Stable digest over a batch of records, useful for audit manifests.
pub fn records_digest(records: &[FlightRecord]) -> String {
    let mut ids: Vec<&str> = records.iter().map(|r| r.record_id.as_str()).collect();
    ids.sort_unstable();
    sha256_hex(ids.join("|").as_bytes())
}
