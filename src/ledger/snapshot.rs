//! Ledger snapshots: periodic state cuts that bound replay cost and allow
//! safe truncation of old events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hashing;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    #[serde(rename = "snapshotId")]
    pub snapshot_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Id of the last event folded into this snapshot.
    #[serde(rename = "atEventId")]
    pub at_event_id: String,
    #[serde(rename = "atTimestamp")]
    pub at_timestamp: String,
    /// Index in the tenant timeline from which replay resumes.
    #[serde(rename = "fromEventIndex")]
    pub from_event_index: usize,
    /// Opaque reducer state at the cut point.
    pub state: Value,
    #[serde(rename = "stateHash")]
    pub state_hash: String,
}

impl SnapshotRecord {
    pub fn new(
        tenant_id: &str,
        at_event_id: &str,
        at_timestamp: &str,
        from_event_index: usize,
        state: Value,
    ) -> Self {
        let state_hash = hashing::hash_value(&state);
        let snapshot_id = format!(
            "snap-{}-{}",
            crate::logging::ts_epoch_ms(),
            &state_hash[..8]
        );
        Self {
            snapshot_id,
            tenant_id: tenant_id.to_string(),
            at_event_id: at_event_id.to_string(),
            at_timestamp: at_timestamp.to_string(),
            from_event_index,
            state,
            state_hash,
        }
    }

    pub fn verify_state_hash(&self) -> bool {
        self.state_hash == hashing::hash_value(&self.state)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    /// Cut a snapshot once this many events accumulate past the last cut.
    pub interval: usize,
    /// Keep only the newest N snapshots per tenant.
    pub retention: usize,
}

impl SnapshotPolicy {
    pub fn new(interval: usize, retention: usize) -> Self {
        Self {
            interval: interval.max(1),
            retention: retention.max(1),
        }
    }

    pub fn should_snapshot(&self, events_since_last: usize) -> bool {
        events_since_last >= self.interval
    }

    /// Keep the newest `retention` snapshots by `(at_timestamp,
    /// snapshot_id)`, newest first. Returns (kept, pruned).
    pub fn prune(
        &self,
        mut snapshots: Vec<SnapshotRecord>,
    ) -> (Vec<SnapshotRecord>, Vec<SnapshotRecord>) {
        snapshots.sort_by(|a, b| {
            (b.at_timestamp.clone(), b.snapshot_id.clone())
                .cmp(&(a.at_timestamp.clone(), a.snapshot_id.clone()))
        });
        let pruned = snapshots.split_off(self.retention.min(snapshots.len()));
        (snapshots, pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(ts: &str, idx: usize) -> SnapshotRecord {
        SnapshotRecord::new("t1", &format!("evt-{}", idx), ts, idx, json!({"i": idx}))
    }

    #[test]
    fn state_hash_sealed_at_creation() {
        let s = snap("2026-08-01T00:00:00Z", 10);
        assert!(s.verify_state_hash());
        let mut tampered = s.clone();
        tampered.state = json!({"i": 999});
        assert!(!tampered.verify_state_hash());
    }

    #[test]
    fn interval_triggers_snapshot() {
        let policy = SnapshotPolicy::new(100, 5);
        assert!(!policy.should_snapshot(99));
        assert!(policy.should_snapshot(100));
        assert!(policy.should_snapshot(150));
    }

    #[test]
    fn prune_keeps_newest_by_recency() {
        let policy = SnapshotPolicy::new(10, 2);
        let snapshots = vec![
            snap("2026-08-01T00:00:00Z", 1),
            snap("2026-08-03T00:00:00Z", 3),
            snap("2026-08-02T00:00:00Z", 2),
        ];
        let (kept, pruned) = policy.prune(snapshots);
        assert_eq!(kept.len(), 2);
        assert_eq!(pruned.len(), 1);
        assert_eq!(kept[0].at_timestamp, "2026-08-03T00:00:00Z");
        assert_eq!(pruned[0].at_timestamp, "2026-08-01T00:00:00Z");
    }

    #[test]
    fn zero_interval_clamped() {
        let policy = SnapshotPolicy::new(0, 0);
        assert_eq!(policy.interval, 1);
        assert_eq!(policy.retention, 1);
    }
}
