//! Deterministic replay over validated event chains.
//!
//! Replay is the audit primitive: fold a pure reducer over the ordered
//! events and hash the result. Two runs over the same events must land on
//! the same `replay_hash`; a divergence means either a non-deterministic
//! reducer or a corrupted chain, and both are findings.

use serde::Serialize;
use serde_json::Value;

use super::event::{EventEnvelope, LedgerError};
use crate::hashing;

/// Validate the full hash/parent chain in `(timestamp, id)` order.
/// Assumes all events belong to one tenant timeline.
pub fn validate_replay_chain(events: &[EventEnvelope]) -> Result<(), LedgerError> {
    let mut ordered: Vec<&EventEnvelope> = events.iter().collect();
    ordered.sort_by_key(|e| e.order_key());

    let mut prev_id: Option<&str> = None;
    for event in ordered {
        event.validate_schema()?;
        if !event.verify_hash() {
            return Err(LedgerError::HashMismatch {
                id: event.id.clone(),
            });
        }
        if event.parent_id.as_deref() != prev_id {
            return Err(LedgerError::ParentMismatch {
                id: event.id.clone(),
                expected: prev_id.map(|s| s.to_string()),
                found: event.parent_id.clone(),
            });
        }
        prev_id = Some(event.id.as_str());
    }
    Ok(())
}

/// Result of one deterministic replay run.
#[derive(Debug)]
pub struct ReplayOutcome<S> {
    pub state: S,
    /// Events actually folded; zero when validation failed.
    pub applied: usize,
    /// Present only on success.
    pub replay_hash: Option<String>,
    pub failure: Option<LedgerError>,
}

impl<S> ReplayOutcome<S> {
    pub fn is_valid(&self) -> bool {
        self.failure.is_none()
    }
}

/// Validate the chain, then fold `reducer` over the ordered events.
/// On validation failure the initial state comes back untouched and the
/// reducer is never applied.
pub fn replay_deterministic<S, F>(
    events: &[EventEnvelope],
    initial: S,
    reducer: F,
) -> ReplayOutcome<S>
where
    S: Serialize,
    F: Fn(S, &EventEnvelope) -> S,
{
    if let Err(failure) = validate_replay_chain(events) {
        return ReplayOutcome {
            state: initial,
            applied: 0,
            replay_hash: None,
            failure: Some(failure),
        };
    }

    let mut ordered: Vec<&EventEnvelope> = events.iter().collect();
    ordered.sort_by_key(|e| e.order_key());

    let mut state = initial;
    for event in &ordered {
        state = reducer(state, event);
    }

    let replay_hash = match serde_json::to_value(&state) {
        Ok(v) => Some(hashing::replay_hash(&v, ordered.len())),
        Err(err) => {
            return ReplayOutcome {
                state,
                applied: ordered.len(),
                replay_hash: None,
                failure: Some(LedgerError::InvalidEnvelope(format!(
                    "final state not serializable: {}",
                    err
                ))),
            }
        }
    };

    ReplayOutcome {
        state,
        applied: ordered.len(),
        replay_hash,
        failure: None,
    }
}

/// One replay run's identity, as recorded for cross-run comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySample {
    pub run_id: String,
    pub replay_hash: String,
}

#[derive(Debug, Clone)]
pub struct ReplayDiffReport {
    pub baseline: Option<ReplaySample>,
    /// Runs whose hash differs from the baseline.
    pub divergent: Vec<ReplaySample>,
    pub sample_count: usize,
}

impl ReplayDiffReport {
    pub fn deterministic(&self) -> bool {
        self.divergent.is_empty()
    }
}

/// First sample is the baseline; every later run with a different hash is
/// reported. An empty divergence list is the determinism property the
/// audit trail rests on.
pub fn analyze_replay_diff(samples: &[ReplaySample]) -> ReplayDiffReport {
    let baseline = samples.first().cloned();
    let divergent = match &baseline {
        Some(base) => samples
            .iter()
            .skip(1)
            .filter(|s| s.replay_hash != base.replay_hash)
            .cloned()
            .collect(),
        None => Vec::new(),
    };
    ReplayDiffReport {
        baseline,
        divergent,
        sample_count: samples.len(),
    }
}

/// Snapshot of final state + hash for persisting replay evidence.
pub fn replay_evidence<S: Serialize>(outcome: &ReplayOutcome<S>) -> Value {
    serde_json::json!({
        "applied": outcome.applied,
        "replay_hash": outcome.replay_hash,
        "valid": outcome.is_valid(),
        "failure": outcome.failure.as_ref().map(|f| f.to_string()),
    })
}
