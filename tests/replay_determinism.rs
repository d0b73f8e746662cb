//! Replay determinism: the ledger's core promise is that the same events
//! always fold to the same state hash, and that any tampering is caught
//! before a single reducer step runs.

use ledgerguard::hashing::{hash_value, replay_hash};
use ledgerguard::ledger::event::{system_actor, system_context, EventEnvelope};
use ledgerguard::ledger::replay::{
    analyze_replay_diff, replay_deterministic, validate_replay_chain, ReplaySample,
};
use ledgerguard::ledger::{LedgerError, MemoryLedger};
use serde_json::{json, Map, Value};

fn payload(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

/// A chain of decision events with increasing amounts.
fn chain(tenant: &str, n: usize) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    let mut parent: Option<String> = None;
    for i in 0..n {
        let event = EventEnvelope::new(
            "decision",
            system_actor(tenant),
            system_context(tenant, "trace-replay"),
            payload(json!({"type": "decision", "amount": (i as f64 + 1.0) * 10.0})),
            format!("2026-08-01T00:00:{:02}Z", i),
            parent.clone(),
        );
        parent = Some(event.id.clone());
        events.push(event);
    }
    events
}

/// Reducer: sum of amounts plus a count, as a canonical JSON state.
fn reduce(state: Value, event: &EventEnvelope) -> Value {
    let total = state["total"].as_f64().unwrap_or(0.0)
        + event.payload.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
    let count = state["count"].as_u64().unwrap_or(0) + 1;
    json!({"total": total, "count": count})
}

fn initial() -> Value {
    json!({"total": 0.0, "count": 0})
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

#[test]
fn double_replay_yields_identical_hash() {
    let events = chain("t1", 8);
    let a = replay_deterministic(&events, initial(), reduce);
    let b = replay_deterministic(&events, initial(), reduce);
    assert!(a.is_valid());
    assert_eq!(a.replay_hash, b.replay_hash);
    assert_eq!(a.applied, 8);
}

#[test]
fn arrival_order_does_not_matter() {
    let events = chain("t1", 6);
    let mut shuffled = events.clone();
    shuffled.reverse();
    let a = replay_deterministic(&events, initial(), reduce);
    let b = replay_deterministic(&shuffled, initial(), reduce);
    assert_eq!(a.replay_hash, b.replay_hash);
}

#[test]
fn replay_hash_binds_event_count() {
    let state = json!({"total": 30.0, "count": 2});
    assert_ne!(replay_hash(&state, 2), replay_hash(&state, 3));
}

// ---------------------------------------------------------------------------
// Tamper evidence
// ---------------------------------------------------------------------------

#[test]
fn tampered_hash_fails_validation_and_append() {
    let mut events = chain("t1", 4);
    events[2].hash = "0".repeat(64);

    let err = validate_replay_chain(&events).unwrap_err();
    assert!(err.is_integrity());

    let mut ledger = MemoryLedger::new();
    for (i, event) in events.into_iter().enumerate() {
        let result = ledger.append(event);
        if i == 2 {
            assert!(matches!(result, Err(LedgerError::HashMismatch { .. })));
            break;
        }
        result.unwrap();
    }
}

#[test]
fn tampered_payload_never_reaches_the_reducer() {
    let mut events = chain("t1", 5);
    events[1]
        .payload
        .insert("amount".to_string(), json!(1_000_000.0));

    let outcome = replay_deterministic(&events, initial(), reduce);
    assert!(!outcome.is_valid());
    assert_eq!(outcome.applied, 0);
    assert_eq!(hash_value(&outcome.state), hash_value(&initial()));
}

#[test]
fn broken_parent_chain_is_an_integrity_error() {
    let mut events = chain("t1", 4);
    events[3].parent_id = Some("evt-forged".to_string());
    // Re-seal so only the chain, not the hash, is wrong.
    let resealed = events[3].compute_hash();
    events[3].hash = resealed;
    let err = validate_replay_chain(&events).unwrap_err();
    assert!(matches!(err, LedgerError::ParentMismatch { .. }));
}

// ---------------------------------------------------------------------------
// Diff audit across replay samples
// ---------------------------------------------------------------------------

#[test]
fn identical_samples_report_deterministic() {
    let events = chain("t1", 5);
    let hash = replay_deterministic(&events, initial(), reduce)
        .replay_hash
        .expect("valid replay");
    let samples: Vec<ReplaySample> = (0..3)
        .map(|i| ReplaySample {
            run_id: format!("run-{}", i),
            replay_hash: hash.clone(),
        })
        .collect();
    let report = analyze_replay_diff(&samples);
    assert!(report.deterministic());
    assert_eq!(report.sample_count, 3);
}

#[test]
fn divergent_sample_is_flagged_against_baseline() {
    let samples = vec![
        ReplaySample { run_id: "run-0".to_string(), replay_hash: "aaaa".to_string() },
        ReplaySample { run_id: "run-1".to_string(), replay_hash: "aaaa".to_string() },
        ReplaySample { run_id: "run-2".to_string(), replay_hash: "bbbb".to_string() },
    ];
    let report = analyze_replay_diff(&samples);
    assert!(!report.deterministic());
    assert_eq!(report.divergent.len(), 1);
    assert_eq!(report.divergent[0].run_id, "run-2");
}
