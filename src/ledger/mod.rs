//! Append-only, hash-chained event ledger with deterministic replay.

pub mod event;
pub mod replay;
pub mod snapshot;
pub mod store;

pub use event::{
    ActorType, EventActor, EventContext, EventEnvelope, LedgerError,
};
pub use replay::{
    analyze_replay_diff, replay_deterministic, validate_replay_chain,
    ReplayDiffReport, ReplayOutcome, ReplaySample,
};
pub use snapshot::{SnapshotPolicy, SnapshotRecord};
pub use store::MemoryLedger;
