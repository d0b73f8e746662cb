//! Autonomy control plane for a multi-tenant accounting assistant.
//!
//! Every externally visible decision flows through a hash-chained,
//! append-only event ledger with deterministic replay; execution is gated
//! by an autonomy-mode state machine, a financial risk envelope, and a
//! three-stage command arbiter. Policy changes ride a drift-gated
//! proposal/canary lifecycle, and failed inputs land in a bounded-retry
//! dead-letter quarantine.

pub mod adaptation;
pub mod arbiter;
pub mod autonomy;
pub mod config;
pub mod hashing;
pub mod heartbeat;
pub mod ledger;
pub mod logging;
pub mod policy;
pub mod quarantine;
pub mod recorder;
pub mod risk;
pub mod store;
