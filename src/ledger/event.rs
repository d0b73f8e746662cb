//! Canonical event envelope: the immutable unit of the append-only ledger.
//!
//! The `hash` field is the SHA-256 of the canonical serialization of every
//! other field, and `parent_id` chains each event to its predecessor in
//! `(timestamp, id)` order, so tampering or reordering is detectable from
//! the events alone.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::hashing;

/// Who emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    System,
    Human,
    Service,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventActor {
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "actorId")]
    pub actor_id: String,
    #[serde(rename = "actorType")]
    pub actor_type: ActorType,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "policyPath")]
    pub policy_path: String,
    #[serde(rename = "readOnly")]
    pub read_only: bool,
}

/// Event kinds the ledger accepts. Payloads stay open JSON objects, but
/// the discriminant is validated at ingress so foreign garbage cannot
/// masquerade as a control-plane event.
pub const KNOWN_KINDS: &[&str] = &[
    "decision",
    "truth_link",
    "feedback",
    "mode_transition",
    "policy_activation",
    "policy_proposal",
    "heartbeat",
    "quarantine",
    "artifact",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: EventActor,
    pub context: EventContext,
    pub payload: Map<String, Value>,
    /// RFC-3339 UTC timestamp.
    pub timestamp: String,
    pub hash: String,
    /// Absent only for the first event of a tenant's timeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerError {
    InvalidEnvelope(String),
    DuplicateId(String),
    HashMismatch { id: String },
    ParentMismatch {
        id: String,
        expected: Option<String>,
        found: Option<String>,
    },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::InvalidEnvelope(reason) => {
                write!(f, "invalid envelope: {}", reason)
            }
            LedgerError::DuplicateId(id) => write!(f, "duplicate event id: {}", id),
            LedgerError::HashMismatch { id } => {
                write!(f, "hash mismatch for event {}", id)
            }
            LedgerError::ParentMismatch { id, expected, found } => write!(
                f,
                "parent mismatch for event {}: expected {:?}, found {:?}",
                id, expected, found
            ),
        }
    }
}

impl std::error::Error for LedgerError {}

impl LedgerError {
    /// Integrity errors are routed to quarantine when the source is
    /// untrusted; validation errors are terminal for the input.
    pub fn is_integrity(&self) -> bool {
        !matches!(self, LedgerError::InvalidEnvelope(_))
    }
}

/// Fresh event id: epoch millis plus a random suffix, unique enough for a
/// single-writer-per-tenant timeline.
pub fn new_event_id(kind: &str) -> String {
    format!(
        "evt-{}-{}-{:08x}",
        kind,
        crate::logging::ts_epoch_ms(),
        rand::random::<u32>()
    )
}

impl EventEnvelope {
    /// Build an envelope and seal it with its content hash.
    pub fn new(
        kind: &str,
        actor: EventActor,
        context: EventContext,
        payload: Map<String, Value>,
        timestamp: String,
        parent_id: Option<String>,
    ) -> Self {
        let mut envelope = Self {
            id: new_event_id(kind),
            kind: kind.to_string(),
            actor,
            context,
            payload,
            timestamp,
            hash: String::new(),
            parent_id,
        };
        envelope.hash = envelope.compute_hash();
        envelope
    }

    /// Digest over every field except `hash` itself, in canonical form.
    pub fn compute_hash(&self) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        value.remove("hash");
        hashing::hash_value(&Value::Object(value))
    }

    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Schema checks applied before any state mutation.
    pub fn validate_schema(&self) -> Result<(), LedgerError> {
        if self.id.is_empty() {
            return Err(LedgerError::InvalidEnvelope("empty id".to_string()));
        }
        if !KNOWN_KINDS.contains(&self.kind.as_str()) {
            return Err(LedgerError::InvalidEnvelope(format!(
                "unknown event type: {}",
                self.kind
            )));
        }
        if self.actor.tenant_id.is_empty() {
            return Err(LedgerError::InvalidEnvelope("empty actor tenant".to_string()));
        }
        if self.actor.tenant_id != self.context.tenant_id {
            return Err(LedgerError::InvalidEnvelope(format!(
                "actor tenant {} != context tenant {}",
                self.actor.tenant_id, self.context.tenant_id
            )));
        }
        if chrono::DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err(LedgerError::InvalidEnvelope(format!(
                "timestamp not RFC-3339: {}",
                self.timestamp
            )));
        }
        Ok(())
    }

    pub fn tenant_id(&self) -> &str {
        &self.actor.tenant_id
    }

    /// Sort key for the total order: `(timestamp, id)` ascending.
    pub fn order_key(&self) -> (String, String) {
        (self.timestamp.clone(), self.id.clone())
    }
}

/// Convenience constructors for a test/system actor and context.
pub fn system_actor(tenant_id: &str) -> EventActor {
    EventActor {
        tenant_id: tenant_id.to_string(),
        actor_id: "control-plane".to_string(),
        actor_type: ActorType::System,
        role: "governor".to_string(),
    }
}

pub fn system_context(tenant_id: &str, trace_id: &str) -> EventContext {
    EventContext {
        tenant_id: tenant_id.to_string(),
        trace_id: trace_id.to_string(),
        policy_path: "control-plane/default".to_string(),
        read_only: false,
    }
}
