//! Append-only in-memory ledger with hash-chain enforcement.
//!
//! One timeline per tenant; the `(timestamp, id)` total order is the
//! single source of truth for "what happened when", independent of
//! arrival order. Events are never mutated or deleted.

use std::collections::{HashMap, HashSet};

use super::event::{EventEnvelope, LedgerError};

#[derive(Debug, Default)]
pub struct MemoryLedger {
    /// Events per tenant, kept sorted by `(timestamp, id)`.
    timelines: HashMap<String, Vec<EventEnvelope>>,
    ids: HashSet<String>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event, enforcing schema, uniqueness, hash and parent
    /// invariants. Rejection leaves the ledger untouched.
    pub fn append(&mut self, event: EventEnvelope) -> Result<(), LedgerError> {
        event.validate_schema()?;
        if self.ids.contains(&event.id) {
            return Err(LedgerError::DuplicateId(event.id));
        }
        if !event.verify_hash() {
            return Err(LedgerError::HashMismatch { id: event.id });
        }

        let tenant = event.tenant_id().to_string();
        let timeline = self.timelines.entry(tenant).or_default();
        let expected_parent = timeline.last().map(|tail| tail.id.clone());
        if event.parent_id != expected_parent {
            return Err(LedgerError::ParentMismatch {
                id: event.id,
                expected: expected_parent,
                found: event.parent_id,
            });
        }
        // The chain ties parents to timeline order, so an append that
        // would sort before the current tail breaks the total order.
        if let Some(tail) = timeline.last() {
            if event.order_key() < tail.order_key() {
                return Err(LedgerError::InvalidEnvelope(format!(
                    "event {} is older than timeline tail {}",
                    event.id, tail.id
                )));
            }
        }

        self.ids.insert(event.id.clone());
        timeline.push(event);
        Ok(())
    }

    /// Current chain tail for a tenant; the `parent_id` the next append
    /// must carry.
    pub fn head(&self, tenant_id: &str) -> Option<&EventEnvelope> {
        self.timelines.get(tenant_id).and_then(|t| t.last())
    }

    /// All events across tenants, `(timestamp, id)` ascending.
    pub fn read_all(&self) -> Vec<EventEnvelope> {
        let mut all: Vec<EventEnvelope> =
            self.timelines.values().flatten().cloned().collect();
        all.sort_by_key(|e| e.order_key());
        all
    }

    pub fn read_by_tenant(&self, tenant_id: &str) -> Vec<EventEnvelope> {
        self.timelines
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn tenant_len(&self, tenant_id: &str) -> usize {
        self.timelines.get(tenant_id).map_or(0, |t| t.len())
    }
}
