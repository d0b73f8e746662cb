//! Dead-letter quarantine for payloads that failed ingestion. Each
//! quarantined item carries a payload hash taken at capture time; replay
//! re-validates against that hash so a mutated payload can never re-enter
//! the pipeline.

use crate::hashing::hash_value;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuarantineStatus {
    Quarantined,
    Replayed,
    Failed,
}

impl QuarantineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineStatus::Quarantined => "QUARANTINED",
            QuarantineStatus::Replayed => "REPLAYED",
            QuarantineStatus::Failed => "FAILED",
        }
    }
}

pub const REPLAY_HASH_MISMATCH: &str = "REPLAY_HASH_MISMATCH";
pub const REPLAY_VALIDATION_FAILED: &str = "REPLAY_VALIDATION_FAILED";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEnvelope {
    #[serde(rename = "quarantineId")]
    pub quarantine_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// What produced the payload, e.g. "decision_ingest" or "feedback".
    #[serde(rename = "sourceType")]
    pub source_type: String,
    /// Why the payload was quarantined in the first place.
    #[serde(rename = "reasonCode")]
    pub reason_code: String,
    #[serde(rename = "payloadHash")]
    pub payload_hash: String,
    pub payload: Value,
    #[serde(rename = "replayAttempts")]
    pub replay_attempts: u32,
    pub status: QuarantineStatus,
    #[serde(rename = "lastFailureCode", skip_serializing_if = "Option::is_none")]
    pub last_failure_code: Option<String>,
    #[serde(rename = "createdAtIso")]
    pub created_at_iso: String,
}

impl QuarantineEnvelope {
    pub fn new(
        tenant_id: &str,
        source_type: &str,
        reason_code: &str,
        payload: Value,
        now_iso: &str,
    ) -> Self {
        let payload_hash = hash_value(&payload);
        Self {
            quarantine_id: format!(
                "dlq-{}-{:08x}",
                crate::logging::ts_epoch_ms(),
                rand::random::<u32>()
            ),
            tenant_id: tenant_id.to_string(),
            source_type: source_type.to_string(),
            reason_code: reason_code.to_string(),
            payload_hash,
            payload,
            replay_attempts: 0,
            status: QuarantineStatus::Quarantined,
            last_failure_code: None,
            created_at_iso: now_iso.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub quarantine_id: String,
    pub status: QuarantineStatus,
    pub replay_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
}

/// Keyed per-tenant dead-letter store.
#[derive(Debug, Default)]
pub struct QuarantineStore {
    tenants: HashMap<String, HashMap<String, QuarantineEnvelope>>,
}

impl QuarantineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, envelope: QuarantineEnvelope) -> String {
        let id = envelope.quarantine_id.clone();
        self.tenants
            .entry(envelope.tenant_id.clone())
            .or_default()
            .insert(id.clone(), envelope);
        id
    }

    pub fn get(&self, tenant_id: &str, quarantine_id: &str) -> Option<&QuarantineEnvelope> {
        self.tenants.get(tenant_id)?.get(quarantine_id)
    }

    /// Every envelope for a tenant, terminal ones included, in id order.
    pub fn export(&self, tenant_id: &str) -> Vec<QuarantineEnvelope> {
        let mut items: Vec<QuarantineEnvelope> = self
            .tenants
            .get(tenant_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        items.sort_by(|a, b| a.quarantine_id.cmp(&b.quarantine_id));
        items
    }

    /// Install persisted envelopes for a tenant; in-memory envelopes
    /// with the same id are replaced.
    pub fn restore(&mut self, tenant_id: &str, envelopes: Vec<QuarantineEnvelope>) {
        let map = self.tenants.entry(tenant_id.to_string()).or_default();
        for envelope in envelopes {
            map.insert(envelope.quarantine_id.clone(), envelope);
        }
    }

    pub fn pending(&self, tenant_id: &str) -> Vec<&QuarantineEnvelope> {
        let mut items: Vec<&QuarantineEnvelope> = self
            .tenants
            .get(tenant_id)
            .map(|m| {
                m.values()
                    .filter(|q| q.status == QuarantineStatus::Quarantined)
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by(|a, b| a.quarantine_id.cmp(&b.quarantine_id));
        items
    }

    /// Attempt one replay of a quarantined item.
    ///
    /// The payload is re-hashed first; any mismatch with the capture-time
    /// hash marks the item FAILED immediately, with no validator call and
    /// no attempt consumed. Otherwise `validate` decides: success marks
    /// the item REPLAYED, failure burns an attempt and, once
    /// `max_attempts` is reached, marks it FAILED for good.
    pub fn replay<F>(
        &mut self,
        tenant_id: &str,
        quarantine_id: &str,
        max_attempts: u32,
        validate: F,
    ) -> Option<ReplayReport>
    where
        F: FnOnce(&Value) -> bool,
    {
        let item = self.tenants.get_mut(tenant_id)?.get_mut(quarantine_id)?;

        if item.status != QuarantineStatus::Quarantined {
            return Some(ReplayReport {
                quarantine_id: item.quarantine_id.clone(),
                status: item.status,
                replay_attempts: item.replay_attempts,
                failure_code: item.last_failure_code.clone(),
            });
        }

        if hash_value(&item.payload) != item.payload_hash {
            item.status = QuarantineStatus::Failed;
            item.last_failure_code = Some(REPLAY_HASH_MISMATCH.to_string());
            return Some(ReplayReport {
                quarantine_id: item.quarantine_id.clone(),
                status: item.status,
                replay_attempts: item.replay_attempts,
                failure_code: item.last_failure_code.clone(),
            });
        }

        if validate(&item.payload) {
            item.status = QuarantineStatus::Replayed;
            item.last_failure_code = None;
        } else {
            item.replay_attempts += 1;
            item.last_failure_code = Some(REPLAY_VALIDATION_FAILED.to_string());
            if item.replay_attempts >= max_attempts {
                item.status = QuarantineStatus::Failed;
            }
        }

        Some(ReplayReport {
            quarantine_id: item.quarantine_id.clone(),
            status: item.status,
            replay_attempts: item.replay_attempts,
            failure_code: item.last_failure_code.clone(),
        })
    }
}
