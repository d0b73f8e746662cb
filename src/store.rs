//! Persistence contract for the control plane. The trait is the only
//! point of contact with the surrounding accounting application; the
//! SQLite adapter backs production, the in-memory adapter backs tests.
//!
//! Artifact documents live under `{month_key}/{artifact_type}` ids in the
//! `artifacts` collection; quarantine envelopes under their quarantine id.
//! Every persisted document carries a `schemaVersion` integer.

use crate::ledger::{EventEnvelope, LedgerError, MemoryLedger};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

pub const SCHEMA_VERSION: i64 = 1;

pub const ARTIFACT_COLLECTION: &str = "artifacts";
pub const QUARANTINE_COLLECTION: &str = "quarantine";

pub fn artifact_id(month_key: &str, artifact_type: &str) -> String {
    format!("{}/{}", month_key, artifact_type)
}

#[derive(Debug)]
pub enum StoreError {
    Integrity(LedgerError),
    Backend(String),
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Integrity(e) => write!(f, "integrity: {}", e),
            StoreError::Backend(msg) => write!(f, "backend: {}", msg),
            StoreError::Corrupt(msg) => write!(f, "corrupt document: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<LedgerError> for StoreError {
    fn from(e: LedgerError) -> Self {
        StoreError::Integrity(e)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub artifact_type: String,
    pub payload: Value,
}

/// Stamp `schemaVersion` into an object document if the writer did not
/// set one itself.
fn stamp_schema_version(doc: &mut Value) {
    if let Value::Object(map) = doc {
        map.entry("schemaVersion".to_string())
            .or_insert_with(|| Value::from(SCHEMA_VERSION));
    }
}

fn shallow_merge(base: &mut Value, fields: &Map<String, Value>) {
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    if let Value::Object(map) = base {
        for (k, v) in fields {
            map.insert(k.clone(), v.clone());
        }
    }
}

pub trait ControlStore {
    fn read_artifacts_by_month(
        &self,
        tenant_id: &str,
        month_key: &str,
    ) -> Result<Vec<Artifact>, StoreError>;

    fn read_item(
        &self,
        tenant_id: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<Value>, StoreError>;

    fn read_snapshot(
        &self,
        tenant_id: &str,
        collection: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Append-only. Enforces schema, duplicate-id, hash, and parent-chain
    /// invariants against the tenant's current head.
    fn create_event(&mut self, event: EventEnvelope) -> Result<(), StoreError>;

    fn read_events(&self, tenant_id: &str) -> Result<Vec<EventEnvelope>, StoreError>;

    fn write_doc(
        &mut self,
        tenant_id: &str,
        collection: &str,
        id: &str,
        doc: Value,
    ) -> Result<(), StoreError>;

    fn merge_doc(
        &mut self,
        tenant_id: &str,
        collection: &str,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), StoreError>;

    fn write_snapshot(
        &mut self,
        tenant_id: &str,
        collection: &str,
        key: &str,
        doc: Value,
    ) -> Result<(), StoreError>;
}

// =============================================================================
// In-memory adapter
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: MemoryLedger,
    docs: HashMap<(String, String, String), Value>,
    snapshots: HashMap<(String, String, String), Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ControlStore for MemoryStore {
    fn read_artifacts_by_month(
        &self,
        tenant_id: &str,
        month_key: &str,
    ) -> Result<Vec<Artifact>, StoreError> {
        let prefix = format!("{}/", month_key);
        let mut out: Vec<Artifact> = self
            .docs
            .iter()
            .filter(|((t, c, id), _)| {
                t == tenant_id && c == ARTIFACT_COLLECTION && id.starts_with(&prefix)
            })
            .map(|((_, _, id), payload)| Artifact {
                artifact_type: id[prefix.len()..].to_string(),
                payload: payload.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.artifact_type.cmp(&b.artifact_type));
        Ok(out)
    }

    fn read_item(
        &self,
        tenant_id: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self
            .docs
            .get(&(tenant_id.to_string(), collection.to_string(), id.to_string()))
            .cloned())
    }

    fn read_snapshot(
        &self,
        tenant_id: &str,
        collection: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self
            .snapshots
            .get(&(tenant_id.to_string(), collection.to_string(), key.to_string()))
            .cloned())
    }

    fn create_event(&mut self, event: EventEnvelope) -> Result<(), StoreError> {
        self.ledger.append(event)?;
        Ok(())
    }

    fn read_events(&self, tenant_id: &str) -> Result<Vec<EventEnvelope>, StoreError> {
        Ok(self.ledger.read_by_tenant(tenant_id))
    }

    fn write_doc(
        &mut self,
        tenant_id: &str,
        collection: &str,
        id: &str,
        mut doc: Value,
    ) -> Result<(), StoreError> {
        stamp_schema_version(&mut doc);
        self.docs.insert(
            (tenant_id.to_string(), collection.to_string(), id.to_string()),
            doc,
        );
        Ok(())
    }

    fn merge_doc(
        &mut self,
        tenant_id: &str,
        collection: &str,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let key = (tenant_id.to_string(), collection.to_string(), id.to_string());
        let mut doc = self.docs.remove(&key).unwrap_or(Value::Object(Map::new()));
        shallow_merge(&mut doc, fields);
        stamp_schema_version(&mut doc);
        self.docs.insert(key, doc);
        Ok(())
    }

    fn write_snapshot(
        &mut self,
        tenant_id: &str,
        collection: &str,
        key: &str,
        mut doc: Value,
    ) -> Result<(), StoreError> {
        stamp_schema_version(&mut doc);
        self.snapshots.insert(
            (tenant_id.to_string(), collection.to_string(), key.to_string()),
            doc,
        );
        Ok(())
    }
}

// =============================================================================
// SQLite adapter
// =============================================================================

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let mut store = Self {
            conn: Connection::open(path)?,
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                kind TEXT NOT NULL,
                ts TEXT NOT NULL,
                parent_id TEXT,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_tenant ON events (tenant, ts, id);
            CREATE TABLE IF NOT EXISTS docs (
                tenant TEXT NOT NULL,
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (tenant, collection, id)
            );
            CREATE TABLE IF NOT EXISTS snapshots (
                tenant TEXT NOT NULL,
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (tenant, collection, key)
            );
            COMMIT;",
        )?;
        Ok(())
    }

    fn tail(
        tx: &rusqlite::Transaction<'_>,
        tenant_id: &str,
    ) -> Result<Option<(String, String)>, StoreError> {
        let tail: Option<(String, String)> = tx
            .query_row(
                "SELECT ts, id FROM events WHERE tenant = ?1 ORDER BY ts DESC, id DESC LIMIT 1",
                params![tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(tail)
    }
}

impl ControlStore for SqliteStore {
    fn read_artifacts_by_month(
        &self,
        tenant_id: &str,
        month_key: &str,
    ) -> Result<Vec<Artifact>, StoreError> {
        let prefix = format!("{}/", month_key);
        let mut stmt = self.conn.prepare(
            "SELECT id, body FROM docs
             WHERE tenant = ?1 AND collection = ?2 AND id LIKE ?3 || '%'
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![tenant_id, ARTIFACT_COLLECTION, prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, body) = row?;
            out.push(Artifact {
                artifact_type: id[prefix.len()..].to_string(),
                payload: serde_json::from_str(&body)?,
            });
        }
        Ok(out)
    }

    fn read_item(
        &self,
        tenant_id: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM docs WHERE tenant = ?1 AND collection = ?2 AND id = ?3",
                params![tenant_id, collection, id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    fn read_snapshot(
        &self,
        tenant_id: &str,
        collection: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM snapshots WHERE tenant = ?1 AND collection = ?2 AND key = ?3",
                params![tenant_id, collection, key],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    fn create_event(&mut self, event: EventEnvelope) -> Result<(), StoreError> {
        event.validate_schema()?;
        if !event.verify_hash() {
            return Err(LedgerError::HashMismatch {
                id: event.id.clone(),
            }
            .into());
        }

        let tx = self.conn.transaction()?;

        let duplicate: Option<String> = tx
            .query_row(
                "SELECT id FROM events WHERE id = ?1",
                params![event.id],
                |row| row.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            return Err(LedgerError::DuplicateId(event.id.clone()).into());
        }

        let tail = Self::tail(&tx, event.tenant_id())?;
        let tail_id = tail.as_ref().map(|(_, id)| id.clone());
        if event.parent_id != tail_id {
            return Err(LedgerError::ParentMismatch {
                id: event.id.clone(),
                expected: tail_id,
                found: event.parent_id.clone(),
            }
            .into());
        }
        // A backdated append would re-sort ahead of its parent on read
        // and break the chain for every future validation.
        if let Some(tail_key) = tail {
            if event.order_key() < tail_key {
                return Err(LedgerError::InvalidEnvelope(format!(
                    "event {} is older than timeline tail {}",
                    event.id, tail_key.1
                ))
                .into());
            }
        }

        let body = serde_json::to_string(&event)?;
        tx.execute(
            "INSERT INTO events (id, tenant, kind, ts, parent_id, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.tenant_id(),
                event.kind,
                event.timestamp,
                event.parent_id,
                body
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn read_events(&self, tenant_id: &str) -> Result<Vec<EventEnvelope>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM events WHERE tenant = ?1 ORDER BY ts, id")?;
        let rows = stmt.query_map(params![tenant_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    fn write_doc(
        &mut self,
        tenant_id: &str,
        collection: &str,
        id: &str,
        mut doc: Value,
    ) -> Result<(), StoreError> {
        stamp_schema_version(&mut doc);
        self.conn.execute(
            "INSERT INTO docs (tenant, collection, id, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (tenant, collection, id) DO UPDATE SET body = excluded.body",
            params![tenant_id, collection, id, serde_json::to_string(&doc)?],
        )?;
        Ok(())
    }

    fn merge_doc(
        &mut self,
        tenant_id: &str,
        collection: &str,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        // Read-modify-write under one transaction.
        let tx = self.conn.transaction()?;
        let body: Option<String> = tx
            .query_row(
                "SELECT body FROM docs WHERE tenant = ?1 AND collection = ?2 AND id = ?3",
                params![tenant_id, collection, id],
                |row| row.get(0),
            )
            .optional()?;
        let mut doc = match body {
            Some(b) => serde_json::from_str(&b)?,
            None => Value::Object(Map::new()),
        };
        shallow_merge(&mut doc, fields);
        stamp_schema_version(&mut doc);
        tx.execute(
            "INSERT INTO docs (tenant, collection, id, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (tenant, collection, id) DO UPDATE SET body = excluded.body",
            params![tenant_id, collection, id, serde_json::to_string(&doc)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn write_snapshot(
        &mut self,
        tenant_id: &str,
        collection: &str,
        key: &str,
        mut doc: Value,
    ) -> Result<(), StoreError> {
        stamp_schema_version(&mut doc);
        self.conn.execute(
            "INSERT INTO snapshots (tenant, collection, key, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (tenant, collection, key) DO UPDATE SET body = excluded.body",
            params![tenant_id, collection, key, serde_json::to_string(&doc)?],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event::{system_actor, system_context, EventEnvelope};
    use serde_json::json;

    fn payload(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    fn event(tenant: &str, ts: &str, parent: Option<String>) -> EventEnvelope {
        EventEnvelope::new(
            "heartbeat",
            system_actor(tenant),
            system_context(tenant, "trace-test"),
            payload(json!({"type": "heartbeat", "seq": ts})),
            ts.to_string(),
            parent,
        )
    }

    fn exercise_store(store: &mut dyn ControlStore) {
        // Docs and month artifacts.
        store
            .write_doc(
                "t1",
                ARTIFACT_COLLECTION,
                &artifact_id("2026-07", "risk_projection"),
                json!({"healthScore": 0.9}),
            )
            .unwrap();
        store
            .write_doc(
                "t1",
                ARTIFACT_COLLECTION,
                &artifact_id("2026-07", "flight_record"),
                json!({"recordId": "fr-1"}),
            )
            .unwrap();
        store
            .write_doc(
                "t1",
                ARTIFACT_COLLECTION,
                &artifact_id("2026-08", "risk_projection"),
                json!({"healthScore": 0.5}),
            )
            .unwrap();

        let july = store.read_artifacts_by_month("t1", "2026-07").unwrap();
        assert_eq!(july.len(), 2);
        assert_eq!(july[0].artifact_type, "flight_record");
        assert_eq!(july[1].artifact_type, "risk_projection");
        assert_eq!(july[1].payload["healthScore"], json!(0.9));
        assert_eq!(july[1].payload["schemaVersion"], json!(SCHEMA_VERSION));

        // Other tenants see nothing.
        assert!(store.read_artifacts_by_month("t2", "2026-07").unwrap().is_empty());

        // Merge preserves untouched fields.
        let fields = payload(json!({"healthScore": 0.7}));
        store
            .merge_doc(
                "t1",
                ARTIFACT_COLLECTION,
                &artifact_id("2026-07", "risk_projection"),
                &fields,
            )
            .unwrap();
        let doc = store
            .read_item("t1", ARTIFACT_COLLECTION, &artifact_id("2026-07", "risk_projection"))
            .unwrap()
            .unwrap();
        assert_eq!(doc["healthScore"], json!(0.7));
        assert_eq!(doc["schemaVersion"], json!(SCHEMA_VERSION));

        // Snapshots.
        store
            .write_snapshot("t1", "state", "latest", json!({"mode": "observe"}))
            .unwrap();
        let snap = store.read_snapshot("t1", "state", "latest").unwrap().unwrap();
        assert_eq!(snap["mode"], json!("observe"));
        assert!(store.read_snapshot("t1", "state", "missing").unwrap().is_none());

        // Event chain.
        let e1 = event("t1", "2026-08-01T00:00:00Z", None);
        let e1_id = e1.id.clone();
        store.create_event(e1).unwrap();
        let e2 = event("t1", "2026-08-01T01:00:00Z", Some(e1_id.clone()));
        store.create_event(e2).unwrap();
        assert_eq!(store.read_events("t1").unwrap().len(), 2);

        // Broken parent chain rejected.
        let bad = event("t1", "2026-08-01T02:00:00Z", Some("not-the-head".to_string()));
        let err = store.create_event(bad).unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
        assert_eq!(store.read_events("t1").unwrap().len(), 2);

        // Tampered hash rejected.
        let mut tampered = event(
            "t1",
            "2026-08-01T03:00:00Z",
            store.read_events("t1").unwrap().last().map(|e| e.id.clone()),
        );
        tampered.hash = "0".repeat(64);
        let err = store.create_event(tampered).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Integrity(LedgerError::HashMismatch { .. })
        ));

        // A backdated event with the correct parent id still breaks the
        // (timestamp, id) order and must be rejected.
        let head = store.read_events("t1").unwrap().last().map(|e| e.id.clone());
        let backdated = event("t1", "2026-07-31T00:00:00Z", head);
        let err = store.create_event(backdated).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Integrity(LedgerError::InvalidEnvelope(_))
        ));
        assert_eq!(store.read_events("t1").unwrap().len(), 2);
        crate::ledger::replay::validate_replay_chain(&store.read_events("t1").unwrap()).unwrap();
    }

    #[test]
    fn memory_store_contract() {
        let mut store = MemoryStore::new();
        exercise_store(&mut store);
    }

    #[test]
    fn sqlite_store_contract() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        exercise_store(&mut store);
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.db");
        let path = path.to_str().unwrap();
        {
            let mut store = SqliteStore::open(path).unwrap();
            store
                .write_doc("t1", "quarantine", "dlq-1", json!({"status": "QUARANTINED"}))
                .unwrap();
        }
        let store = SqliteStore::open(path).unwrap();
        let doc = store.read_item("t1", "quarantine", "dlq-1").unwrap().unwrap();
        assert_eq!(doc["status"], json!("QUARANTINED"));
    }
}
