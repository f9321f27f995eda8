use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::redaction::{
    REDACTION_META_KEY, RedactionMeta, TRUNCATION_META_KEY, TruncationMeta, sha256_hex,
};
use crate::db::RuntimeDb;

pub const AUDIT_SCHEMA_VERSION: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum AuditStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("db error: {0}")]
    Db(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub occurred_at_utc: DateTime<Utc>,
    pub actor_type: String,
    pub actor_id: String,
    pub tenant_id: Option<String>,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub result_status: String,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    /// Stored in a `JSON` column, which keeps the text verbatim, so key order survives storage.
    pub payload_redacted: Value,
    /// sha256 of `payload_redacted` serialized compactly in insertion order, as written.
    pub payload_hash_sha256: String,
    pub schema_version: i32,
}

/// Typed view of the metadata blocks embedded in `payload_redacted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPayloadSummary {
    pub fields_redacted_count: u64,
    pub patterns_redacted_count: u64,
    pub redacted_paths: Vec<String>,
    pub truncation_applied: bool,
    pub bytes_original: u64,
    pub bytes_final: u64,
    pub dropped_paths: Vec<String>,
    pub truncated_paths: Vec<String>,
}

impl AuditEvent {
    /// False when the payload was altered, or reordered, after it was hashed.
    pub fn payload_hash_matches(&self) -> bool {
        sha256_hex(&self.payload_redacted.to_string()) == self.payload_hash_sha256
    }

    pub fn redaction_summary(&self) -> Option<AuditPayloadSummary> {
        let redaction: RedactionMeta =
            serde_json::from_value(self.payload_redacted.get(REDACTION_META_KEY)?.clone()).ok()?;
        let truncation: TruncationMeta =
            serde_json::from_value(self.payload_redacted.get(TRUNCATION_META_KEY)?.clone())
                .ok()?;
        Some(AuditPayloadSummary {
            fields_redacted_count: redaction.fields_redacted_count,
            patterns_redacted_count: redaction.patterns_redacted_count,
            redacted_paths: redaction.redacted_paths,
            truncation_applied: truncation.applied,
            bytes_original: truncation.bytes_original,
            bytes_final: truncation.bytes_final,
            dropped_paths: truncation.dropped_paths,
            truncated_paths: truncation.truncated_paths,
        })
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditStoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>, AuditStoreError>;

    /// Newest first.
    async fn list_recent(&self, limit: u32) -> Result<Vec<AuditEvent>, AuditStoreError>;
}

pub fn memory() -> Arc<dyn AuditStore> {
    Arc::new(MemoryAuditStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn AuditStore> {
    Arc::new(PostgresAuditStore { db })
}

#[derive(Default)]
struct MemoryAuditStore {
    events: Mutex<Vec<AuditEvent>>,
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditStoreError> {
        let mut events = self.events.lock().await;
        if events.iter().any(|existing| existing.id == event.id) {
            return Err(AuditStoreError::Conflict(format!(
                "audit event {} already exists",
                event.id
            )));
        }
        events.push(event);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>, AuditStoreError> {
        let events = self.events.lock().await;
        Ok(events.iter().find(|event| event.id == id).cloned())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<AuditEvent>, AuditStoreError> {
        let events = self.events.lock().await;
        let mut recent: Vec<AuditEvent> = events.clone();
        recent.sort_by(|a, b| b.occurred_at_utc.cmp(&a.occurred_at_utc));
        recent.truncate(limit as usize);
        Ok(recent)
    }
}

struct PostgresAuditStore {
    db: Arc<RuntimeDb>,
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO audit_events (
                  id, occurred_at_utc, actor_type, actor_id, tenant_id, action, target_type,
                  target_id, result_status, trace_id, request_id, payload_redacted,
                  payload_hash_sha256, schema_version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
                &[
                    &event.id,
                    &event.occurred_at_utc,
                    &event.actor_type,
                    &event.actor_id,
                    &event.tenant_id,
                    &event.action,
                    &event.target_type,
                    &event.target_id,
                    &event.result_status,
                    &event.trace_id,
                    &event.request_id,
                    &event.payload_redacted,
                    &event.payload_hash_sha256,
                    &event.schema_version,
                ],
            )
            .await
            .map_err(|error| AuditStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>, AuditStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT id, occurred_at_utc, actor_type, actor_id, tenant_id, action, target_type,
                       target_id, result_status, trace_id, request_id, payload_redacted,
                       payload_hash_sha256, schema_version
                  FROM audit_events
                 WHERE id = $1
                "#,
                &[&id],
            )
            .await
            .map_err(|error| AuditStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_audit_row)
            .transpose()
            .map_err(AuditStoreError::Db)
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<AuditEvent>, AuditStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT id, occurred_at_utc, actor_type, actor_id, tenant_id, action, target_type,
                       target_id, result_status, trace_id, request_id, payload_redacted,
                       payload_hash_sha256, schema_version
                  FROM audit_events
                 ORDER BY occurred_at_utc DESC
                 LIMIT $1
                "#,
                &[&i64::from(limit)],
            )
            .await
            .map_err(|error| AuditStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_audit_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AuditStoreError::Db)
    }
}

fn map_audit_row(row: &tokio_postgres::Row) -> Result<AuditEvent, String> {
    Ok(AuditEvent {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        occurred_at_utc: row.try_get("occurred_at_utc").map_err(|e| e.to_string())?,
        actor_type: row.try_get("actor_type").map_err(|e| e.to_string())?,
        actor_id: row.try_get("actor_id").map_err(|e| e.to_string())?,
        tenant_id: row.try_get("tenant_id").map_err(|e| e.to_string())?,
        action: row.try_get("action").map_err(|e| e.to_string())?,
        target_type: row.try_get("target_type").map_err(|e| e.to_string())?,
        target_id: row.try_get("target_id").map_err(|e| e.to_string())?,
        result_status: row.try_get("result_status").map_err(|e| e.to_string())?,
        trace_id: row.try_get("trace_id").map_err(|e| e.to_string())?,
        request_id: row.try_get("request_id").map_err(|e| e.to_string())?,
        payload_redacted: row.try_get("payload_redacted").map_err(|e| e.to_string())?,
        payload_hash_sha256: row
            .try_get("payload_hash_sha256")
            .map_err(|e| e.to_string())?,
        schema_version: row.try_get("schema_version").map_err(|e| e.to_string())?,
    })
}
