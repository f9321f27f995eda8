pub mod redaction;
pub mod store;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use redaction::{AuditPayloadProcessor, RedactionConfig};
pub use store::{AuditEvent, AuditPayloadSummary, AuditStore, AuditStoreError};

const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditActor {
    pub actor_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl AuditActor {
    pub fn system() -> Self {
        Self {
            actor_id: SYSTEM_ACTOR.to_string(),
            ..Self::default()
        }
    }

    fn actor_type(&self) -> &'static str {
        let id = self.actor_id.trim();
        if id.is_empty() || id == SYSTEM_ACTOR {
            "system"
        } else {
            "admin_user"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTarget {
    pub target_type: String,
    pub target_id: String,
}

impl AuditTarget {
    pub fn new(target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            target_id: target_id.into(),
        }
    }
}

/// `admin.<target_type>.<action>`, lowercased.
pub fn normalize_action(action: &str, target_type: &str) -> String {
    format!(
        "admin.{}.{}",
        target_type.trim().to_lowercase(),
        action.trim().to_lowercase()
    )
}

/// Append-only audit trail for admin mutations. Never fails the caller: storage errors are
/// logged and dropped.
#[derive(Clone)]
pub struct AuditWriter {
    store: Arc<dyn AuditStore>,
    processor: Arc<AuditPayloadProcessor>,
    write_enabled: bool,
}

impl AuditWriter {
    pub fn new(
        store: Arc<dyn AuditStore>,
        processor: Arc<AuditPayloadProcessor>,
        write_enabled: bool,
    ) -> Self {
        Self {
            store,
            processor,
            write_enabled,
        }
    }

    /// Returns the stored event id, or `None` when auditing is disabled or the write failed.
    pub async fn append(
        &self,
        actor: &AuditActor,
        action: &str,
        target: &AuditTarget,
        result_status: &str,
        payload: Value,
    ) -> Option<Uuid> {
        if !self.write_enabled {
            return None;
        }

        let processed = self.processor.process(payload);
        let action = normalize_action(action, &target.target_type);
        if processed.redaction_applied() {
            tracing::debug!(
                %action,
                fields_redacted = processed.redaction.fields_redacted_count,
                patterns_redacted = processed.redaction.patterns_redacted_count,
                "audit payload redacted"
            );
        }
        if processed.truncation.applied {
            tracing::debug!(
                %action,
                bytes_original = processed.truncation.bytes_original,
                bytes_final = processed.truncation.bytes_final,
                "audit payload truncated"
            );
        }

        let event = AuditEvent {
            id: Uuid::now_v7(),
            occurred_at_utc: Utc::now(),
            actor_type: actor.actor_type().to_string(),
            actor_id: actor.actor_id.clone(),
            tenant_id: actor.tenant_id.clone(),
            action,
            target_type: target.target_type.clone(),
            target_id: target.target_id.clone(),
            result_status: result_status.to_string(),
            trace_id: actor.trace_id.clone(),
            request_id: actor.request_id.clone(),
            payload_redacted: processed.payload,
            payload_hash_sha256: processed.payload_hash_sha256,
            schema_version: store::AUDIT_SCHEMA_VERSION,
        };
        let id = event.id;
        let fingerprint = format!("{}:{}:{}", event.action, event.target_type, event.target_id);
        match self.store.append(event).await {
            Ok(()) => Some(id),
            Err(error) => {
                tracing::warn!(%fingerprint, reason = %error, "audit write failed; event dropped");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use super::{
        AuditActor, AuditEvent, AuditPayloadProcessor, AuditStore, AuditStoreError, AuditTarget,
        AuditWriter, RedactionConfig, normalize_action, store,
    };

    fn writer(store: Arc<dyn AuditStore>, write_enabled: bool) -> Result<AuditWriter> {
        Ok(AuditWriter::new(
            store,
            Arc::new(AuditPayloadProcessor::new(RedactionConfig::default())?),
            write_enabled,
        ))
    }

    fn admin() -> AuditActor {
        AuditActor {
            actor_id: "admin-17".to_string(),
            tenant_id: Some("tenant-a".to_string()),
            trace_id: Some("trace-1".to_string()),
            request_id: Some("req-1".to_string()),
        }
    }

    #[tokio::test]
    async fn appended_event_round_trips_its_metadata() -> Result<()> {
        let store = store::memory();
        let writer = writer(store.clone(), true)?;
        let id = writer
            .append(
                &admin(),
                "Update",
                &AuditTarget::new("Tool", "json-formatter"),
                "success",
                json!({
                    "before": { "name": "JSON", "secret": "s3cr3t" },
                    "after": { "name": "JSON Formatter", "secret": "n3w" },
                }),
            )
            .await
            .ok_or_else(|| anyhow!("append should persist"))?;

        let event = store.get(id).await?.ok_or_else(|| anyhow!("event missing"))?;
        assert_eq!(event.action, "admin.tool.update");
        assert_eq!(event.actor_type, "admin_user");
        assert_eq!(event.tenant_id.as_deref(), Some("tenant-a"));
        assert_eq!(event.payload_redacted["after"]["secret"], "[REDACTED]");
        assert_eq!(event.payload_hash_sha256.len(), 64);
        assert!(event.payload_hash_matches());

        let mut reordered = event.clone();
        let fields = reordered
            .payload_redacted
            .as_object_mut()
            .ok_or_else(|| anyhow!("payload should be an object"))?;
        let before = fields.remove("before").ok_or_else(|| anyhow!("before missing"))?;
        fields.insert("before".to_string(), before);
        assert!(!reordered.payload_hash_matches());

        let mut tampered = event.clone();
        tampered.payload_redacted["after"]["name"] = json!("Other");
        assert!(!tampered.payload_hash_matches());

        let summary = event
            .redaction_summary()
            .ok_or_else(|| anyhow!("metadata missing"))?;
        assert_eq!(summary.fields_redacted_count, 2);
        assert!(!summary.truncation_applied);
        assert_eq!(summary.bytes_original, summary.bytes_final);
        Ok(())
    }

    #[tokio::test]
    async fn system_actor_is_classified() -> Result<()> {
        let store = store::memory();
        let writer = writer(store.clone(), true)?;
        let id = writer
            .append(
                &AuditActor::system(),
                "seed",
                &AuditTarget::new("tool", "uuid"),
                "success",
                json!({ "after": { "slug": "uuid" } }),
            )
            .await
            .ok_or_else(|| anyhow!("append should persist"))?;
        let event = store.get(id).await?.ok_or_else(|| anyhow!("event missing"))?;
        assert_eq!(event.actor_type, "system");
        Ok(())
    }

    #[tokio::test]
    async fn disabled_writer_records_nothing() -> Result<()> {
        let store = store::memory();
        let writer = writer(store.clone(), false)?;
        let id = writer
            .append(&admin(), "delete", &AuditTarget::new("tool", "x"), "success", json!({}))
            .await;
        assert!(id.is_none());
        assert!(store.list_recent(10).await?.is_empty());
        Ok(())
    }

    struct BrokenStore;

    #[async_trait]
    impl AuditStore for BrokenStore {
        async fn append(&self, _event: AuditEvent) -> Result<(), AuditStoreError> {
            Err(AuditStoreError::Db("connection reset".to_string()))
        }

        async fn get(&self, _id: Uuid) -> Result<Option<AuditEvent>, AuditStoreError> {
            Ok(None)
        }

        async fn list_recent(&self, _limit: u32) -> Result<Vec<AuditEvent>, AuditStoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn storage_failure_is_swallowed() -> Result<()> {
        let writer = writer(Arc::new(BrokenStore), true)?;
        let id = writer
            .append(&admin(), "delete", &AuditTarget::new("tool", "x"), "success", json!({}))
            .await;
        assert!(id.is_none());
        Ok(())
    }

    #[test]
    fn action_is_namespaced_by_target_type() {
        assert_eq!(normalize_action(" Publish ", "ToolContent"), "admin.toolcontent.publish");
    }
}
