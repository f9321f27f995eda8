#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::{
    admin::AdminQueries,
    audit::{AuditPayloadProcessor, AuditWriter},
    cache::{InvalidationBus, PlatformCache, PostgresInvalidationBus, SharedTier},
    config::Config,
    db::RuntimeDb,
    lease::WorkerLock,
    ledger::LedgerStore,
    queue::WorkQueue,
    telemetry::{ExecutionEvent, TelemetryIngest, TelemetryProcessor},
    worker::BackgroundWorker,
};

pub mod admin;
pub mod audit;
pub mod cache;
pub mod config;
pub mod db;
pub mod lease;
pub mod ledger;
pub mod queue;
pub mod telemetry;
pub mod worker;

/// Everything one process hosts. The worker is handed out unstarted so the host decides when
/// the lease loop begins.
pub struct Runtime {
    pub config: Config,
    pub db: Option<Arc<RuntimeDb>>,
    pub ingest: TelemetryIngest,
    pub ledger: Arc<dyn LedgerStore>,
    pub admin: AdminQueries,
    pub audit: AuditWriter,
    pub telemetry_worker: BackgroundWorker<ExecutionEvent>,
}

pub async fn build_runtime(config: Config) -> Result<Runtime> {
    let db = match config.db_url.clone() {
        Some(url) => Some(Arc::new(RuntimeDb::connect(url.as_str()).await?)),
        None => None,
    };

    let (telemetry_store, ledger, leases, audit_store) = match db.clone() {
        Some(db) => (
            telemetry::store::postgres(db.clone()),
            ledger::store::postgres(db.clone()),
            lease::postgres(db.clone()),
            audit::store::postgres(db),
        ),
        None => (
            telemetry::store::memory(),
            ledger::store::memory(),
            lease::memory(),
            audit::store::memory(),
        ),
    };

    let cache = match (&db, &config.db_url) {
        (Some(db), Some(url)) if config.cache_shared_enabled => {
            let shared: Arc<dyn SharedTier> = cache::shared::postgres(db.clone());
            let bus: Option<Arc<dyn InvalidationBus>> =
                match PostgresInvalidationBus::connect(url).await {
                    Ok(bus) => Some(bus),
                    Err(error) => {
                        tracing::warn!(
                            reason = %error,
                            "cache invalidation bus unavailable; local entries expire by ttl only"
                        );
                        None
                    }
                };
            PlatformCache::new(Some(shared), bus)
        }
        _ => PlatformCache::local_only(),
    };

    let queue = WorkQueue::new();
    let telemetry_worker = BackgroundWorker::new(
        queue.clone(),
        Arc::new(TelemetryProcessor::new(telemetry_store.clone())),
        WorkerLock::new(leases, config.instance_id.clone()),
        config.telemetry_worker(),
    );
    let processor = AuditPayloadProcessor::new(config.redaction_config())?;
    let audit = AuditWriter::new(audit_store, Arc::new(processor), config.audit_write_enabled);
    let admin = AdminQueries::new(
        ledger.clone(),
        telemetry_store,
        Arc::new(cache),
        config.cache_default_ttl(),
    );

    info!(
        service = %config.service_name,
        instance_id = %config.instance_id,
        persistence = if db.is_some() { "postgres" } else { "memory" },
        shared_cache = db.is_some() && config.cache_shared_enabled,
        "runtime assembled"
    );

    Ok(Runtime {
        config,
        db,
        ingest: TelemetryIngest::new(queue),
        ledger,
        admin,
        audit,
        telemetry_worker,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::build_runtime;
    use crate::audit::{AuditActor, AuditTarget};
    use crate::config::Config;
    use crate::ledger::DateRange;
    use crate::telemetry::{ExecutionEvent, ExecutionMode};

    #[tokio::test]
    async fn in_memory_runtime_records_and_serves_metrics() -> Result<()> {
        let mut config = Config::from_lookup(|_| None)?;
        config.telemetry_lease_poll_ms = 10;
        let runtime = build_runtime(config).await?;
        assert!(runtime.db.is_none());

        let at = Utc
            .with_ymd_and_hms(2026, 4, 2, 10, 0, 0)
            .single()
            .ok_or_else(|| anyhow!("bad timestamp"))?;
        runtime.ingest.record_execution(ExecutionEvent {
            tool_slug: "regex-tester".to_string(),
            timestamp_utc: at,
            duration_ms: 75,
            success: true,
            payload_size: 300,
            execution_mode: ExecutionMode::Sync,
            error_type: None,
            idempotency_key: Some("req-1".to_string()),
        });

        let handle = runtime.telemetry_worker.spawn();
        let day = at.date_naive();
        let mut metrics = Vec::new();
        for _ in 0..100 {
            metrics = runtime
                .admin
                .get_daily_metrics("regex-tester", DateRange { from: day, to: day })
                .await?;
            if !metrics.is_empty() {
                break;
            }
            runtime.admin.invalidate_daily_metrics("regex-tester").await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await?;

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].total_executions, 1);

        let audited = runtime
            .audit
            .append(
                &AuditActor::system(),
                "recompute",
                &AuditTarget::new("metric", "regex-tester"),
                "success",
                json!({ "after": { "total_executions": 1 } }),
            )
            .await;
        assert!(audited.is_some());
        Ok(())
    }
}
