use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::db::RuntimeDb;
use crate::telemetry::types::{
    DailyToolMetric, ExecutionEvent, ExecutionMode, PersistedExecutionEvent, ProcessOutcome,
};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryStoreError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Inserts the event row and folds it into its daily metric atomically. A previously seen
    /// `event_key` is a no-op that reports [`ProcessOutcome::Duplicate`].
    async fn record_and_aggregate(
        &self,
        event: &ExecutionEvent,
    ) -> Result<ProcessOutcome, TelemetryStoreError>;

    async fn daily_metrics(
        &self,
        tool_slug: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyToolMetric>, TelemetryStoreError>;

    async fn get_event(
        &self,
        event_key: &str,
    ) -> Result<Option<PersistedExecutionEvent>, TelemetryStoreError>;
}

pub fn memory() -> Arc<dyn TelemetryStore> {
    Arc::new(MemoryTelemetryStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn TelemetryStore> {
    Arc::new(PostgresTelemetryStore { db })
}

fn validate_range(from: NaiveDate, to: NaiveDate) -> Result<(), TelemetryStoreError> {
    if from > to {
        return Err(TelemetryStoreError::InvalidRange(format!(
            "from {from} is after to {to}"
        )));
    }
    Ok(())
}

#[derive(Default)]
struct MemoryTelemetryStore {
    inner: Mutex<MemoryTelemetryInner>,
}

#[derive(Default)]
struct MemoryTelemetryInner {
    events: HashMap<String, PersistedExecutionEvent>,
    metrics: BTreeMap<(String, NaiveDate), DailyToolMetric>,
}

#[async_trait]
impl TelemetryStore for MemoryTelemetryStore {
    async fn record_and_aggregate(
        &self,
        event: &ExecutionEvent,
    ) -> Result<ProcessOutcome, TelemetryStoreError> {
        let event_key = event.event_key();
        let mut inner = self.inner.lock().await;
        if inner.events.contains_key(&event_key) {
            return Ok(ProcessOutcome::Duplicate);
        }
        inner.events.insert(
            event_key.clone(),
            PersistedExecutionEvent {
                event_key,
                event: event.clone(),
                recorded_at_utc: Utc::now(),
            },
        );
        inner
            .metrics
            .entry((event.tool_slug.clone(), event.date_utc()))
            .and_modify(|metric| metric.apply(event))
            .or_insert_with(|| DailyToolMetric::first(event));
        Ok(ProcessOutcome::Recorded)
    }

    async fn daily_metrics(
        &self,
        tool_slug: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyToolMetric>, TelemetryStoreError> {
        validate_range(from, to)?;
        let inner = self.inner.lock().await;
        Ok(inner
            .metrics
            .range((tool_slug.to_string(), from)..=(tool_slug.to_string(), to))
            .map(|(_, metric)| metric.clone())
            .collect())
    }

    async fn get_event(
        &self,
        event_key: &str,
    ) -> Result<Option<PersistedExecutionEvent>, TelemetryStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(event_key).cloned())
    }
}

struct PostgresTelemetryStore {
    db: Arc<RuntimeDb>,
}

#[async_trait]
impl TelemetryStore for PostgresTelemetryStore {
    async fn record_and_aggregate(
        &self,
        event: &ExecutionEvent,
    ) -> Result<ProcessOutcome, TelemetryStoreError> {
        let event_key = event.event_key();
        let date_utc = event.date_utc();
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| TelemetryStoreError::Db(error.to_string()))?;

        let inserted = tx
            .execute(
                r#"
                INSERT INTO execution_events (
                  event_key, tool_slug, timestamp_utc, duration_ms, success, error_type,
                  payload_size, execution_mode, recorded_at_utc
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (event_key) DO NOTHING
                "#,
                &[
                    &event_key,
                    &event.tool_slug,
                    &event.timestamp_utc,
                    &event.duration_ms,
                    &event.success,
                    &event.error_type,
                    &event.payload_size,
                    &event.execution_mode.as_str(),
                    &Utc::now(),
                ],
            )
            .await
            .map_err(|error| TelemetryStoreError::Db(error.to_string()))?;

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|error| TelemetryStoreError::Db(error.to_string()))?;
            return Ok(ProcessOutcome::Duplicate);
        }

        let success_delta = i64::from(event.success);
        let failure_delta = i64::from(!event.success);
        tx.execute(
            r#"
            INSERT INTO daily_tool_metrics (
              tool_slug, date_utc, total_executions, success_count, failure_count,
              avg_duration_ms, max_duration_ms, total_payload_size
            )
            VALUES ($1, $2, 1, $3, $4, $5, $6, $7)
            ON CONFLICT (tool_slug, date_utc) DO UPDATE
               SET total_executions = daily_tool_metrics.total_executions + 1,
                   success_count = daily_tool_metrics.success_count + EXCLUDED.success_count,
                   failure_count = daily_tool_metrics.failure_count + EXCLUDED.failure_count,
                   avg_duration_ms = (
                       daily_tool_metrics.avg_duration_ms * daily_tool_metrics.total_executions
                       + EXCLUDED.avg_duration_ms
                   ) / (daily_tool_metrics.total_executions + 1),
                   max_duration_ms = GREATEST(daily_tool_metrics.max_duration_ms, EXCLUDED.max_duration_ms),
                   total_payload_size = daily_tool_metrics.total_payload_size + EXCLUDED.total_payload_size
            "#,
            &[
                &event.tool_slug,
                &date_utc,
                &success_delta,
                &failure_delta,
                &(event.duration_ms as f64),
                &event.duration_ms,
                &event.payload_size,
            ],
        )
        .await
        .map_err(|error| TelemetryStoreError::Db(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| TelemetryStoreError::Db(error.to_string()))?;
        Ok(ProcessOutcome::Recorded)
    }

    async fn daily_metrics(
        &self,
        tool_slug: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyToolMetric>, TelemetryStoreError> {
        validate_range(from, to)?;
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT tool_slug, date_utc, total_executions, success_count, failure_count,
                       avg_duration_ms, max_duration_ms, total_payload_size
                  FROM daily_tool_metrics
                 WHERE tool_slug = $1 AND date_utc BETWEEN $2 AND $3
                 ORDER BY date_utc ASC
                "#,
                &[&tool_slug, &from, &to],
            )
            .await
            .map_err(|error| TelemetryStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_metric_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(TelemetryStoreError::Db)
    }

    async fn get_event(
        &self,
        event_key: &str,
    ) -> Result<Option<PersistedExecutionEvent>, TelemetryStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT event_key, tool_slug, timestamp_utc, duration_ms, success, error_type,
                       payload_size, execution_mode, recorded_at_utc
                  FROM execution_events
                 WHERE event_key = $1
                "#,
                &[&event_key],
            )
            .await
            .map_err(|error| TelemetryStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_event_row)
            .transpose()
            .map_err(TelemetryStoreError::Db)
    }
}

fn map_metric_row(row: &tokio_postgres::Row) -> Result<DailyToolMetric, String> {
    Ok(DailyToolMetric {
        tool_slug: row.try_get("tool_slug").map_err(|e| e.to_string())?,
        date_utc: row.try_get("date_utc").map_err(|e| e.to_string())?,
        total_executions: row.try_get("total_executions").map_err(|e| e.to_string())?,
        success_count: row.try_get("success_count").map_err(|e| e.to_string())?,
        failure_count: row.try_get("failure_count").map_err(|e| e.to_string())?,
        avg_duration_ms: row.try_get("avg_duration_ms").map_err(|e| e.to_string())?,
        max_duration_ms: row.try_get("max_duration_ms").map_err(|e| e.to_string())?,
        total_payload_size: row
            .try_get("total_payload_size")
            .map_err(|e| e.to_string())?,
    })
}

fn map_event_row(row: &tokio_postgres::Row) -> Result<PersistedExecutionEvent, String> {
    let execution_mode: String = row.try_get("execution_mode").map_err(|e| e.to_string())?;
    let execution_mode = ExecutionMode::parse(&execution_mode)
        .ok_or_else(|| format!("unknown execution_mode {execution_mode}"))?;
    let event_key: String = row.try_get("event_key").map_err(|e| e.to_string())?;
    let idempotency_key = event_key
        .strip_prefix(crate::telemetry::types::IDEMPOTENCY_KEY_PREFIX)
        .map(ToString::to_string);
    Ok(PersistedExecutionEvent {
        event: ExecutionEvent {
            tool_slug: row.try_get("tool_slug").map_err(|e| e.to_string())?,
            timestamp_utc: row.try_get("timestamp_utc").map_err(|e| e.to_string())?,
            duration_ms: row.try_get("duration_ms").map_err(|e| e.to_string())?,
            success: row.try_get("success").map_err(|e| e.to_string())?,
            payload_size: row.try_get("payload_size").map_err(|e| e.to_string())?,
            execution_mode,
            error_type: row.try_get("error_type").map_err(|e| e.to_string())?,
            idempotency_key,
        },
        event_key,
        recorded_at_utc: row.try_get("recorded_at_utc").map_err(|e| e.to_string())?,
    })
}
