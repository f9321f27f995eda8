//! Read side used by the admin surface. Every read goes through [`PlatformCache`]; mutations
//! routed through here drop the affected cache keys on every instance.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::cache::{CacheError, PlatformCache};
use crate::ledger::{
    DateRange, ExecutionDetail, ExecutionPage, ExecutionQuery, ExecutionSnapshotView,
    LedgerStore, LedgerStoreError,
};
use crate::telemetry::{DailyToolMetric, TelemetryStore, TelemetryStoreError};

const EXECUTIONS_PREFIX: &str = "admin:executions:";
const METRICS_PREFIX: &str = "admin:metrics:";

#[derive(Debug, thiserror::Error)]
pub enum AdminQueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdminQueryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "invalid_query",
            Self::NotFound => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidQuery(message) | Self::Conflict(message) | Self::Internal(message) => {
                message.clone()
            }
            Self::NotFound => "not found".to_string(),
        }
    }
}

impl From<LedgerStoreError> for AdminQueryError {
    fn from(error: LedgerStoreError) -> Self {
        match error {
            LedgerStoreError::InvalidQuery(message) | LedgerStoreError::MissingReference(message) => {
                Self::InvalidQuery(message)
            }
            LedgerStoreError::NotFound(_) => Self::NotFound,
            LedgerStoreError::Conflict(message) | LedgerStoreError::InUse(message) => {
                Self::Conflict(message)
            }
            LedgerStoreError::Db(message) => Self::Internal(message),
        }
    }
}

impl From<TelemetryStoreError> for AdminQueryError {
    fn from(error: TelemetryStoreError) -> Self {
        match error {
            TelemetryStoreError::InvalidRange(message) => Self::InvalidQuery(message),
            TelemetryStoreError::Db(message) => Self::Internal(message),
        }
    }
}

impl From<CacheError> for AdminQueryError {
    fn from(error: CacheError) -> Self {
        Self::Internal(error.to_string())
    }
}

#[derive(Clone)]
pub struct AdminQueries {
    ledger: Arc<dyn LedgerStore>,
    telemetry: Arc<dyn TelemetryStore>,
    cache: Arc<PlatformCache>,
    ttl: Duration,
}

impl AdminQueries {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        telemetry: Arc<dyn TelemetryStore>,
        cache: Arc<PlatformCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            telemetry,
            cache,
            ttl,
        }
    }

    pub async fn get_executions(
        &self,
        query: &ExecutionQuery,
    ) -> Result<ExecutionPage, AdminQueryError> {
        query.validate().map_err(AdminQueryError::InvalidQuery)?;
        let key = format!("{EXECUTIONS_PREFIX}list:{}", query.cache_key_fragment());
        self.cache
            .get_or_create(&key, self.ttl, || async {
                Ok::<_, AdminQueryError>(self.ledger.get_executions(query).await?)
            })
            .await
    }

    pub async fn get_execution_by_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ExecutionDetail>, AdminQueryError> {
        let key = format!("{EXECUTIONS_PREFIX}detail:{run_id}");
        self.cache
            .get_or_create(&key, self.ttl, || async {
                Ok::<_, AdminQueryError>(self.ledger.get_execution_by_id(run_id).await?)
            })
            .await
    }

    pub async fn get_snapshot_by_execution_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ExecutionSnapshotView>, AdminQueryError> {
        let key = format!("{EXECUTIONS_PREFIX}snapshot:{run_id}");
        self.cache
            .get_or_create(&key, self.ttl, || async {
                Ok::<_, AdminQueryError>(self.ledger.get_snapshot_by_execution_id(run_id).await?)
            })
            .await
    }

    pub async fn get_daily_metrics(
        &self,
        tool_slug: &str,
        range: DateRange,
    ) -> Result<Vec<DailyToolMetric>, AdminQueryError> {
        if range.from > range.to {
            return Err(AdminQueryError::InvalidQuery(
                "range.from must not be after range.to".to_string(),
            ));
        }
        let key = format!("{}{}:{}", metrics_prefix(tool_slug), range.from, range.to);
        self.cache
            .get_or_create(&key, self.ttl, || async {
                let metrics = self
                    .telemetry
                    .daily_metrics(tool_slug, range.from, range.to)
                    .await?;
                Ok::<_, AdminQueryError>(metrics)
            })
            .await
    }

    pub async fn invalidate_executions(&self) {
        self.cache.remove_by_prefix(EXECUTIONS_PREFIX).await;
    }

    pub async fn invalidate_daily_metrics(&self, tool_slug: &str) {
        self.cache.remove_by_prefix(&metrics_prefix(tool_slug)).await;
    }

    pub async fn delete_run(&self, run_id: Uuid) -> Result<bool, AdminQueryError> {
        let deleted = self.ledger.delete_run(run_id).await?;
        if deleted {
            self.invalidate_executions().await;
        }
        Ok(deleted)
    }

    /// Fails with [`AdminQueryError::Conflict`] while snapshots still reference the decision.
    pub async fn delete_governance_decision(
        &self,
        decision_id: Uuid,
    ) -> Result<bool, AdminQueryError> {
        let deleted = self.ledger.delete_governance_decision(decision_id).await?;
        if deleted {
            self.invalidate_executions().await;
        }
        Ok(deleted)
    }
}

fn metrics_prefix(tool_slug: &str) -> String {
    format!("{METRICS_PREFIX}{tool_slug}:")
}
