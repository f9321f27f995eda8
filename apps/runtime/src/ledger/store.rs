use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use uuid::Uuid;

use crate::db::RuntimeDb;
use crate::ledger::types::{
    ExecutionAuthorityDecision, ExecutionConformanceResult, ExecutionDetail, ExecutionPage,
    ExecutionQuery, ExecutionRun, ExecutionSnapshot, ExecutionSnapshotView, ExecutionSummary,
    GovernanceDecision, GovernanceDecisionPage, GovernanceDecisionQuery,
    GovernanceDecisionStatus, NewExecutionRun,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerStoreError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Restrict rule: the row is still referenced and was left intact.
    #[error("in use: {0}")]
    InUse(String),
    #[error("missing reference: {0}")]
    MissingReference(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn record_governance_decision(
        &self,
        decision: GovernanceDecision,
    ) -> Result<GovernanceDecision, LedgerStoreError>;

    async fn get_governance_decision(
        &self,
        decision_id: Uuid,
    ) -> Result<Option<GovernanceDecision>, LedgerStoreError>;

    async fn list_governance_decisions(
        &self,
        query: &GovernanceDecisionQuery,
    ) -> Result<GovernanceDecisionPage, LedgerStoreError>;

    /// Fails with [`LedgerStoreError::InUse`] while any snapshot references the decision.
    async fn delete_governance_decision(&self, decision_id: Uuid)
    -> Result<bool, LedgerStoreError>;

    /// Writes the run and its three owned rows all-or-nothing and returns the new run id.
    async fn record_run(
        &self,
        run: NewExecutionRun,
        snapshot: ExecutionSnapshot,
        conformance: ExecutionConformanceResult,
        authority_decision: ExecutionAuthorityDecision,
    ) -> Result<Uuid, LedgerStoreError>;

    /// Cascades to the snapshot, conformance and authority rows.
    async fn delete_run(&self, run_id: Uuid) -> Result<bool, LedgerStoreError>;

    async fn get_executions(
        &self,
        query: &ExecutionQuery,
    ) -> Result<ExecutionPage, LedgerStoreError>;

    async fn get_execution_by_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ExecutionDetail>, LedgerStoreError>;

    async fn get_snapshot_by_execution_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ExecutionSnapshotView>, LedgerStoreError>;
}

pub fn memory() -> Arc<dyn LedgerStore> {
    Arc::new(MemoryLedgerStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn LedgerStore> {
    Arc::new(PostgresLedgerStore { db })
}

#[derive(Default)]
struct MemoryLedgerStore {
    inner: Mutex<MemoryLedgerInner>,
}

#[derive(Default)]
struct MemoryLedgerInner {
    decisions: HashMap<Uuid, GovernanceDecision>,
    runs: HashMap<Uuid, ExecutionRun>,
    snapshots: HashMap<Uuid, ExecutionSnapshot>,
    conformance: HashMap<Uuid, ExecutionConformanceResult>,
    authority_decisions: HashMap<Uuid, ExecutionAuthorityDecision>,
}

fn page_bounds(total: usize, offset: u64, page_size: u32) -> (usize, usize) {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(total);
    let end = start.saturating_add(page_size as usize).min(total);
    (start, end)
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn record_governance_decision(
        &self,
        decision: GovernanceDecision,
    ) -> Result<GovernanceDecision, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.decisions.contains_key(&decision.decision_id) {
            return Err(LedgerStoreError::Conflict(format!(
                "governance decision {} already exists",
                decision.decision_id
            )));
        }
        inner
            .decisions
            .insert(decision.decision_id, decision.clone());
        Ok(decision)
    }

    async fn get_governance_decision(
        &self,
        decision_id: Uuid,
    ) -> Result<Option<GovernanceDecision>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.decisions.get(&decision_id).cloned())
    }

    async fn list_governance_decisions(
        &self,
        query: &GovernanceDecisionQuery,
    ) -> Result<GovernanceDecisionPage, LedgerStoreError> {
        query.validate().map_err(LedgerStoreError::InvalidQuery)?;
        let inner = self.inner.lock().await;
        let mut matching: Vec<&GovernanceDecision> = inner
            .decisions
            .values()
            .filter(|decision| query.matches(decision))
            .collect();
        matching.sort_by(|a, b| {
            b.timestamp_utc
                .cmp(&a.timestamp_utc)
                .then_with(|| b.decision_id.cmp(&a.decision_id))
        });
        let (start, end) = page_bounds(matching.len(), query.offset(), query.page_size);
        Ok(GovernanceDecisionPage {
            items: matching[start..end].iter().map(|d| (*d).clone()).collect(),
            page: query.page,
            page_size: query.page_size,
            total: matching.len() as u64,
        })
    }

    async fn delete_governance_decision(
        &self,
        decision_id: Uuid,
    ) -> Result<bool, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.decisions.contains_key(&decision_id) {
            return Ok(false);
        }
        let referencing = inner
            .snapshots
            .values()
            .filter(|snapshot| snapshot.governance_decision_id == decision_id)
            .count();
        if referencing > 0 {
            return Err(LedgerStoreError::InUse(format!(
                "governance decision {decision_id} is referenced by {referencing} execution snapshot(s)"
            )));
        }
        inner.decisions.remove(&decision_id);
        Ok(true)
    }

    async fn record_run(
        &self,
        run: NewExecutionRun,
        snapshot: ExecutionSnapshot,
        conformance: ExecutionConformanceResult,
        authority_decision: ExecutionAuthorityDecision,
    ) -> Result<Uuid, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        if !inner
            .decisions
            .contains_key(&snapshot.governance_decision_id)
        {
            return Err(LedgerStoreError::MissingReference(format!(
                "governance decision {} does not exist",
                snapshot.governance_decision_id
            )));
        }
        let id = Uuid::now_v7();
        inner.runs.insert(id, run.into_run(id));
        inner.snapshots.insert(id, snapshot);
        inner.conformance.insert(id, conformance);
        inner.authority_decisions.insert(id, authority_decision);
        Ok(id)
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.runs.remove(&run_id).is_none() {
            return Ok(false);
        }
        inner.snapshots.remove(&run_id);
        inner.conformance.remove(&run_id);
        inner.authority_decisions.remove(&run_id);
        Ok(true)
    }

    async fn get_executions(
        &self,
        query: &ExecutionQuery,
    ) -> Result<ExecutionPage, LedgerStoreError> {
        query.validate().map_err(LedgerStoreError::InvalidQuery)?;
        let inner = self.inner.lock().await;
        let mut matching: Vec<&ExecutionRun> = inner
            .runs
            .values()
            .filter(|run| query.matches(run))
            .collect();
        matching.sort_by(|a, b| {
            b.executed_at_utc
                .cmp(&a.executed_at_utc)
                .then_with(|| b.id.cmp(&a.id))
        });
        let (start, end) = page_bounds(matching.len(), query.offset(), query.page_size);
        let items = matching[start..end]
            .iter()
            .filter_map(|run| {
                inner
                    .conformance
                    .get(&run.id)
                    .map(|conformance| ExecutionSummary::from_parts(run, conformance))
            })
            .collect();
        Ok(ExecutionPage {
            items,
            page: query.page,
            page_size: query.page_size,
            total: matching.len() as u64,
        })
    }

    async fn get_execution_by_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ExecutionDetail>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let Some(run) = inner.runs.get(&run_id) else {
            return Ok(None);
        };
        let (Some(snapshot), Some(conformance), Some(authority_decision)) = (
            inner.snapshots.get(&run_id),
            inner.conformance.get(&run_id),
            inner.authority_decisions.get(&run_id),
        ) else {
            return Err(LedgerStoreError::Db(format!(
                "execution run {run_id} is missing owned rows"
            )));
        };
        Ok(Some(ExecutionDetail {
            run: run.clone(),
            snapshot: snapshot.clone(),
            conformance: conformance.clone(),
            authority_decision: authority_decision.clone(),
        }))
    }

    async fn get_snapshot_by_execution_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ExecutionSnapshotView>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .get(&run_id)
            .map(|snapshot| ExecutionSnapshotView {
                execution_run_id: run_id,
                governance_decision: inner
                    .decisions
                    .get(&snapshot.governance_decision_id)
                    .cloned(),
                snapshot: snapshot.clone(),
            }))
    }
}

struct PostgresLedgerStore {
    db: Arc<RuntimeDb>,
}

fn map_db_error(error: tokio_postgres::Error) -> LedgerStoreError {
    LedgerStoreError::Db(error.to_string())
}

fn is_foreign_key_violation(error: &tokio_postgres::Error) -> bool {
    error.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION)
}

fn range_bounds(
    range: Option<crate::ledger::types::TimeRange>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    range.map_or((None, None), |range| (range.from, range.to))
}

const RUN_FILTER: &str = r#"
     WHERE ($1::text IS NULL OR r.correlation_id = $1)
       AND ($2::text IS NULL OR r.tool_id = $2)
       AND ($3::text IS NULL OR r.tenant_id = $3)
       AND ($4::timestamptz IS NULL OR r.executed_at_utc >= $4)
       AND ($5::timestamptz IS NULL OR r.executed_at_utc < $5)
"#;

const DECISION_FILTER: &str = r#"
     WHERE ($1::text IS NULL OR tool_id = $1)
       AND ($2::text IS NULL OR policy_version = $2)
       AND ($3::timestamptz IS NULL OR timestamp_utc >= $3)
       AND ($4::timestamptz IS NULL OR timestamp_utc < $4)
"#;

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn record_governance_decision(
        &self,
        decision: GovernanceDecision,
    ) -> Result<GovernanceDecision, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO governance_decisions (
                  decision_id, tool_id, capability_id, authority, approved_by, reason,
                  policy_version, status, timestamp_utc
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (decision_id) DO NOTHING
                "#,
                &[
                    &decision.decision_id,
                    &decision.tool_id,
                    &decision.capability_id,
                    &decision.authority,
                    &decision.approved_by,
                    &decision.reason,
                    &decision.policy_version,
                    &decision.status.as_str(),
                    &decision.timestamp_utc,
                ],
            )
            .await
            .map_err(map_db_error)?;
        if inserted == 0 {
            return Err(LedgerStoreError::Conflict(format!(
                "governance decision {} already exists",
                decision.decision_id
            )));
        }
        Ok(decision)
    }

    async fn get_governance_decision(
        &self,
        decision_id: Uuid,
    ) -> Result<Option<GovernanceDecision>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT decision_id, tool_id, capability_id, authority, approved_by, reason,
                       policy_version, status, timestamp_utc
                  FROM governance_decisions
                 WHERE decision_id = $1
                "#,
                &[&decision_id],
            )
            .await
            .map_err(map_db_error)?;
        row.as_ref()
            .map(map_decision_row)
            .transpose()
            .map_err(LedgerStoreError::Db)
    }

    async fn list_governance_decisions(
        &self,
        query: &GovernanceDecisionQuery,
    ) -> Result<GovernanceDecisionPage, LedgerStoreError> {
        query.validate().map_err(LedgerStoreError::InvalidQuery)?;
        let (from, to) = range_bounds(query.time_range);
        let limit = i64::from(query.page_size);
        let offset = i64::try_from(query.offset()).unwrap_or(i64::MAX);

        let client = self.db.client();
        let client = client.lock().await;
        let total: i64 = client
            .query_one(
                &format!("SELECT COUNT(*) AS total FROM governance_decisions {DECISION_FILTER}"),
                &[&query.tool_id, &query.policy_version, &from, &to],
            )
            .await
            .map_err(map_db_error)?
            .try_get("total")
            .map_err(map_db_error)?;
        let rows = client
            .query(
                &format!(
                    r#"
                    SELECT decision_id, tool_id, capability_id, authority, approved_by, reason,
                           policy_version, status, timestamp_utc
                      FROM governance_decisions
                      {DECISION_FILTER}
                     ORDER BY timestamp_utc DESC, decision_id DESC
                     LIMIT $5 OFFSET $6
                    "#
                ),
                &[&query.tool_id, &query.policy_version, &from, &to, &limit, &offset],
            )
            .await
            .map_err(map_db_error)?;
        let items = rows
            .iter()
            .map(map_decision_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)?;
        Ok(GovernanceDecisionPage {
            items,
            page: query.page,
            page_size: query.page_size,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn delete_governance_decision(
        &self,
        decision_id: Uuid,
    ) -> Result<bool, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        match client
            .execute(
                "DELETE FROM governance_decisions WHERE decision_id = $1",
                &[&decision_id],
            )
            .await
        {
            Ok(deleted) => Ok(deleted > 0),
            Err(error) if is_foreign_key_violation(&error) => {
                Err(LedgerStoreError::InUse(format!(
                    "governance decision {decision_id} is referenced by execution snapshots"
                )))
            }
            Err(error) => Err(map_db_error(error)),
        }
    }

    async fn record_run(
        &self,
        run: NewExecutionRun,
        snapshot: ExecutionSnapshot,
        conformance: ExecutionConformanceResult,
        authority_decision: ExecutionAuthorityDecision,
    ) -> Result<Uuid, LedgerStoreError> {
        let id = Uuid::now_v7();
        let run = run.into_run(id);
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(map_db_error)?;

        tx.execute(
            r#"
            INSERT INTO execution_runs (
              id, tool_id, executed_at_utc, success, duration_ms, error_type, payload_size,
              execution_mode, runtime_language, adapter_name, adapter_resolution_status,
              capability, authority, correlation_id, tenant_id, trace_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
            &[
                &run.id,
                &run.tool_id,
                &run.executed_at_utc,
                &run.success,
                &run.duration_ms,
                &run.error_type,
                &run.payload_size,
                &run.execution_mode,
                &run.runtime_language,
                &run.adapter_name,
                &run.adapter_resolution_status,
                &run.capability,
                &run.authority,
                &run.correlation_id,
                &run.tenant_id,
                &run.trace_id,
            ],
        )
        .await
        .map_err(map_db_error)?;

        tx.execute(
            r#"
            INSERT INTO execution_snapshots (
              execution_run_id, snapshot_id, authority, runtime_language, execution_capability,
              correlation_id, tenant_id, timestamp_utc, conformance_version,
              policy_snapshot_json, governance_decision_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            &[
                &id,
                &snapshot.snapshot_id,
                &snapshot.authority,
                &snapshot.runtime_language,
                &snapshot.execution_capability,
                &snapshot.correlation_id,
                &snapshot.tenant_id,
                &snapshot.timestamp_utc,
                &snapshot.conformance_version,
                &snapshot.policy_snapshot_json,
                &snapshot.governance_decision_id,
            ],
        )
        .await
        .map_err(|error| {
            if is_foreign_key_violation(&error) {
                LedgerStoreError::MissingReference(format!(
                    "governance decision {} does not exist",
                    snapshot.governance_decision_id
                ))
            } else {
                map_db_error(error)
            }
        })?;

        tx.execute(
            r#"
            INSERT INTO execution_conformance_results (
              execution_run_id, is_valid, normalized_status, was_normalized, issue_count,
              issues_json
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            &[
                &id,
                &conformance.is_valid,
                &conformance.normalized_status,
                &conformance.was_normalized,
                &conformance.issue_count,
                &conformance.issues_json,
            ],
        )
        .await
        .map_err(map_db_error)?;

        tx.execute(
            r#"
            INSERT INTO execution_authority_decisions (
              execution_run_id, authority, admission_allowed, admission_reason, decision_source
            )
            VALUES ($1, $2, $3, $4, $5)
            "#,
            &[
                &id,
                &authority_decision.authority,
                &authority_decision.admission_allowed,
                &authority_decision.admission_reason,
                &authority_decision.decision_source,
            ],
        )
        .await
        .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;
        Ok(id)
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let deleted = client
            .execute("DELETE FROM execution_runs WHERE id = $1", &[&run_id])
            .await
            .map_err(map_db_error)?;
        Ok(deleted > 0)
    }

    async fn get_executions(
        &self,
        query: &ExecutionQuery,
    ) -> Result<ExecutionPage, LedgerStoreError> {
        query.validate().map_err(LedgerStoreError::InvalidQuery)?;
        let (from, to) = range_bounds(query.time_range);
        let limit = i64::from(query.page_size);
        let offset = i64::try_from(query.offset()).unwrap_or(i64::MAX);

        let client = self.db.client();
        let client = client.lock().await;
        let total: i64 = client
            .query_one(
                &format!("SELECT COUNT(*) AS total FROM execution_runs r {RUN_FILTER}"),
                &[
                    &query.correlation_id,
                    &query.tool_id,
                    &query.tenant_id,
                    &from,
                    &to,
                ],
            )
            .await
            .map_err(map_db_error)?
            .try_get("total")
            .map_err(map_db_error)?;
        let rows = client
            .query(
                &format!(
                    r#"
                    SELECT r.id, r.tool_id, r.executed_at_utc, r.success, r.duration_ms,
                           r.error_type, r.execution_mode, r.adapter_name, r.correlation_id,
                           r.tenant_id, c.normalized_status, c.is_valid, c.was_normalized,
                           c.issue_count
                      FROM execution_runs r
                      JOIN execution_conformance_results c ON c.execution_run_id = r.id
                      {RUN_FILTER}
                     ORDER BY r.executed_at_utc DESC, r.id DESC
                     LIMIT $6 OFFSET $7
                    "#
                ),
                &[
                    &query.correlation_id,
                    &query.tool_id,
                    &query.tenant_id,
                    &from,
                    &to,
                    &limit,
                    &offset,
                ],
            )
            .await
            .map_err(map_db_error)?;
        let items = rows
            .iter()
            .map(map_summary_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)?;
        Ok(ExecutionPage {
            items,
            page: query.page,
            page_size: query.page_size,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn get_execution_by_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ExecutionDetail>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT r.id, r.tool_id, r.executed_at_utc, r.success, r.duration_ms, r.error_type,
                       r.payload_size, r.execution_mode, r.runtime_language, r.adapter_name,
                       r.adapter_resolution_status, r.capability, r.authority, r.correlation_id,
                       r.tenant_id, r.trace_id,
                       s.snapshot_id, s.authority AS snapshot_authority,
                       s.runtime_language AS snapshot_runtime_language, s.execution_capability,
                       s.correlation_id AS snapshot_correlation_id,
                       s.tenant_id AS snapshot_tenant_id, s.timestamp_utc, s.conformance_version,
                       s.policy_snapshot_json, s.governance_decision_id,
                       c.is_valid, c.normalized_status, c.was_normalized, c.issue_count,
                       c.issues_json,
                       a.authority AS decision_authority, a.admission_allowed, a.admission_reason,
                       a.decision_source
                  FROM execution_runs r
                  JOIN execution_snapshots s ON s.execution_run_id = r.id
                  JOIN execution_conformance_results c ON c.execution_run_id = r.id
                  JOIN execution_authority_decisions a ON a.execution_run_id = r.id
                 WHERE r.id = $1
                "#,
                &[&run_id],
            )
            .await
            .map_err(map_db_error)?;
        row.as_ref()
            .map(map_detail_row)
            .transpose()
            .map_err(LedgerStoreError::Db)
    }

    async fn get_snapshot_by_execution_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ExecutionSnapshotView>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT s.snapshot_id, s.authority AS snapshot_authority,
                       s.runtime_language AS snapshot_runtime_language, s.execution_capability,
                       s.correlation_id AS snapshot_correlation_id,
                       s.tenant_id AS snapshot_tenant_id, s.timestamp_utc, s.conformance_version,
                       s.policy_snapshot_json, s.governance_decision_id,
                       g.decision_id, g.tool_id, g.capability_id, g.authority, g.approved_by,
                       g.reason, g.policy_version, g.status,
                       g.timestamp_utc AS decision_timestamp_utc
                  FROM execution_snapshots s
                  LEFT JOIN governance_decisions g ON g.decision_id = s.governance_decision_id
                 WHERE s.execution_run_id = $1
                "#,
                &[&run_id],
            )
            .await
            .map_err(map_db_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let snapshot = map_snapshot_row(&row).map_err(LedgerStoreError::Db)?;
        let decision_id: Option<Uuid> = row.try_get("decision_id").map_err(map_db_error)?;
        let governance_decision = match decision_id {
            Some(decision_id) => Some(
                decision_from_row(&row, decision_id, "decision_timestamp_utc")
                    .map_err(LedgerStoreError::Db)?,
            ),
            None => None,
        };
        Ok(Some(ExecutionSnapshotView {
            execution_run_id: run_id,
            snapshot,
            governance_decision,
        }))
    }
}

fn map_decision_row(row: &tokio_postgres::Row) -> Result<GovernanceDecision, String> {
    let decision_id: Uuid = row.try_get("decision_id").map_err(|e| e.to_string())?;
    decision_from_row(row, decision_id, "timestamp_utc")
}

fn decision_from_row(
    row: &tokio_postgres::Row,
    decision_id: Uuid,
    timestamp_column: &str,
) -> Result<GovernanceDecision, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    Ok(GovernanceDecision {
        decision_id,
        tool_id: row.try_get("tool_id").map_err(|e| e.to_string())?,
        capability_id: row.try_get("capability_id").map_err(|e| e.to_string())?,
        authority: row.try_get("authority").map_err(|e| e.to_string())?,
        approved_by: row.try_get("approved_by").map_err(|e| e.to_string())?,
        reason: row.try_get("reason").map_err(|e| e.to_string())?,
        policy_version: row.try_get("policy_version").map_err(|e| e.to_string())?,
        status: GovernanceDecisionStatus::parse(&status)
            .ok_or_else(|| format!("unknown governance decision status {status}"))?,
        timestamp_utc: row.try_get(timestamp_column).map_err(|e| e.to_string())?,
    })
}

fn map_summary_row(row: &tokio_postgres::Row) -> Result<ExecutionSummary, String> {
    Ok(ExecutionSummary {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        tool_id: row.try_get("tool_id").map_err(|e| e.to_string())?,
        executed_at_utc: row.try_get("executed_at_utc").map_err(|e| e.to_string())?,
        success: row.try_get("success").map_err(|e| e.to_string())?,
        duration_ms: row.try_get("duration_ms").map_err(|e| e.to_string())?,
        error_type: row.try_get("error_type").map_err(|e| e.to_string())?,
        execution_mode: row.try_get("execution_mode").map_err(|e| e.to_string())?,
        adapter_name: row.try_get("adapter_name").map_err(|e| e.to_string())?,
        correlation_id: row.try_get("correlation_id").map_err(|e| e.to_string())?,
        tenant_id: row.try_get("tenant_id").map_err(|e| e.to_string())?,
        conformance_status: row.try_get("normalized_status").map_err(|e| e.to_string())?,
        conformance_valid: row.try_get("is_valid").map_err(|e| e.to_string())?,
        conformance_was_normalized: row.try_get("was_normalized").map_err(|e| e.to_string())?,
        conformance_issue_count: row.try_get("issue_count").map_err(|e| e.to_string())?,
    })
}

fn map_snapshot_row(row: &tokio_postgres::Row) -> Result<ExecutionSnapshot, String> {
    Ok(ExecutionSnapshot {
        snapshot_id: row.try_get("snapshot_id").map_err(|e| e.to_string())?,
        authority: row.try_get("snapshot_authority").map_err(|e| e.to_string())?,
        runtime_language: row
            .try_get("snapshot_runtime_language")
            .map_err(|e| e.to_string())?,
        execution_capability: row
            .try_get("execution_capability")
            .map_err(|e| e.to_string())?,
        correlation_id: row
            .try_get("snapshot_correlation_id")
            .map_err(|e| e.to_string())?,
        tenant_id: row.try_get("snapshot_tenant_id").map_err(|e| e.to_string())?,
        timestamp_utc: row.try_get("timestamp_utc").map_err(|e| e.to_string())?,
        conformance_version: row
            .try_get("conformance_version")
            .map_err(|e| e.to_string())?,
        policy_snapshot_json: row
            .try_get("policy_snapshot_json")
            .map_err(|e| e.to_string())?,
        governance_decision_id: row
            .try_get("governance_decision_id")
            .map_err(|e| e.to_string())?,
    })
}

fn map_detail_row(row: &tokio_postgres::Row) -> Result<ExecutionDetail, String> {
    Ok(ExecutionDetail {
        run: ExecutionRun {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            tool_id: row.try_get("tool_id").map_err(|e| e.to_string())?,
            executed_at_utc: row.try_get("executed_at_utc").map_err(|e| e.to_string())?,
            success: row.try_get("success").map_err(|e| e.to_string())?,
            duration_ms: row.try_get("duration_ms").map_err(|e| e.to_string())?,
            error_type: row.try_get("error_type").map_err(|e| e.to_string())?,
            payload_size: row.try_get("payload_size").map_err(|e| e.to_string())?,
            execution_mode: row.try_get("execution_mode").map_err(|e| e.to_string())?,
            runtime_language: row.try_get("runtime_language").map_err(|e| e.to_string())?,
            adapter_name: row.try_get("adapter_name").map_err(|e| e.to_string())?,
            adapter_resolution_status: row
                .try_get("adapter_resolution_status")
                .map_err(|e| e.to_string())?,
            capability: row.try_get("capability").map_err(|e| e.to_string())?,
            authority: row.try_get("authority").map_err(|e| e.to_string())?,
            correlation_id: row.try_get("correlation_id").map_err(|e| e.to_string())?,
            tenant_id: row.try_get("tenant_id").map_err(|e| e.to_string())?,
            trace_id: row.try_get("trace_id").map_err(|e| e.to_string())?,
        },
        snapshot: map_snapshot_row(row)?,
        conformance: ExecutionConformanceResult {
            is_valid: row.try_get("is_valid").map_err(|e| e.to_string())?,
            normalized_status: row.try_get("normalized_status").map_err(|e| e.to_string())?,
            was_normalized: row.try_get("was_normalized").map_err(|e| e.to_string())?,
            issue_count: row.try_get("issue_count").map_err(|e| e.to_string())?,
            issues_json: row.try_get("issues_json").map_err(|e| e.to_string())?,
        },
        authority_decision: ExecutionAuthorityDecision {
            authority: row.try_get("decision_authority").map_err(|e| e.to_string())?,
            admission_allowed: row.try_get("admission_allowed").map_err(|e| e.to_string())?,
            admission_reason: row.try_get("admission_reason").map_err(|e| e.to_string())?,
            decision_source: row.try_get("decision_source").map_err(|e| e.to_string())?,
        },
    })
}
