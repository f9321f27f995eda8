use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// Ownership edges cascade, the governance reference restricts. Every statement is idempotent.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS execution_events (
        id BIGSERIAL PRIMARY KEY,
        event_key TEXT NOT NULL UNIQUE,
        tool_slug TEXT NOT NULL,
        timestamp_utc TIMESTAMPTZ NOT NULL,
        duration_ms BIGINT NOT NULL,
        success BOOLEAN NOT NULL,
        error_type TEXT NULL,
        payload_size BIGINT NOT NULL,
        execution_mode TEXT NOT NULL,
        recorded_at_utc TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily_tool_metrics (
        tool_slug TEXT NOT NULL,
        date_utc DATE NOT NULL,
        total_executions BIGINT NOT NULL,
        success_count BIGINT NOT NULL,
        failure_count BIGINT NOT NULL,
        avg_duration_ms DOUBLE PRECISION NOT NULL,
        max_duration_ms BIGINT NOT NULL,
        total_payload_size BIGINT NOT NULL,
        PRIMARY KEY (tool_slug, date_utc),
        CHECK (total_executions = success_count + failure_count)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS governance_decisions (
        decision_id UUID PRIMARY KEY,
        tool_id TEXT NOT NULL,
        capability_id TEXT NOT NULL,
        authority TEXT NOT NULL,
        approved_by TEXT NOT NULL,
        reason TEXT NOT NULL,
        policy_version TEXT NOT NULL,
        status TEXT NOT NULL,
        timestamp_utc TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS execution_runs (
        id UUID PRIMARY KEY,
        tool_id TEXT NOT NULL,
        executed_at_utc TIMESTAMPTZ NOT NULL,
        success BOOLEAN NOT NULL,
        duration_ms BIGINT NOT NULL,
        error_type TEXT NULL,
        payload_size BIGINT NOT NULL,
        execution_mode TEXT NOT NULL,
        runtime_language TEXT NOT NULL,
        adapter_name TEXT NOT NULL,
        adapter_resolution_status TEXT NOT NULL,
        capability TEXT NOT NULL,
        authority TEXT NOT NULL,
        correlation_id TEXT NULL,
        tenant_id TEXT NULL,
        trace_id TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_execution_runs_correlation_id ON execution_runs (correlation_id)",
    "CREATE INDEX IF NOT EXISTS ix_execution_runs_tenant_id ON execution_runs (tenant_id)",
    "CREATE INDEX IF NOT EXISTS ix_execution_runs_executed_at_utc ON execution_runs (executed_at_utc)",
    "CREATE INDEX IF NOT EXISTS ix_execution_runs_tool_id ON execution_runs (tool_id)",
    r#"
    CREATE TABLE IF NOT EXISTS execution_snapshots (
        execution_run_id UUID PRIMARY KEY
            REFERENCES execution_runs (id) ON DELETE CASCADE,
        snapshot_id TEXT NOT NULL,
        authority TEXT NOT NULL,
        runtime_language TEXT NOT NULL,
        execution_capability TEXT NOT NULL,
        correlation_id TEXT NULL,
        tenant_id TEXT NULL,
        timestamp_utc TIMESTAMPTZ NOT NULL,
        conformance_version TEXT NOT NULL,
        policy_snapshot_json TEXT NULL,
        governance_decision_id UUID NOT NULL
            REFERENCES governance_decisions (decision_id) ON DELETE RESTRICT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_execution_snapshots_governance_decision_id ON execution_snapshots (governance_decision_id)",
    r#"
    CREATE TABLE IF NOT EXISTS execution_conformance_results (
        execution_run_id UUID PRIMARY KEY
            REFERENCES execution_runs (id) ON DELETE CASCADE,
        is_valid BOOLEAN NOT NULL,
        normalized_status TEXT NOT NULL,
        was_normalized BOOLEAN NOT NULL,
        issue_count INTEGER NOT NULL,
        issues_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS execution_authority_decisions (
        execution_run_id UUID PRIMARY KEY
            REFERENCES execution_runs (id) ON DELETE CASCADE,
        authority TEXT NOT NULL,
        admission_allowed BOOLEAN NOT NULL,
        admission_reason TEXT NOT NULL,
        decision_source TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_events (
        id UUID PRIMARY KEY,
        occurred_at_utc TIMESTAMPTZ NOT NULL,
        actor_type TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        tenant_id TEXT NULL,
        action TEXT NOT NULL,
        target_type TEXT NOT NULL,
        target_id TEXT NOT NULL,
        result_status TEXT NOT NULL,
        trace_id TEXT NULL,
        request_id TEXT NULL,
        payload_redacted JSON NOT NULL,
        payload_hash_sha256 TEXT NOT NULL,
        schema_version INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_audit_events_occurred_at_utc ON audit_events (occurred_at_utc)",
    r#"
    CREATE TABLE IF NOT EXISTS worker_leases (
        lease_name TEXT PRIMARY KEY,
        holder_id TEXT NOT NULL,
        expires_at_utc TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNLOGGED TABLE IF NOT EXISTS cache_entries (
        cache_key TEXT PRIMARY KEY,
        value JSONB NOT NULL,
        expires_at_utc TIMESTAMPTZ NOT NULL
    )
    "#,
];

#[derive(Clone)]
pub struct RuntimeDb {
    client: Arc<Mutex<Client>>,
}

impl RuntimeDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "runtime postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    pub async fn migrate(&self) -> Result<()> {
        let client = self.client.lock().await;
        for (index, statement) in SCHEMA_STATEMENTS.iter().enumerate() {
            client
                .batch_execute(statement)
                .await
                .with_context(|| format!("apply schema statement #{index}"))?;
        }
        tracing::info!(statements = SCHEMA_STATEMENTS.len(), "runtime schema applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SCHEMA_STATEMENTS;

    fn statement_for(table: &str) -> &'static str {
        SCHEMA_STATEMENTS
            .iter()
            .find(|statement| statement.contains(&format!("TABLE IF NOT EXISTS {table} (")))
            .copied()
            .unwrap_or_default()
    }

    #[test]
    fn owned_ledger_rows_cascade_and_governance_reference_restricts() {
        for owned in [
            "execution_snapshots",
            "execution_conformance_results",
            "execution_authority_decisions",
        ] {
            let ddl = statement_for(owned);
            assert!(
                ddl.contains("REFERENCES execution_runs (id) ON DELETE CASCADE"),
                "{owned} must cascade from execution_runs"
            );
        }

        let snapshots = statement_for("execution_snapshots");
        assert!(snapshots.contains("REFERENCES governance_decisions (decision_id) ON DELETE RESTRICT"));
        assert!(!snapshots.contains("governance_decisions (decision_id) ON DELETE CASCADE"));
    }

    #[test]
    fn schema_covers_every_logical_table() {
        for table in [
            "execution_events",
            "daily_tool_metrics",
            "execution_runs",
            "execution_snapshots",
            "execution_conformance_results",
            "execution_authority_decisions",
            "governance_decisions",
            "audit_events",
            "worker_leases",
            "cache_entries",
        ] {
            assert!(!statement_for(table).is_empty(), "missing table {table}");
        }
        assert!(statement_for("execution_events").contains("event_key TEXT NOT NULL UNIQUE"));
    }
}
