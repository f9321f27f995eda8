use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use super::{
    ExecutionAuthorityDecision, ExecutionConformanceResult, ExecutionQuery, ExecutionSnapshot,
    GovernanceDecision, GovernanceDecisionQuery, GovernanceDecisionStatus, LedgerStore,
    LedgerStoreError, NewExecutionRun, TimeRange, store,
};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0)
        .single()
        .unwrap_or_default()
}

fn decision(tool_id: &str, policy_version: &str) -> GovernanceDecision {
    GovernanceDecision {
        decision_id: Uuid::now_v7(),
        tool_id: tool_id.to_string(),
        capability_id: "text.transform".to_string(),
        authority: "platform".to_string(),
        approved_by: "admin-7".to_string(),
        reason: "baseline policy".to_string(),
        policy_version: policy_version.to_string(),
        status: GovernanceDecisionStatus::Approved,
        timestamp_utc: base_time(),
    }
}

fn run(tool_id: &str, minutes: i64, correlation_id: &str, tenant_id: &str) -> NewExecutionRun {
    NewExecutionRun {
        tool_id: tool_id.to_string(),
        executed_at_utc: base_time() + Duration::minutes(minutes),
        success: true,
        duration_ms: 42,
        error_type: None,
        payload_size: 512,
        execution_mode: "sync".to_string(),
        runtime_language: "rust".to_string(),
        adapter_name: "native".to_string(),
        adapter_resolution_status: "resolved".to_string(),
        capability: "text.transform".to_string(),
        authority: "platform".to_string(),
        correlation_id: Some(correlation_id.to_string()),
        tenant_id: Some(tenant_id.to_string()),
        trace_id: None,
    }
}

fn snapshot(decision_id: Uuid) -> ExecutionSnapshot {
    ExecutionSnapshot {
        snapshot_id: Uuid::new_v4().to_string(),
        authority: "platform".to_string(),
        runtime_language: "rust".to_string(),
        execution_capability: "text.transform".to_string(),
        correlation_id: None,
        tenant_id: None,
        timestamp_utc: base_time(),
        conformance_version: "v2".to_string(),
        policy_snapshot_json: Some(r#"{"max_payload":1048576}"#.to_string()),
        governance_decision_id: decision_id,
    }
}

fn conformance() -> ExecutionConformanceResult {
    ExecutionConformanceResult {
        is_valid: true,
        normalized_status: "ok".to_string(),
        was_normalized: false,
        issue_count: 0,
        issues_json: "[]".to_string(),
    }
}

fn authority_decision() -> ExecutionAuthorityDecision {
    ExecutionAuthorityDecision {
        authority: "platform".to_string(),
        admission_allowed: true,
        admission_reason: "policy_allows".to_string(),
        decision_source: "governance".to_string(),
    }
}

async fn record(
    ledger: &Arc<dyn LedgerStore>,
    new_run: NewExecutionRun,
    decision_id: Uuid,
) -> Result<Uuid> {
    Ok(ledger
        .record_run(new_run, snapshot(decision_id), conformance(), authority_decision())
        .await?)
}

#[tokio::test]
async fn deleting_a_run_cascades_to_owned_rows() -> Result<()> {
    let ledger = store::memory();
    let decision = ledger
        .record_governance_decision(decision("json-formatter", "2026.05"))
        .await?;
    let run_id = record(&ledger, run("json-formatter", 0, "corr-1", "tenant-a"), decision.decision_id).await?;

    let detail = ledger
        .get_execution_by_id(run_id)
        .await?
        .ok_or_else(|| anyhow!("detail missing"))?;
    assert_eq!(detail.run.id, run_id);
    assert_eq!(detail.snapshot.governance_decision_id, decision.decision_id);

    assert!(ledger.delete_run(run_id).await?);
    assert!(ledger.get_execution_by_id(run_id).await?.is_none());
    assert!(ledger.get_snapshot_by_execution_id(run_id).await?.is_none());
    assert!(!ledger.delete_run(run_id).await?);

    // The referenced decision survives the cascade.
    assert!(ledger.get_governance_decision(decision.decision_id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn referenced_governance_decision_cannot_be_deleted() -> Result<()> {
    let ledger = store::memory();
    let decision = ledger
        .record_governance_decision(decision("json-formatter", "2026.05"))
        .await?;
    let run_id = record(&ledger, run("json-formatter", 0, "corr-1", "tenant-a"), decision.decision_id).await?;

    let result = ledger.delete_governance_decision(decision.decision_id).await;
    assert!(matches!(result, Err(LedgerStoreError::InUse(_))));
    assert!(ledger.get_governance_decision(decision.decision_id).await?.is_some());
    assert!(ledger.get_execution_by_id(run_id).await?.is_some());

    ledger.delete_run(run_id).await?;
    assert!(ledger.delete_governance_decision(decision.decision_id).await?);
    assert!(ledger.get_governance_decision(decision.decision_id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn run_referencing_unknown_decision_writes_nothing() -> Result<()> {
    let ledger = store::memory();
    let result = ledger
        .record_run(
            run("json-formatter", 0, "corr-1", "tenant-a"),
            snapshot(Uuid::now_v7()),
            conformance(),
            authority_decision(),
        )
        .await;
    assert!(matches!(result, Err(LedgerStoreError::MissingReference(_))));

    let page = ledger
        .get_executions(&ExecutionQuery {
            page: 1,
            page_size: 10,
            ..ExecutionQuery::default()
        })
        .await?;
    assert_eq!(page.total, 0);
    Ok(())
}

#[tokio::test]
async fn duplicate_governance_decision_conflicts() -> Result<()> {
    let ledger = store::memory();
    let original = decision("base64", "2026.05");
    ledger.record_governance_decision(original.clone()).await?;
    let result = ledger.record_governance_decision(original).await;
    assert!(matches!(result, Err(LedgerStoreError::Conflict(_))));
    Ok(())
}

#[tokio::test]
async fn executions_page_filters_and_orders_newest_first() -> Result<()> {
    let ledger = store::memory();
    let decision = ledger
        .record_governance_decision(decision("json-formatter", "2026.05"))
        .await?;
    let id = decision.decision_id;
    for minute in 0..5 {
        record(&ledger, run("json-formatter", minute, "corr-1", "tenant-a"), id).await?;
    }
    record(&ledger, run("base64", 10, "corr-2", "tenant-a"), id).await?;
    record(&ledger, run("json-formatter", 20, "corr-3", "tenant-b"), id).await?;

    let first_page = ledger
        .get_executions(&ExecutionQuery {
            page: 1,
            page_size: 2,
            correlation_id: Some("corr-1".to_string()),
            ..ExecutionQuery::default()
        })
        .await?;
    assert_eq!(first_page.total, 5);
    assert_eq!(first_page.items.len(), 2);
    assert!(first_page.items[0].executed_at_utc > first_page.items[1].executed_at_utc);
    assert_eq!(first_page.items[0].conformance_status, "ok");

    let last_page = ledger
        .get_executions(&ExecutionQuery {
            page: 3,
            page_size: 2,
            correlation_id: Some("corr-1".to_string()),
            ..ExecutionQuery::default()
        })
        .await?;
    assert_eq!(last_page.items.len(), 1);

    let by_tenant = ledger
        .get_executions(&ExecutionQuery {
            page: 1,
            page_size: 50,
            tenant_id: Some("tenant-b".to_string()),
            ..ExecutionQuery::default()
        })
        .await?;
    assert_eq!(by_tenant.total, 1);

    let windowed = ledger
        .get_executions(&ExecutionQuery {
            page: 1,
            page_size: 50,
            tool_id: Some("json-formatter".to_string()),
            time_range: Some(TimeRange {
                from: Some(base_time() + Duration::minutes(3)),
                to: Some(base_time() + Duration::minutes(30)),
            }),
            ..ExecutionQuery::default()
        })
        .await?;
    assert_eq!(windowed.total, 3);
    Ok(())
}

#[tokio::test]
async fn malformed_query_is_rejected() {
    let ledger = store::memory();
    let result = ledger
        .get_executions(&ExecutionQuery {
            page: 0,
            page_size: 10,
            ..ExecutionQuery::default()
        })
        .await;
    assert!(matches!(result, Err(LedgerStoreError::InvalidQuery(_))));
}

#[tokio::test]
async fn snapshot_view_joins_its_governance_decision() -> Result<()> {
    let ledger = store::memory();
    let decision = ledger
        .record_governance_decision(decision("uuid", "2026.05"))
        .await?;
    let run_id = record(&ledger, run("uuid", 0, "corr-9", "tenant-a"), decision.decision_id).await?;

    let view = ledger
        .get_snapshot_by_execution_id(run_id)
        .await?
        .ok_or_else(|| anyhow!("snapshot missing"))?;
    assert_eq!(view.execution_run_id, run_id);
    assert_eq!(view.snapshot.conformance_version, "v2");
    assert_eq!(view.governance_decision, Some(decision));
    Ok(())
}

#[tokio::test]
async fn governance_decisions_filter_by_tool_and_policy_version() -> Result<()> {
    let ledger = store::memory();
    ledger.record_governance_decision(decision("base64", "2026.04")).await?;
    ledger.record_governance_decision(decision("base64", "2026.05")).await?;
    ledger.record_governance_decision(decision("uuid", "2026.05")).await?;

    let page = ledger
        .list_governance_decisions(&GovernanceDecisionQuery {
            page: 1,
            page_size: 10,
            tool_id: Some("base64".to_string()),
            policy_version: Some("2026.05".to_string()),
            time_range: None,
        })
        .await?;
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].policy_version, "2026.05");

    let all = ledger
        .list_governance_decisions(&GovernanceDecisionQuery {
            page: 1,
            page_size: 10,
            ..GovernanceDecisionQuery::default()
        })
        .await?;
    assert_eq!(all.total, 3);
    Ok(())
}
