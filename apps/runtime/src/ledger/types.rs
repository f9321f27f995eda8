use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: Uuid,
    pub tool_id: String,
    pub executed_at_utc: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: i64,
    pub error_type: Option<String>,
    pub payload_size: i64,
    pub execution_mode: String,
    pub runtime_language: String,
    pub adapter_name: String,
    pub adapter_resolution_status: String,
    pub capability: String,
    pub authority: String,
    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,
    pub trace_id: Option<String>,
}

/// Caller input for [`ExecutionRun`]; the ledger assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExecutionRun {
    pub tool_id: String,
    pub executed_at_utc: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: i64,
    #[serde(default)]
    pub error_type: Option<String>,
    pub payload_size: i64,
    pub execution_mode: String,
    pub runtime_language: String,
    pub adapter_name: String,
    pub adapter_resolution_status: String,
    pub capability: String,
    pub authority: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl NewExecutionRun {
    pub fn into_run(self, id: Uuid) -> ExecutionRun {
        ExecutionRun {
            id,
            tool_id: self.tool_id,
            executed_at_utc: self.executed_at_utc,
            success: self.success,
            duration_ms: self.duration_ms,
            error_type: self.error_type,
            payload_size: self.payload_size,
            execution_mode: self.execution_mode,
            runtime_language: self.runtime_language,
            adapter_name: self.adapter_name,
            adapter_resolution_status: self.adapter_resolution_status,
            capability: self.capability,
            authority: self.authority,
            correlation_id: self.correlation_id,
            tenant_id: self.tenant_id,
            trace_id: self.trace_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub snapshot_id: String,
    pub authority: String,
    pub runtime_language: String,
    pub execution_capability: String,
    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,
    pub timestamp_utc: DateTime<Utc>,
    pub conformance_version: String,
    pub policy_snapshot_json: Option<String>,
    pub governance_decision_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConformanceResult {
    pub is_valid: bool,
    pub normalized_status: String,
    pub was_normalized: bool,
    pub issue_count: i32,
    pub issues_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAuthorityDecision {
    pub authority: String,
    pub admission_allowed: bool,
    pub admission_reason: String,
    pub decision_source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceDecisionStatus {
    Approved,
    Rejected,
    Override,
}

impl GovernanceDecisionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Override => "override",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "override" => Some(Self::Override),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceDecision {
    pub decision_id: Uuid,
    pub tool_id: String,
    pub capability_id: String,
    pub authority: String,
    pub approved_by: String,
    pub reason: String,
    pub policy_version: String,
    pub status: GovernanceDecisionStatus,
    pub timestamp_utc: DateTime<Utc>,
}

/// Half-open `[from, to)` window. Either end may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at < to)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        match (self.from, self.to) {
            (Some(from), Some(to)) => from <= to,
            _ => true,
        }
    }
}

/// Inclusive day range for daily metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionQuery {
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

impl ExecutionQuery {
    pub fn validate(&self) -> Result<(), String> {
        if self.page == 0 {
            return Err("page must be >= 1".to_string());
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(format!("page_size must be within 1..={MAX_PAGE_SIZE}"));
        }
        if self.time_range.is_some_and(|range| !range.is_valid()) {
            return Err("time_range.from must not be after time_range.to".to_string());
        }
        Ok(())
    }

    pub fn matches(&self, run: &ExecutionRun) -> bool {
        fn same(filter: &Option<String>, value: &Option<String>) -> bool {
            filter
                .as_deref()
                .is_none_or(|expected| value.as_deref() == Some(expected))
        }
        same(&self.correlation_id, &run.correlation_id)
            && same(&self.tenant_id, &run.tenant_id)
            && self
                .tool_id
                .as_deref()
                .is_none_or(|tool_id| run.tool_id == tool_id)
            && self
                .time_range
                .is_none_or(|range| range.contains(run.executed_at_utc))
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    /// Cache key fragment: sha256 over the JSON form, so `None` and `Some("")` differ and
    /// filter values cannot bleed into neighbouring fields.
    pub fn cache_key_fragment(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_else(|_| format!("{self:?}").into_bytes());
        hex::encode(Sha256::digest(&encoded))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub tool_id: String,
    pub executed_at_utc: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: i64,
    pub error_type: Option<String>,
    pub execution_mode: String,
    pub adapter_name: String,
    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,
    pub conformance_status: String,
    pub conformance_valid: bool,
    pub conformance_was_normalized: bool,
    pub conformance_issue_count: i32,
}

impl ExecutionSummary {
    pub fn from_parts(run: &ExecutionRun, conformance: &ExecutionConformanceResult) -> Self {
        Self {
            id: run.id,
            tool_id: run.tool_id.clone(),
            executed_at_utc: run.executed_at_utc,
            success: run.success,
            duration_ms: run.duration_ms,
            error_type: run.error_type.clone(),
            execution_mode: run.execution_mode.clone(),
            adapter_name: run.adapter_name.clone(),
            correlation_id: run.correlation_id.clone(),
            tenant_id: run.tenant_id.clone(),
            conformance_status: conformance.normalized_status.clone(),
            conformance_valid: conformance.is_valid,
            conformance_was_normalized: conformance.was_normalized,
            conformance_issue_count: conformance.issue_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPage {
    pub items: Vec<ExecutionSummary>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub run: ExecutionRun,
    pub snapshot: ExecutionSnapshot,
    pub conformance: ExecutionConformanceResult,
    pub authority_decision: ExecutionAuthorityDecision,
}

/// Snapshot joined with the governance decision it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSnapshotView {
    pub execution_run_id: Uuid,
    pub snapshot: ExecutionSnapshot,
    pub governance_decision: Option<GovernanceDecision>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceDecisionQuery {
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub policy_version: Option<String>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

impl GovernanceDecisionQuery {
    pub fn validate(&self) -> Result<(), String> {
        ExecutionQuery {
            page: self.page,
            page_size: self.page_size,
            time_range: self.time_range,
            ..ExecutionQuery::default()
        }
        .validate()
    }

    pub fn matches(&self, decision: &GovernanceDecision) -> bool {
        self.tool_id
            .as_deref()
            .is_none_or(|tool_id| decision.tool_id == tool_id)
            && self
                .policy_version
                .as_deref()
                .is_none_or(|version| decision.policy_version == version)
            && self
                .time_range
                .is_none_or(|range| range.contains(decision.timestamp_utc))
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceDecisionPage {
    pub items: Vec<GovernanceDecision>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{ExecutionQuery, MAX_PAGE_SIZE, TimeRange};

    #[test]
    fn query_validation_rejects_malformed_paging_and_ranges() {
        let valid = ExecutionQuery {
            page: 1,
            page_size: 25,
            ..ExecutionQuery::default()
        };
        assert!(valid.validate().is_ok());

        let zero_page = ExecutionQuery { page: 0, ..valid.clone() };
        assert!(zero_page.validate().is_err());

        let huge = ExecutionQuery {
            page_size: MAX_PAGE_SIZE + 1,
            ..valid.clone()
        };
        assert!(huge.validate().is_err());

        let now = Utc::now();
        let inverted = ExecutionQuery {
            time_range: Some(TimeRange {
                from: Some(now),
                to: Some(now - Duration::hours(1)),
            }),
            ..valid
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn time_range_is_half_open() {
        let now = Utc::now();
        let range = TimeRange {
            from: Some(now),
            to: Some(now + Duration::minutes(5)),
        };
        assert!(range.contains(now));
        assert!(!range.contains(now + Duration::minutes(5)));
        assert!(TimeRange::default().contains(now));
    }

    #[test]
    fn offset_follows_one_based_pages() {
        let query = ExecutionQuery {
            page: 3,
            page_size: 20,
            ..ExecutionQuery::default()
        };
        assert_eq!(query.offset(), 40);
    }
}
