//! Append-only execution ledger and governance decisions.
//!
//! A run owns its snapshot, conformance result and authority decision (deleting the run deletes
//! them). A snapshot only references its governance decision; that decision cannot be deleted
//! while referenced.

pub mod store;
pub mod types;

pub use store::{LedgerStore, LedgerStoreError};
pub use types::{
    DateRange, ExecutionAuthorityDecision, ExecutionConformanceResult, ExecutionDetail,
    ExecutionPage, ExecutionQuery, ExecutionRun, ExecutionSnapshot, ExecutionSnapshotView,
    ExecutionSummary, GovernanceDecision, GovernanceDecisionPage, GovernanceDecisionQuery,
    GovernanceDecisionStatus, NewExecutionRun, TimeRange,
};

#[cfg(test)]
mod tests;
