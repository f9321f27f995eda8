pub mod processor;
pub mod store;
pub mod types;

pub use processor::TelemetryProcessor;
pub use store::{TelemetryStore, TelemetryStoreError};
pub use types::{DailyToolMetric, ExecutionEvent, ExecutionMode, ProcessOutcome};

use crate::queue::WorkQueue;

/// Request-path entry point. Recording never blocks and never fails the caller.
#[derive(Clone)]
pub struct TelemetryIngest {
    queue: WorkQueue<ExecutionEvent>,
}

impl TelemetryIngest {
    pub fn new(queue: WorkQueue<ExecutionEvent>) -> Self {
        Self { queue }
    }

    pub fn record_execution(&self, event: ExecutionEvent) {
        let tool_slug = event.tool_slug.clone();
        if !self.queue.enqueue(event) {
            tracing::warn!(%tool_slug, "telemetry queue closed; execution event dropped");
        }
    }

    pub fn pending(&self) -> u64 {
        self.queue.depth()
    }
}
