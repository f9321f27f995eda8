use std::sync::Arc;

use async_trait::async_trait;

use crate::telemetry::store::TelemetryStore;
use crate::telemetry::types::{ExecutionEvent, ProcessOutcome};
use crate::worker::ItemProcessor;

/// Persists one event and folds it into its daily aggregate. Storage errors propagate so the
/// worker's retry policy applies.
pub struct TelemetryProcessor {
    store: Arc<dyn TelemetryStore>,
}

impl TelemetryProcessor {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ItemProcessor<ExecutionEvent> for TelemetryProcessor {
    async fn process(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        let outcome = self.store.record_and_aggregate(event).await?;
        match outcome {
            ProcessOutcome::Recorded => tracing::debug!(
                tool_slug = %event.tool_slug,
                duration_ms = event.duration_ms,
                success = event.success,
                "execution event aggregated"
            ),
            ProcessOutcome::Duplicate => tracing::debug!(
                tool_slug = %event.tool_slug,
                event_key = %event.event_key(),
                "duplicate execution event skipped"
            ),
        }
        Ok(())
    }
}
