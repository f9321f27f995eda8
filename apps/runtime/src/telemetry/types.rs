use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const IDEMPOTENCY_KEY_PREFIX: &str = "ik:";
pub const NATURAL_KEY_PREFIX: &str = "nk:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sync,
    Async,
    Stream,
    Batch,
}

impl ExecutionMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Stream => "stream",
            Self::Batch => "batch",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sync" => Some(Self::Sync),
            "async" => Some(Self::Async),
            "stream" => Some(Self::Stream),
            "batch" => Some(Self::Batch),
            _ => None,
        }
    }
}

/// "A tool finished executing". Queued in memory only; durable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub tool_slug: String,
    pub timestamp_utc: DateTime<Utc>,
    pub duration_ms: i64,
    pub success: bool,
    pub payload_size: i64,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ExecutionEvent {
    /// Deduplication key. A caller supplied idempotency key wins; otherwise the natural key
    /// `(tool, timestamp, duration, payload size)` is hashed.
    #[must_use]
    pub fn event_key(&self) -> String {
        if let Some(key) = self
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        {
            return format!("{IDEMPOTENCY_KEY_PREFIX}{key}");
        }
        let natural = format!(
            "{}|{}|{}|{}",
            self.tool_slug,
            self.timestamp_utc.timestamp_micros(),
            self.duration_ms,
            self.payload_size
        );
        format!(
            "{NATURAL_KEY_PREFIX}{}",
            hex::encode(Sha256::digest(natural.as_bytes()))
        )
    }

    #[must_use]
    pub fn date_utc(&self) -> NaiveDate {
        self.timestamp_utc.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedExecutionEvent {
    pub event_key: String,
    pub event: ExecutionEvent,
    pub recorded_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyToolMetric {
    pub tool_slug: String,
    pub date_utc: NaiveDate,
    pub total_executions: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub total_payload_size: i64,
}

impl DailyToolMetric {
    pub fn first(event: &ExecutionEvent) -> Self {
        Self {
            tool_slug: event.tool_slug.clone(),
            date_utc: event.date_utc(),
            total_executions: 1,
            success_count: i64::from(event.success),
            failure_count: i64::from(!event.success),
            avg_duration_ms: event.duration_ms as f64,
            max_duration_ms: event.duration_ms,
            total_payload_size: event.payload_size,
        }
    }

    /// Running mean: `(old_avg * old_total + duration) / (old_total + 1)`.
    pub fn apply(&mut self, event: &ExecutionEvent) {
        let previous_total = self.total_executions;
        self.total_executions += 1;
        if event.success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.avg_duration_ms = (self.avg_duration_ms * previous_total as f64
            + event.duration_ms as f64)
            / self.total_executions as f64;
        self.max_duration_ms = self.max_duration_ms.max(event.duration_ms);
        self.total_payload_size += event.payload_size;
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total_executions as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Recorded,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{DailyToolMetric, ExecutionEvent, ExecutionMode};

    fn event(duration_ms: i64, success: bool) -> ExecutionEvent {
        ExecutionEvent {
            tool_slug: "json-formatter".to_string(),
            timestamp_utc: Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).single().unwrap_or_default(),
            duration_ms,
            success,
            payload_size: 128,
            execution_mode: ExecutionMode::Sync,
            error_type: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn event_key_prefers_idempotency_key() {
        let mut keyed = event(10, true);
        keyed.idempotency_key = Some("req-42".to_string());
        assert_eq!(keyed.event_key(), "ik:req-42");

        let natural = event(10, true);
        let key = natural.event_key();
        assert!(key.starts_with("nk:"));
        assert_eq!(key.len(), 3 + 64);
        assert_eq!(key, event(10, true).event_key());
        assert_ne!(key, event(11, true).event_key());
    }

    #[test]
    fn blank_idempotency_key_falls_back_to_natural_key() {
        let mut blank = event(10, true);
        blank.idempotency_key = Some("   ".to_string());
        assert!(blank.event_key().starts_with("nk:"));
    }

    #[test]
    fn running_mean_and_max_follow_each_event() {
        let mut metric = DailyToolMetric::first(&event(100, true));
        metric.apply(&event(200, false));
        metric.apply(&event(300, true));

        assert_eq!(metric.total_executions, 3);
        assert_eq!(metric.success_count, 2);
        assert_eq!(metric.failure_count, 1);
        assert!((metric.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(metric.max_duration_ms, 300);
        assert_eq!(metric.total_payload_size, 384);

        metric.apply(&event(50, true));
        assert_eq!(metric.max_duration_ms, 300);
        assert!((metric.avg_duration_ms - 162.5).abs() < 1e-9);
    }

    #[test]
    fn execution_mode_parses_case_insensitively() {
        assert_eq!(ExecutionMode::parse(" Stream "), Some(ExecutionMode::Stream));
        assert_eq!(ExecutionMode::parse("bogus"), None);
        assert_eq!(ExecutionMode::Batch.as_str(), "batch");
    }
}
