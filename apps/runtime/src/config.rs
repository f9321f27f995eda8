use std::{env, time::Duration};

use thiserror::Error;
use uuid::Uuid;

use crate::audit::RedactionConfig;
use crate::audit::redaction::{DEFAULT_MAX_FIELD_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::lease::TELEMETRY_AGGREGATOR_LEASE;
use crate::worker::WorkerConfig;

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub db_url: Option<String>,
    pub instance_id: String,
    pub telemetry_lease_name: String,
    pub telemetry_lease_ttl_seconds: u64,
    pub telemetry_lease_poll_ms: u64,
    pub cache_default_ttl_seconds: u64,
    pub cache_shared_enabled: bool,
    pub audit_write_enabled: bool,
    pub audit_max_payload_bytes: usize,
    pub audit_max_field_bytes: usize,
    pub audit_redact_fields: Vec<String>,
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RUNTIME_TELEMETRY_LEASE_TTL_SECONDS: {0}")]
    InvalidTelemetryLeaseTtlSeconds(String),
    #[error("invalid RUNTIME_TELEMETRY_LEASE_POLL_MS: {0}")]
    InvalidTelemetryLeasePollMs(String),
    #[error("invalid RUNTIME_CACHE_DEFAULT_TTL_SECONDS: {0}")]
    InvalidCacheDefaultTtlSeconds(String),
    #[error("invalid RUNTIME_CACHE_SHARED_ENABLED: {0}")]
    InvalidCacheSharedEnabled(String),
    #[error("invalid RUNTIME_AUDIT_WRITE_ENABLED: {0}")]
    InvalidAuditWriteEnabled(String),
    #[error("invalid RUNTIME_AUDIT_MAX_PAYLOAD_BYTES: {0}")]
    InvalidAuditMaxPayloadBytes(String),
    #[error("invalid RUNTIME_AUDIT_MAX_FIELD_BYTES: {0}")]
    InvalidAuditMaxFieldBytes(String),
    #[error("invalid RUNTIME_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let service_name = lookup("RUNTIME_SERVICE_NAME")
            .unwrap_or_else(|| "toolnexus-runtime".to_string());
        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let instance_id = lookup("RUNTIME_INSTANCE_ID")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let telemetry_lease_name = lookup("RUNTIME_TELEMETRY_LEASE_NAME")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| TELEMETRY_AGGREGATOR_LEASE.to_string());

        let telemetry_lease_ttl_seconds = parse_with_lookup(
            &lookup,
            "RUNTIME_TELEMETRY_LEASE_TTL_SECONDS",
            300,
            |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|error| ConfigError::InvalidTelemetryLeaseTtlSeconds(error.to_string()))
                    .map(|value| value.clamp(5, 3600))
            },
        )?;
        let telemetry_lease_poll_ms =
            parse_with_lookup(&lookup, "RUNTIME_TELEMETRY_LEASE_POLL_MS", 2000, |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|error| ConfigError::InvalidTelemetryLeasePollMs(error.to_string()))
                    .map(|value| value.clamp(10, 60_000))
            })?;
        let cache_default_ttl_seconds =
            parse_with_lookup(&lookup, "RUNTIME_CACHE_DEFAULT_TTL_SECONDS", 60, |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|error| ConfigError::InvalidCacheDefaultTtlSeconds(error.to_string()))
                    .map(|value| value.max(1))
            })?;
        let cache_shared_enabled =
            parse_bool_lookup(&lookup, "RUNTIME_CACHE_SHARED_ENABLED", true)
                .map_err(ConfigError::InvalidCacheSharedEnabled)?;
        let audit_write_enabled = parse_bool_lookup(&lookup, "RUNTIME_AUDIT_WRITE_ENABLED", true)
            .map_err(ConfigError::InvalidAuditWriteEnabled)?;
        let audit_max_payload_bytes = parse_with_lookup(
            &lookup,
            "RUNTIME_AUDIT_MAX_PAYLOAD_BYTES",
            DEFAULT_MAX_PAYLOAD_BYTES,
            |raw| {
                raw.trim()
                    .parse::<usize>()
                    .map_err(|error| ConfigError::InvalidAuditMaxPayloadBytes(error.to_string()))
                    .map(|value| value.clamp(1024, 4 * 1024 * 1024))
            },
        )?;
        let audit_max_field_bytes = parse_with_lookup(
            &lookup,
            "RUNTIME_AUDIT_MAX_FIELD_BYTES",
            DEFAULT_MAX_FIELD_BYTES,
            |raw| {
                raw.trim()
                    .parse::<usize>()
                    .map_err(|error| ConfigError::InvalidAuditMaxFieldBytes(error.to_string()))
                    .map(|value| value.clamp(64, audit_max_payload_bytes))
            },
        )?;
        let audit_redact_fields = lookup("RUNTIME_AUDIT_REDACT_FIELDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let log_format = parse_log_format(
            lookup("RUNTIME_LOG_FORMAT")
                .unwrap_or_else(|| "text".to_string())
                .as_str(),
        )?;

        Ok(Self {
            service_name,
            db_url,
            instance_id,
            telemetry_lease_name,
            telemetry_lease_ttl_seconds,
            telemetry_lease_poll_ms,
            cache_default_ttl_seconds,
            cache_shared_enabled,
            audit_write_enabled,
            audit_max_payload_bytes,
            audit_max_field_bytes,
            audit_redact_fields,
            log_format,
        })
    }

    pub fn telemetry_worker(&self) -> WorkerConfig {
        WorkerConfig {
            lease_name: self.telemetry_lease_name.clone(),
            lease_ttl: Duration::from_secs(self.telemetry_lease_ttl_seconds),
            lease_poll_interval: Duration::from_millis(self.telemetry_lease_poll_ms),
        }
    }

    pub fn cache_default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_default_ttl_seconds)
    }

    pub fn redaction_config(&self) -> RedactionConfig {
        RedactionConfig {
            max_payload_bytes: self.audit_max_payload_bytes,
            max_field_bytes: self.audit_max_field_bytes,
            extra_sensitive_fields: self.audit_redact_fields.clone(),
        }
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_bool_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, String> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("{key}: {other}")),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "text" | "" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{Config, ConfigError, LogFormat};
    use crate::lease::TELEMETRY_AGGREGATOR_LEASE;

    fn parse(values: &[(&'static str, &'static str)]) -> Result<Config, ConfigError> {
        let values: HashMap<&str, &str> = values.iter().copied().collect();
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() -> anyhow::Result<()> {
        let config = parse(&[])?;
        assert_eq!(config.service_name, "toolnexus-runtime");
        assert!(config.db_url.is_none());
        assert!(!config.instance_id.is_empty());
        assert_eq!(config.telemetry_lease_name, TELEMETRY_AGGREGATOR_LEASE);
        assert_eq!(config.telemetry_worker().lease_ttl, Duration::from_secs(300));
        assert_eq!(
            config.telemetry_worker().lease_poll_interval,
            Duration::from_millis(2000)
        );
        assert_eq!(config.cache_default_ttl(), Duration::from_secs(60));
        assert!(config.cache_shared_enabled);
        assert!(config.audit_write_enabled);
        assert_eq!(config.redaction_config().max_payload_bytes, 65_536);
        assert_eq!(config.redaction_config().max_field_bytes, 2048);
        assert_eq!(config.log_format, LogFormat::Text);
        Ok(())
    }

    #[test]
    fn overrides_are_parsed_and_clamped() -> anyhow::Result<()> {
        let config = parse(&[
            ("DATABASE_URL", " postgres://localhost/toolnexus "),
            ("RUNTIME_INSTANCE_ID", "node-a"),
            ("RUNTIME_TELEMETRY_LEASE_TTL_SECONDS", "1"),
            ("RUNTIME_CACHE_SHARED_ENABLED", "off"),
            ("RUNTIME_AUDIT_WRITE_ENABLED", "0"),
            ("RUNTIME_AUDIT_REDACT_FIELDS", "iban, ,routingNumber"),
            ("RUNTIME_LOG_FORMAT", "JSON"),
        ])?;
        assert_eq!(config.db_url.as_deref(), Some("postgres://localhost/toolnexus"));
        assert_eq!(config.instance_id, "node-a");
        assert_eq!(config.telemetry_lease_ttl_seconds, 5);
        assert!(!config.cache_shared_enabled);
        assert!(!config.audit_write_enabled);
        assert_eq!(
            config.redaction_config().extra_sensitive_fields,
            vec!["iban".to_string(), "routingNumber".to_string()]
        );
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_format.as_str(), "json");
        Ok(())
    }

    #[test]
    fn db_url_takes_precedence_over_database_url() -> anyhow::Result<()> {
        let config = parse(&[
            ("DB_URL", "postgres://primary/db"),
            ("DATABASE_URL", "postgres://fallback/db"),
        ])?;
        assert_eq!(config.db_url.as_deref(), Some("postgres://primary/db"));
        Ok(())
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            parse(&[("RUNTIME_TELEMETRY_LEASE_TTL_SECONDS", "soon")]),
            Err(ConfigError::InvalidTelemetryLeaseTtlSeconds(_))
        ));
        assert!(matches!(
            parse(&[("RUNTIME_AUDIT_WRITE_ENABLED", "maybe")]),
            Err(ConfigError::InvalidAuditWriteEnabled(_))
        ));
        assert!(matches!(
            parse(&[("RUNTIME_LOG_FORMAT", "xml")]),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }
}
