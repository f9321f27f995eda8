use std::collections::HashSet;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

pub const REDACTION_RULE_VERSION: u32 = 1;
pub const REDACTED: &str = "[REDACTED]";
pub const REDACTION_META_KEY: &str = "_redaction_meta";
pub const TRUNCATION_META_KEY: &str = "_truncation_meta";
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_FIELD_BYTES: usize = 2048;

/// Strings shorter than this are never halved; halving them would grow them past the marker.
const MIN_SHRINK_BYTES: usize = 256;
const ARRAY_SAMPLE_LEN: usize = 3;

const FULL_REDACT_KEYS: &[&str] = &[
    "password",
    "passphrase",
    "secret",
    "clientsecret",
    "apikey",
    "accesskey",
    "privatekey",
    "token",
    "refreshtoken",
    "authorization",
    "setcookie",
    "cookie",
    "sessionid",
    "otp",
    "mfacode",
    "pin",
];

const PARTIAL_PII_KEYS: &[&str] = &[
    "email",
    "phone",
    "ssn",
    "nationalid",
    "taxid",
    "creditcard",
    "cardnumber",
];

const DROPPED_ROOT_FIELDS: &[&str] = &["debug", "stack", "raw_request", "raw_response"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactionConfig {
    pub max_payload_bytes: usize,
    pub max_field_bytes: usize,
    /// Additional key names redacted in full, matched after normalization.
    pub extra_sensitive_fields: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_field_bytes: DEFAULT_MAX_FIELD_BYTES,
            extra_sensitive_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionMeta {
    pub rule_version: u32,
    pub fields_redacted_count: u64,
    pub patterns_redacted_count: u64,
    pub redacted_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationMeta {
    pub applied: bool,
    pub rule_version: u32,
    pub bytes_original: u64,
    pub bytes_final: u64,
    pub dropped_paths: Vec<String>,
    pub truncated_paths: Vec<String>,
    pub content_hash_sha256_before: String,
    pub content_hash_sha256_after: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedPayload {
    pub payload: Value,
    /// Covers the compact serialized text of `payload`, metadata blocks included.
    pub payload_hash_sha256: String,
    pub redaction: RedactionMeta,
    pub truncation: TruncationMeta,
}

impl ProcessedPayload {
    pub fn redaction_applied(&self) -> bool {
        self.redaction.fields_redacted_count > 0 || self.redaction.patterns_redacted_count > 0
    }
}

/// Redacts secrets and PII, then bounds per-field and total payload size.
///
/// The payload object is the root; anything else is wrapped as `{"value": ...}`. Both metadata
/// blocks are written at the root under [`REDACTION_META_KEY`] and [`TRUNCATION_META_KEY`].
pub struct AuditPayloadProcessor {
    config: RedactionConfig,
    full_redact_keys: HashSet<String>,
    jwt: Regex,
    bearer: Regex,
    pem: Regex,
    card_number: Regex,
}

struct PathedString {
    pointer: String,
    path: String,
    bytes: usize,
}

struct PathedArray {
    pointer: String,
    path: String,
    len: usize,
}

impl AuditPayloadProcessor {
    pub fn new(config: RedactionConfig) -> Result<Self, regex::Error> {
        let full_redact_keys = FULL_REDACT_KEYS
            .iter()
            .map(|key| (*key).to_string())
            .chain(
                config
                    .extra_sensitive_fields
                    .iter()
                    .map(|key| normalize_key(key)),
            )
            .filter(|key| !key.is_empty())
            .collect();
        Ok(Self {
            config,
            full_redact_keys,
            jwt: Regex::new(r"eyJ[a-zA-Z0-9_-]{10,}\.[a-zA-Z0-9_-]{10,}\.[a-zA-Z0-9_-]{10,}")?,
            bearer: Regex::new(r"(?i)bearer\s+[a-z0-9\-._~+/]+=*")?,
            pem: Regex::new(
                r"-----BEGIN [A-Z ]+PRIVATE KEY-----[\s\S]+?-----END [A-Z ]+PRIVATE KEY-----",
            )?,
            card_number: Regex::new(r"\b(?:\d[ -]*?){13,19}\b")?,
        })
    }

    pub fn process(&self, payload: Value) -> ProcessedPayload {
        let mut root = match payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Map::new()),
            other => json!({ "value": other }),
        };

        let mut redacted_paths = Vec::new();
        let mut patterns_redacted = 0_u64;
        self.redact(&mut root, "$", &mut redacted_paths, &mut patterns_redacted);
        let redaction = RedactionMeta {
            rule_version: REDACTION_RULE_VERSION,
            fields_redacted_count: redacted_paths.len() as u64,
            patterns_redacted_count: patterns_redacted,
            redacted_paths,
        };
        insert_root(
            &mut root,
            REDACTION_META_KEY,
            json!({
                "rule_version": redaction.rule_version,
                "fields_redacted_count": redaction.fields_redacted_count,
                "patterns_redacted_count": redaction.patterns_redacted_count,
                "redacted_paths": redaction.redacted_paths,
            }),
        );

        let serialized = root.to_string();
        let bytes_original = serialized.len();
        let content_hash_sha256_before = sha256_hex(&serialized);

        let mut truncated_paths = Vec::new();
        self.cap_fields(&mut root, "$", &mut truncated_paths);

        let mut dropped_paths = Vec::new();
        if let Value::Object(map) = &mut root {
            for field in DROPPED_ROOT_FIELDS {
                if map.get(*field).is_some_and(|value| !value.is_null()) {
                    map.remove(*field);
                    dropped_paths.push(format!("$.{field}"));
                }
            }
        }

        while root.to_string().len() > self.config.max_payload_bytes
            && shrink_largest_string(&mut root, &mut truncated_paths)
        {}
        while root.to_string().len() > self.config.max_payload_bytes
            && summarize_largest_array(&mut root, &mut truncated_paths)
        {}

        let final_serialized = root.to_string();
        let bytes_final = final_serialized.len();
        let mut seen = HashSet::new();
        truncated_paths.retain(|path| seen.insert(path.clone()));
        let truncation = TruncationMeta {
            applied: !truncated_paths.is_empty()
                || !dropped_paths.is_empty()
                || bytes_final != bytes_original,
            rule_version: REDACTION_RULE_VERSION,
            bytes_original: bytes_original as u64,
            bytes_final: bytes_final as u64,
            dropped_paths,
            truncated_paths,
            content_hash_sha256_before,
            content_hash_sha256_after: sha256_hex(&final_serialized),
        };
        insert_root(
            &mut root,
            TRUNCATION_META_KEY,
            json!({
                "applied": truncation.applied,
                "rule_version": truncation.rule_version,
                "bytes_original": truncation.bytes_original,
                "bytes_final": truncation.bytes_final,
                "dropped_paths": truncation.dropped_paths,
                "truncated_paths": truncation.truncated_paths,
                "content_hash_sha256_before": truncation.content_hash_sha256_before,
                "content_hash_sha256_after": truncation.content_hash_sha256_after,
            }),
        );

        let payload_hash_sha256 = sha256_hex(&root.to_string());
        ProcessedPayload {
            payload: root,
            payload_hash_sha256,
            redaction,
            truncation,
        }
    }

    fn redact(&self, node: &mut Value, path: &str, paths: &mut Vec<String>, patterns: &mut u64) {
        match node {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    let child_path = format!("{path}.{key}");
                    let normalized = normalize_key(key);
                    if child.as_str() == Some(REDACTED) {
                        continue;
                    }
                    if self.full_redact_keys.contains(&normalized) {
                        *child = Value::String(REDACTED.to_string());
                        paths.push(child_path);
                        continue;
                    }
                    if child.is_object() || child.is_array() {
                        self.redact(child, &child_path, paths, patterns);
                        continue;
                    }
                    if child.is_null() {
                        continue;
                    }
                    let raw = scalar_text(child);
                    if PARTIAL_PII_KEYS.contains(&normalized.as_str()) {
                        *child = Value::String(mask(&normalized, &raw));
                        paths.push(child_path);
                        continue;
                    }
                    let (scanned, count) = self.redact_patterns(&raw);
                    if count > 0 {
                        *patterns += count;
                        *child = Value::String(scanned);
                        paths.push(child_path);
                    }
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    match item {
                        Value::String(raw) => {
                            let (scanned, count) = self.redact_patterns(raw);
                            if count > 0 {
                                *patterns += count;
                                *raw = scanned;
                                paths.push(format!("{path}[{index}]"));
                            }
                        }
                        other => self.redact(other, &format!("{path}[{index}]"), paths, patterns),
                    }
                }
            }
            _ => {}
        }
    }

    fn redact_patterns(&self, input: &str) -> (String, u64) {
        let mut count = 0_u64;
        let mut replace = |regex: &Regex, source: &str| -> String {
            regex
                .replace_all(source, |_: &Captures<'_>| {
                    count += 1;
                    REDACTED
                })
                .into_owned()
        };
        let value = replace(&self.jwt, input);
        let value = replace(&self.bearer, &value);
        let value = replace(&self.pem, &value);
        let value = self
            .card_number
            .replace_all(&value, |captures: &Captures<'_>| {
                let candidate = &captures[0];
                if luhn_valid(candidate) {
                    count += 1;
                    REDACTED.to_string()
                } else {
                    candidate.to_string()
                }
            })
            .into_owned();
        (value, count)
    }

    fn cap_fields(&self, node: &mut Value, path: &str, truncated: &mut Vec<String>) {
        match node {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if key == REDACTION_META_KEY {
                        continue;
                    }
                    let child_path = format!("{path}.{key}");
                    if let Value::String(raw) = child {
                        if raw.len() > self.config.max_field_bytes {
                            *raw = truncation_marker(raw, self.config.max_field_bytes);
                            truncated.push(child_path);
                        }
                    } else {
                        self.cap_fields(child, &child_path, truncated);
                    }
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    self.cap_fields(item, &format!("{path}[{index}]"), truncated);
                }
            }
            _ => {}
        }
    }
}

fn insert_root(root: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = root {
        map.insert(key.to_string(), value);
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn floor_char_boundary(raw: &str, max_bytes: usize) -> usize {
    if max_bytes >= raw.len() {
        return raw.len();
    }
    (0..=max_bytes)
        .rev()
        .find(|index| raw.is_char_boundary(*index))
        .unwrap_or(0)
}

fn truncation_marker(raw: &str, keep_bytes: usize) -> String {
    let keep = &raw[..floor_char_boundary(raw, keep_bytes)];
    format!(
        "{keep}<TRUNCATED bytes_original={} bytes_kept={} sha256={}>",
        raw.len(),
        keep.len(),
        sha256_hex(raw)
    )
}

fn mask(key: &str, value: &str) -> String {
    match key {
        "email" => {
            let parts: Vec<&str> = value.split('@').collect();
            if let [local, domain] = parts.as_slice()
                && let Some(first) = local.chars().next()
            {
                return format!("{first}***@{domain}");
            }
            REDACTED.to_string()
        }
        "phone" => {
            let digits: Vec<char> = value.chars().filter(char::is_ascii_digit).collect();
            if digits.len() <= 2 {
                return "**".to_string();
            }
            let tail: String = digits[digits.len() - 2..].iter().collect();
            format!("{}{tail}", "*".repeat(digits.len() - 2))
        }
        "ssn" | "nationalid" | "taxid" => {
            let chars: Vec<char> = value.chars().collect();
            if chars.len() <= 4 {
                return "****".to_string();
            }
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}{tail}", "*".repeat(chars.len() - 4))
        }
        "creditcard" | "cardnumber" => {
            let digits: String = value.chars().filter(char::is_ascii_digit).collect();
            if digits.len() >= 10 {
                return format!(
                    "{}{}{}",
                    &digits[..6],
                    "*".repeat(digits.len() - 10),
                    &digits[digits.len() - 4..]
                );
            }
            REDACTED.to_string()
        }
        _ => REDACTED.to_string(),
    }
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(index, digit)| {
            if index % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                *digit
            }
        })
        .sum();
    sum % 10 == 0
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn collect_strings(node: &Value, pointer: &str, path: &str, out: &mut Vec<PathedString>) {
    match node {
        Value::Object(map) => {
            for (key, child) in map {
                if pointer.is_empty() && key == REDACTION_META_KEY {
                    continue;
                }
                let child_pointer = format!("{pointer}/{}", escape_pointer(key));
                let child_path = format!("{path}.{key}");
                match child {
                    Value::String(raw) => out.push(PathedString {
                        pointer: child_pointer,
                        path: child_path,
                        bytes: raw.len(),
                    }),
                    other => collect_strings(other, &child_pointer, &child_path, out),
                }
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_strings(
                    item,
                    &format!("{pointer}/{index}"),
                    &format!("{path}[{index}]"),
                    out,
                );
            }
        }
        _ => {}
    }
}

fn collect_arrays(node: &Value, pointer: &str, path: &str, out: &mut Vec<PathedArray>) {
    match node {
        Value::Object(map) => {
            for (key, child) in map {
                if pointer.is_empty() && key == REDACTION_META_KEY {
                    continue;
                }
                let child_pointer = format!("{pointer}/{}", escape_pointer(key));
                let child_path = format!("{path}.{key}");
                if let Value::Array(items) = child {
                    out.push(PathedArray {
                        pointer: child_pointer.clone(),
                        path: child_path.clone(),
                        len: items.len(),
                    });
                }
                collect_arrays(child, &child_pointer, &child_path, out);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_arrays(
                    item,
                    &format!("{pointer}/{index}"),
                    &format!("{path}[{index}]"),
                    out,
                );
            }
        }
        _ => {}
    }
}

fn shrink_largest_string(root: &mut Value, truncated: &mut Vec<String>) -> bool {
    let mut strings = Vec::new();
    collect_strings(root, "", "$", &mut strings);
    let Some(target) = strings
        .into_iter()
        .filter(|candidate| candidate.bytes >= MIN_SHRINK_BYTES)
        .max_by_key(|candidate| candidate.bytes)
    else {
        return false;
    };
    let Some(Value::String(raw)) = root.pointer_mut(&target.pointer) else {
        return false;
    };
    *raw = truncation_marker(raw, (raw.len() / 2).max(1));
    truncated.push(target.path);
    true
}

fn summarize_largest_array(root: &mut Value, truncated: &mut Vec<String>) -> bool {
    let mut arrays = Vec::new();
    collect_arrays(root, "", "$", &mut arrays);
    let Some(target) = arrays.into_iter().max_by_key(|candidate| candidate.len) else {
        return false;
    };
    let Some(slot) = root.pointer_mut(&target.pointer) else {
        return false;
    };
    let Value::Array(items) = &*slot else {
        return false;
    };
    let original_count = items.len();
    let sample: Vec<String> = items
        .iter()
        .take(ARRAY_SAMPLE_LEN)
        .map(|item| sha256_hex(&item.to_string()))
        .collect();
    *slot = json!({
        "_truncated_array": true,
        "original_count": original_count,
        "sample": sample,
    });
    truncated.push(target.path);
    true
}
