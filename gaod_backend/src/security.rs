//! Redaction for failure logs and validation of incoming turns.
//!
//! Every failure surfaced to a user is first logged through [`log_failure`],
//! which masks credential-looking JSON keys, email addresses, and API-key
//! shapes so that logs never carry secrets or PII.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::{Map, Value};

const SENSITIVE_KEYS: [&str; 5] = ["password", "token", "key", "secret", "authorization"];
const REDACTED: &str = "[REDACTED]";
const REDACTED_EMAIL: &str = "[REDACTED_EMAIL]";

pub const ALLOWED_ROLES: [&str; 3] = ["user", "assistant", "system"];

fn email_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").ok())
        .as_ref()
}

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"sk-[A-Za-z0-9_\-]{20,}",
            r"Bearer\s+[A-Za-z0-9._\-]{10,}",
            r"AIza[0-9A-Za-z_\-]{35}",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// `key=...`, `access_token=...` and similar query parameters.
fn query_secret_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)\b([a-z_]*(?:key|token|secret|password))=[^&\s)\]]+").ok()
        })
        .as_ref()
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|needle| lower.contains(needle))
}

/// Mask email addresses and known secret shapes in free text.
pub fn redact_text(input: &str) -> String {
    let mut result = match email_pattern() {
        Some(pattern) => pattern.replace_all(input, REDACTED_EMAIL).into_owned(),
        None => input.to_string(),
    };
    if let Some(pattern) = query_secret_pattern() {
        result = pattern
            .replace_all(&result, format!("${{1}}={}", REDACTED).as_str())
            .into_owned();
    }
    for pattern in secret_patterns() {
        result = pattern.replace_all(&result, REDACTED).into_owned();
    }
    result
}

/// Recursively redact a JSON payload: sensitive keys are replaced wholesale,
/// strings are run through [`redact_text`].
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => {
            let mut redacted = Map::with_capacity(map.len());
            for (key, item) in map {
                let masked = if is_sensitive_key(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    redact_value(item)
                };
                redacted.insert(key.clone(), masked);
            }
            Value::Object(redacted)
        }
        other => other.clone(),
    }
}

/// Log a failure with a redacted payload. Returns the request id so callers
/// can correlate the log line with what they show the user.
pub fn log_failure(context: &str, message: &str, payload: &Value) -> String {
    let request_id = uuid::Uuid::new_v4().to_string();
    let safe_payload = redact_value(payload);
    tracing::error!(
        request_id = %request_id,
        context = context,
        payload = %safe_payload,
        "{}",
        redact_text(message)
    );
    request_id
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        self.errors.join(" ")
    }
}

pub fn validate_message(content: &str, role: &str, max_length: usize) -> ValidationReport {
    let mut errors = Vec::new();

    if content.trim().is_empty() {
        errors.push("Message cannot be empty.".to_string());
    }
    if content.chars().count() > max_length {
        errors.push(format!("Message too long (max {} chars).", max_length));
    }
    if !ALLOWED_ROLES.contains(&role) {
        errors.push(format!(
            "Invalid role: {}. Allowed: {}.",
            role,
            ALLOWED_ROLES.join(", ")
        ));
    }

    ValidationReport { errors }
}
