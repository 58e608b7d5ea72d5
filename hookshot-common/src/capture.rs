//! # Capture
//!
//! Best-effort error capture for the parts of the service that sit around the delivery
//! pipeline. Errors travel as plain data in an `ErrorEnvelope` and are deduplicated by a
//! fingerprint of their kind and normalized message. Reporting never fails and never blocks.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{error, warn};

const SENSITIVE_KEYS: [&str; 5] = ["password", "token", "secret", "authorization", "api_key"];
const REDACTED: &str = "[REDACTED]";
const MAX_CONTEXT_SIZE: usize = 10_240;
const MAX_STRING_LENGTH: usize = 1_000;
const TRUNCATED_SUFFIX: &str = "... [truncated]";

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("uuid pattern is valid")
});
static HEX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("hex pattern is valid"));
static TMP_PATH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/tmp/[^\s]+").expect("tmp path pattern is valid"));
static NUMBER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+").expect("number pattern is valid"));

/// An error as data.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
    pub stack: Vec<String>,
    pub context: Value,
}

impl ErrorEnvelope {
    pub fn new(kind: &str, message: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            message: message.to_owned(),
            stack: Vec::new(),
            context: Value::Object(Map::new()),
        }
    }

    /// Capture an error, its type name as kind and its chain of sources as stack.
    pub fn from_error<E: std::error::Error + 'static>(error: &E) -> Self {
        let mut stack = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = cause.source();
        }

        Self {
            kind: std::any::type_name::<E>().to_owned(),
            message: error.to_string(),
            stack,
            context: Value::Object(Map::new()),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Identifies errors that only differ by ids, addresses or temporary paths.
    pub fn fingerprint(&self) -> String {
        let normalized = normalize_message(&self.message);
        let digest = Sha256::digest(format!("{}:{}", self.kind, normalized).as_bytes());
        format!("{:x}", digest)
    }
}

fn normalize_message(message: &str) -> String {
    let message = UUID_PATTERN.replace_all(message, "UUID");
    let message = HEX_PATTERN.replace_all(&message, "0xHEX");
    let message = TMP_PATH_PATTERN.replace_all(&message, "/tmp/PATH");
    NUMBER_PATTERN.replace_all(&message, "N").into_owned()
}

/// Redact sensitive keys and cut long strings, then bound the overall size.
pub fn sanitize_context(context: &Value) -> Value {
    let sanitized = sanitize_value(context);

    match serde_json::to_string(&sanitized) {
        Ok(serialized) if serialized.len() > MAX_CONTEXT_SIZE => {
            let mut end = MAX_CONTEXT_SIZE;
            while !serialized.is_char_boundary(end) {
                end -= 1;
            }
            serde_json::json!({
                "truncated": true,
                "preview": &serialized[..end],
            })
        }
        Ok(_) => sanitized,
        Err(_) => Value::Null,
    }
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let lowered = key.to_lowercase();
                    if SENSITIVE_KEYS.iter().any(|s| lowered.contains(s)) {
                        (key.clone(), Value::String(REDACTED.to_owned()))
                    } else {
                        (key.clone(), sanitize_value(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::String(s) if s.len() > MAX_STRING_LENGTH => {
            let mut end = MAX_STRING_LENGTH;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            Value::String(format!("{}{}", &s[..end], TRUNCATED_SUFFIX))
        }
        other => other.clone(),
    }
}

/// Cheap, cloneable handle used to report errors.
#[derive(Clone)]
pub struct ErrorReporter {
    sender: mpsc::Sender<ErrorEnvelope>,
}

impl ErrorReporter {
    /// Queue an envelope for capture. Drops it with a warning if the buffer is full.
    pub fn report(&self, envelope: ErrorEnvelope) {
        error!(kind = %envelope.kind, "{}", envelope.message);

        if let Err(err) = self.sender.try_send(envelope) {
            warn!("dropped captured error: {}", err);
            metrics::counter!("hookshot_captured_errors_dropped_total").increment(1);
        }
    }

    /// A reporter whose envelopes go nowhere. Useful in tests.
    pub fn noop() -> Self {
        let (sender, _) = mpsc::channel(1);
        Self { sender }
    }
}

/// A deduplicated error.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub fingerprint: String,
    pub kind: String,
    pub message: String,
    pub stack: Vec<String>,
    pub context: Value,
    pub occurrences: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Receives envelopes from `ErrorReporter`s and keeps one record per fingerprint.
#[derive(Clone, Default)]
pub struct ErrorCapture {
    records: Arc<RwLock<HashMap<String, ErrorRecord>>>,
}

impl ErrorCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the task draining reported envelopes and return the reporter feeding it.
    pub fn spawn(&self, buffer: usize) -> ErrorReporter {
        let (sender, mut receiver) = mpsc::channel::<ErrorEnvelope>(buffer.max(1));
        let capture = self.clone();

        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                capture.record(envelope, Utc::now());
            }
        });

        ErrorReporter { sender }
    }

    pub fn record(&self, envelope: ErrorEnvelope, now: DateTime<Utc>) {
        let fingerprint = envelope.fingerprint();
        let context = sanitize_context(&envelope.context);

        let Ok(mut records) = self.records.write() else {
            warn!("poisoned ErrorCapture lock");
            return;
        };

        records
            .entry(fingerprint.clone())
            .and_modify(|record| {
                record.occurrences += 1;
                record.last_seen_at = now;
                record.message = envelope.message.clone();
                record.context = context.clone();
            })
            .or_insert_with(|| ErrorRecord {
                fingerprint,
                kind: envelope.kind.clone(),
                message: envelope.message.clone(),
                stack: envelope.stack.clone(),
                context,
                occurrences: 1,
                first_seen_at: now,
                last_seen_at: now,
            });
    }

    /// Every record, most recently seen first.
    pub fn records(&self) -> Vec<ErrorRecord> {
        let mut records: Vec<ErrorRecord> = match self.records.read() {
            Ok(records) => records.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        records.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        records
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn test_fingerprint_ignores_variable_parts() {
        let a = ErrorEnvelope::new("StoreError", "delivery 12 not found at 0xdeadbeef");
        let b = ErrorEnvelope::new("StoreError", "delivery 9931 not found at 0x1f");
        let c = ErrorEnvelope::new("ApiError", "delivery 12 not found at 0xdeadbeef");

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(
            normalize_message("event 1b4e28ba-2fa1-11d2-883f-0016d3cca427 in /tmp/abc/def.json"),
            "event UUID in /tmp/PATH"
        );
    }

    #[test]
    fn test_from_error_collects_sources() {
        let error = Outer {
            inner: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        };
        let envelope = ErrorEnvelope::from_error(&error);

        assert!(envelope.kind.ends_with("Outer"));
        assert_eq!(envelope.message, "outer failure");
        assert_eq!(envelope.stack, vec!["disk on fire".to_owned()]);
    }

    #[test]
    fn test_sanitize_context() {
        let context = json!({
            "path": "/webhooks/receive",
            "Authorization": "Bearer abc",
            "nested": {"db_password": "hunter2", "items": ["x".repeat(1_500)]},
        });
        let sanitized = sanitize_context(&context);

        assert_eq!(sanitized["path"], "/webhooks/receive");
        assert_eq!(sanitized["Authorization"], REDACTED);
        assert_eq!(sanitized["nested"]["db_password"], REDACTED);
        let item = sanitized["nested"]["items"][0].as_str().unwrap();
        assert_eq!(item.len(), MAX_STRING_LENGTH + TRUNCATED_SUFFIX.len());

        let huge = json!({ "values": vec!["y".repeat(900); 20] });
        let sanitized = sanitize_context(&huge);
        assert_eq!(sanitized["truncated"], true);
    }

    #[test]
    fn test_record_deduplicates() {
        let capture = ErrorCapture::new();
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(5);

        capture.record(ErrorEnvelope::new("SweepError", "query 1 failed"), first);
        capture.record(ErrorEnvelope::new("SweepError", "query 2 failed"), later);
        capture.record(ErrorEnvelope::new("CleanupError", "boom"), first);

        let records = capture.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, "SweepError");
        assert_eq!(records[0].occurrences, 2);
        assert_eq!(records[0].first_seen_at, first);
        assert_eq!(records[0].last_seen_at, later);
        assert_eq!(records[0].message, "query 2 failed");
    }

    #[tokio::test]
    async fn test_reporter_feeds_capture() {
        let capture = ErrorCapture::new();
        let reporter = capture.spawn(8);

        reporter.report(ErrorEnvelope::new("ApiError", "storage unavailable"));

        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
        while capture.records().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        assert_eq!(capture.records().len(), 1);

        // A reporter with nobody listening swallows the envelope.
        ErrorReporter::noop().report(ErrorEnvelope::new("ApiError", "ignored"));
    }
}
