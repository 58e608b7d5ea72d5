//! # Event
//!
//! Inbound webhook events as captured by the ingestion endpoint. Events are never mutated
//! once stored.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix applied to request header names when they are stored on an `Event`.
pub const TRANSPORT_HEADER_PREFIX: &str = "HTTP_";

/// Content type recorded when the sender did not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// An event as received by the ingestion endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub source_ip: String,
    pub received_at: DateTime<Utc>,
}

/// An event that has not been persisted yet.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub source_ip: String,
    pub received_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(payload: Vec<u8>, content_type: Option<&str>, source_ip: &str) -> Self {
        Self {
            headers: HashMap::new(),
            payload,
            content_type: content_type
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_owned(),
            source_ip: source_ip.to_owned(),
            received_at: Utc::now(),
        }
    }

    /// Record a request header under its stored name. Repeated names keep the last value.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        drop(self
            .headers
            .insert(stored_header_name(name), value.to_owned()));
        self
    }
}

/// Uppercase a header name and replace dashes with underscores: `X-Api-Key` becomes `X_API_KEY`.
pub fn normalize_header_name(name: &str) -> String {
    name.to_ascii_uppercase().replace('-', "_")
}

/// Name under which a request header is stored.
///
/// `Content-Type` and `Content-Length` keep their bare normalized form, every other header is
/// prefixed with `HTTP_`.
pub fn stored_header_name(name: &str) -> String {
    let normalized = normalize_header_name(name);
    match normalized.as_str() {
        "CONTENT_TYPE" | "CONTENT_LENGTH" => normalized,
        _ => format!("{}{}", TRANSPORT_HEADER_PREFIX, normalized),
    }
}
