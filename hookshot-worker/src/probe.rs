//! Synchronous test calls an operator can make against a destination.
use chrono::{DateTime, Utc};
use hookshot_common::destination::Destination;
use hookshot_common::transport::{OutboundRequest, Transport, TransportResult};
use serde::Serialize;

pub const TEST_EVENT: &str = "hookshot.test";
pub const TEST_MESSAGE: &str = "This is a test webhook from Hookshot";

#[derive(Debug, Serialize)]
pub struct TestPayload {
    pub event: &'static str,
    pub timestamp: String,
    pub message: &'static str,
}

impl TestPayload {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            event: TEST_EVENT,
            timestamp: now.to_rfc3339(),
            message: TEST_MESSAGE,
        }
    }
}

/// POST a test payload to `destination` and report what came back. No delivery is recorded.
pub async fn test_destination(
    transport: &dyn Transport,
    destination: &Destination,
) -> TransportResult {
    let body = match serde_json::to_vec(&TestPayload::new(Utc::now())) {
        Ok(body) => body,
        Err(error) => return TransportResult::failure(&error.to_string()),
    };

    let mut headers = destination.custom_headers.clone();
    headers.retain(|name, _| {
        !name.eq_ignore_ascii_case("content-type") && !name.eq_ignore_ascii_case("x-hookshot-test")
    });
    drop(headers.insert("Content-Type".to_owned(), "application/json".to_owned()));
    drop(headers.insert("X-Hookshot-Test".to_owned(), "true".to_owned()));

    transport
        .post(OutboundRequest {
            url: destination.url.clone(),
            body,
            headers,
            timeout: destination.timeout(),
        })
        .await
}
