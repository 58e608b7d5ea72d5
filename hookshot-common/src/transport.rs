//! # Transport
//!
//! Outbound HTTP calls to destinations. A call never returns an error: every outcome,
//! including timeouts and refused connections, is folded into a `TransportResult`.
use std::collections::HashMap;
use std::time;

use async_trait::async_trait;
use reqwest::header;
use serde::Serialize;

/// Response bodies are kept up to this many bytes.
pub const MAX_RESPONSE_BODY: usize = 10_000;
const TRUNCATION_MARKER: &str = "...";

/// A single POST to perform.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// Applies to connecting and to reading the response.
    pub timeout: time::Duration,
}

/// What came back from a destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransportResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub body: Option<String>,
    pub error: Option<String>,
}

impl TransportResult {
    /// A failure that happened before any HTTP response was received.
    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            status_code: None,
            body: None,
            error: Some(error.to_owned()),
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code.is_some_and(|code| (400..500).contains(&code))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: OutboundRequest) -> TransportResult;
}

/// `Transport` backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: OutboundRequest) -> TransportResult {
        let headers: header::HeaderMap = match (&request.headers).try_into() {
            Ok(headers) => headers,
            Err(error) => return TransportResult::failure(&format!("Invalid headers: {}", error)),
        };

        let response = match self
            .client
            .post(&request.url)
            .headers(headers)
            .timeout(request.timeout)
            .body(request.body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return TransportResult::failure(&describe_error(&error)),
        };

        let status = response.status();
        let body = match first_n_bytes_of_response(response, MAX_RESPONSE_BODY).await {
            Ok(body) => body,
            Err(error) => return TransportResult::failure(&describe_error(&error)),
        };

        TransportResult {
            success: status.is_success(),
            status_code: Some(status.as_u16()),
            body,
            error: if status.is_success() {
                None
            } else {
                Some(format!("HTTP {}", status))
            },
        }
    }
}

/// Distinguish timeouts and connection failures from every other transport error.
fn describe_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        format!("Timeout: {}", error)
    } else if error.is_connect() {
        format!("Connection error: {}", error)
    } else {
        error.to_string()
    }
}

/// Read the response body, stopping once more than `n` bytes have arrived.
/// Returns `None` for an empty body.
async fn first_n_bytes_of_response(
    mut response: reqwest::Response,
    n: usize,
) -> reqwest::Result<Option<String>> {
    let mut buffer: Vec<u8> = Vec::with_capacity(n.min(8 * 1024));

    while let Some(chunk) = response.chunk().await? {
        buffer.extend_from_slice(&chunk);
        if buffer.len() > n {
            break;
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }

    Ok(Some(truncate_body(&String::from_utf8_lossy(&buffer), n)))
}

/// Cut `body` to at most `n` bytes on a char boundary, appending `...` when something was cut.
pub fn truncate_body(body: &str, n: usize) -> String {
    if body.len() <= n {
        return body.to_owned();
    }

    let mut end = n;
    while !body.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}{}", &body[..end], TRUNCATION_MARKER)
}
