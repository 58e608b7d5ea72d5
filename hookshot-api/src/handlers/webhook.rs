use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use hookshot_common::event::NewEvent;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::app::AppState;
use crate::error::ApiError;

const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ReceiveResponse {
    pub status: String,
    pub event_id: i64,
    /// Number of deliveries created, filtered ones included.
    pub deliveries: usize,
}

/// Store an inbound webhook exactly as received and fan it out to every active destination.
pub async fn receive(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ReceiveResponse>, ApiError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    })?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let peer = connect_info.map(|ConnectInfo(address)| address);

    let mut event = NewEvent::new(body.to_vec(), content_type, &source_ip(&headers, peer));
    for (name, value) in headers.iter() {
        match value.to_str() {
            Ok(value) => event = event.with_header(name.as_str(), value),
            Err(_) => debug!("skipping non-ascii header {}", name),
        }
    }

    let event = state.store.insert_event(event).await?;
    metrics::counter!("hookshot_events_received_total").increment(1);
    info!(
        "received event {} ({} bytes) from {}",
        event.id,
        event.payload.len(),
        event.source_ip
    );

    let deliveries = state.dispatcher.dispatch_to_all_active(&event).await?;

    Ok(Json(ReceiveResponse {
        status: "received".to_owned(),
        event_id: event.id,
        deliveries: deliveries.len(),
    }))
}

/// The first `X-Forwarded-For` entry, else the peer address.
fn source_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .or_else(|| peer.map(|address| address.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_SOURCE.to_owned())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{self, Request},
    };
    use hookshot_common::delivery::DeliveryStatus;
    use hookshot_common::destination::{FilterOperator, FilterRule, NewDestination};
    use hookshot_common::store::Store;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use super::*;
    use crate::error::ErrorResponse;
    use crate::handlers::app::tests::{body_json, test_app, MAX_PAYLOAD_SIZE};

    #[tokio::test]
    async fn receive_stores_event_and_dispatches() {
        let mut app = test_app();
        let matching = app
            .store
            .insert_destination(
                NewDestination::new("orders", "https://example.com/orders").with_filter(
                    FilterRule::header("X-Api-Key", FilterOperator::Equals, Some("secret"))
                        .unwrap(),
                ),
            )
            .await
            .unwrap();
        app.store
            .insert_destination(
                NewDestination::new("billing", "https://example.com/billing").with_filter(
                    FilterRule::payload("type", FilterOperator::Equals, Some("invoice")).unwrap(),
                ),
            )
            .await
            .unwrap();

        let payload = r#"{"type":"order","id":  1}"#;
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/webhooks/receive")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .header("X-Api-Key", "secret")
                    .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: ReceiveResponse = body_json(response).await;
        assert_eq!(body.status, "received");
        assert_eq!(body.deliveries, 2);

        let event = app.store.get_event(body.event_id).await.unwrap().unwrap();
        assert_eq!(event.payload, payload.as_bytes());
        assert_eq!(event.content_type, "application/json");
        assert_eq!(event.source_ip, "203.0.113.7");
        assert_eq!(event.headers["HTTP_X_API_KEY"], "secret");
        assert_eq!(event.headers["CONTENT_TYPE"], "application/json");

        let deliveries = app.store.deliveries_for_event(event.id).await.unwrap();
        assert_eq!(deliveries[0].destination_id, matching.id);
        assert_eq!(deliveries[0].status, DeliveryStatus::Pending);
        assert_eq!(deliveries[1].status, DeliveryStatus::Filtered);
        assert_eq!(app.receiver.try_recv(), Some(deliveries[0].id));
        assert_eq!(app.receiver.try_recv(), None);
    }

    #[tokio::test]
    async fn receive_defaults() {
        let app = test_app();

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/webhooks/receive")
                    .body(Body::from("raw bytes"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: ReceiveResponse = body_json(response).await;
        assert_eq!(body.deliveries, 0);

        let event = app.store.get_event(body.event_id).await.unwrap().unwrap();
        assert_eq!(event.content_type, "application/octet-stream");
        assert_eq!(event.source_ip, "unknown");
    }

    #[tokio::test]
    async fn receive_rejects_oversized_payload() {
        let app = test_app();

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/webhooks/receive")
                    .body(Body::from("x".repeat(MAX_PAYLOAD_SIZE + 1)))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.error, "Payload too large");
        assert!(app.store.get_event(1).await.unwrap().is_none());
    }

    #[test]
    fn source_ip_falls_back_to_peer() {
        let peer: SocketAddr = "192.0.2.10:5000".parse().unwrap();
        let mut headers = HeaderMap::new();

        assert_eq!(source_ip(&headers, Some(peer)), "192.0.2.10");
        assert_eq!(source_ip(&headers, None), "unknown");

        headers.insert(FORWARDED_FOR, "  ".parse().unwrap());
        assert_eq!(source_ip(&headers, Some(peer)), "192.0.2.10");

        headers.insert(FORWARDED_FOR, "198.51.100.1".parse().unwrap());
        assert_eq!(source_ip(&headers, Some(peer)), "198.51.100.1");
    }
}
