use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing, Json, Router,
};
use chrono::{SecondsFormat, Utc};
use hookshot_common::capture::{ErrorEnvelope, ErrorReporter};
use hookshot_common::health::{HealthRegistry, HealthStatus};
use hookshot_common::store::Store;
use hookshot_common::transport::Transport;
use hookshot_worker::dispatcher::Dispatcher;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::{admin, webhook};

/// Everything the handlers share. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Dispatcher,
    pub transport: Arc<dyn Transport>,
    pub liveness: HealthRegistry,
    pub reporter: ErrorReporter,
}

pub fn add_routes(router: Router, state: AppState, max_payload_size: usize) -> Router {
    let reporter = state.reporter.clone();

    let routes = Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(liveness))
        .route("/health", routing::get(health))
        .route(
            "/webhooks/receive",
            routing::post(webhook::receive).layer(DefaultBodyLimit::max(max_payload_size)),
        )
        .route("/admin/events/:id/replay", routing::post(admin::replay_event))
        .route(
            "/admin/deliveries/:id/retry",
            routing::post(admin::retry_delivery),
        )
        .route(
            "/admin/destinations/:id/test",
            routing::post(admin::test_destination),
        )
        .with_state(state)
        .layer(middleware::from_fn_with_state(reporter, capture_errors))
        .layer(TraceLayer::new_for_http());

    router.merge(routes)
}

pub async fn index() -> &'static str {
    "hookshot"
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub database: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_owned(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        database: state.store.ping().await.is_ok(),
    })
}

/// Forward the error envelopes attached to server error responses to error capture.
async fn capture_errors(
    State(reporter): State<ErrorReporter>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_owned();

    let mut response = next.run(req).await;

    if let Some(envelope) = response.extensions_mut().remove::<ErrorEnvelope>() {
        reporter.report(envelope.with_context(serde_json::json!({
            "method": method,
            "path": path,
            "status": response.status().as_u16(),
        })));
    }

    response
}
