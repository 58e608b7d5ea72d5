use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use hookshot_common::delivery::Delivery;
use hookshot_common::transport::TransportResult;
use hookshot_worker::probe;
use serde::Serialize;
use tracing::info;

use super::app::AppState;
use crate::error::ApiError;

#[derive(Serialize, Debug)]
pub struct ReplayResponse {
    pub event_id: i64,
    pub deliveries: Vec<Delivery>,
}

pub async fn replay_event(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let deliveries = state.dispatcher.replay(event_id).await?;

    Ok(Json(ReplayResponse {
        event_id,
        deliveries,
    }))
}

pub async fn retry_delivery(
    State(state): State<AppState>,
    Path(delivery_id): Path<i64>,
) -> Result<(StatusCode, Json<Delivery>), ApiError> {
    let delivery = state.dispatcher.retry_delivery(delivery_id).await?;

    Ok((StatusCode::ACCEPTED, Json(delivery)))
}

/// POST a test payload to a destination and return what it answered.
pub async fn test_destination(
    State(state): State<AppState>,
    Path(destination_id): Path<i64>,
) -> Result<Json<TransportResult>, ApiError> {
    let destination = state
        .store
        .get_destination(destination_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("destination {} not found", destination_id)))?;

    let result = probe::test_destination(state.transport.as_ref(), &destination).await;
    info!(
        "test call to destination {} finished with success={} status={:?}",
        destination_id, result.success, result.status_code
    );

    Ok(Json(result))
}
