//! Axum Handlers for the REST API
//!
//! Session inputs, side-output streams and a live-session listing. The media
//! itself flows over the WebSocket transport in [`crate::ws`].

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::StreamExt;
use parley_core::QueueRead;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

use crate::{
    models::{ErrorResponse, InputPayload, LatestOutputQuery, OutputPayload, SessionInfo},
    orchestrator::OUTPUT_READ_TIMEOUT,
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn session_not_found(webrtc_id: &str) -> ApiError {
    ApiError::NotFound(format!("Session {webrtc_id} not found"))
}

/// Deliver auxiliary inputs to a live session's reply function.
#[utoipa::path(
    post,
    path = "/input/{webrtc_id}",
    request_body = InputPayload,
    responses(
        (status = 204, description = "Inputs delivered"),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("webrtc_id" = String, Path, description = "The session's WebRTC id")
    )
)]
pub async fn set_input(
    State(state): State<Arc<AppState>>,
    Path(webrtc_id): Path<String>,
    Json(payload): Json<InputPayload>,
) -> Result<StatusCode, ApiError> {
    if state.orchestrator.set_input(&webrtc_id, payload.args) {
        debug!(%webrtc_id, "Inputs delivered");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(session_not_found(&webrtc_id))
    }
}

/// Stream a session's additional outputs as Server-Sent Events.
///
/// Each event is named `output` and carries the output values as a JSON
/// array. The stream ends when the session is cleaned up.
#[utoipa::path(
    get,
    path = "/outputs/{webrtc_id}",
    responses(
        (status = 200, description = "Event stream of additional outputs", content_type = "text/event-stream"),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("webrtc_id" = String, Path, description = "The session's WebRTC id")
    )
)]
pub async fn output_stream(
    State(state): State<Arc<AppState>>,
    Path(webrtc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outputs = state
        .orchestrator
        .output_stream(&webrtc_id)
        .ok_or_else(|| session_not_found(&webrtc_id))?;
    let events = outputs.map(|outputs| Event::default().event("output").json_data(outputs.args()));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Read the next additional output of a session, waiting up to `timeout_ms`.
///
/// Returns `204 No Content` when nothing arrived in time.
#[utoipa::path(
    get,
    path = "/outputs/{webrtc_id}/latest",
    responses(
        (status = 200, description = "The output values", body = OutputPayload),
        (status = 204, description = "No output before the timeout"),
        (status = 404, description = "Session not found or closed", body = ErrorResponse)
    ),
    params(
        ("webrtc_id" = String, Path, description = "The session's WebRTC id"),
        LatestOutputQuery
    )
)]
pub async fn latest_output(
    State(state): State<Arc<AppState>>,
    Path(webrtc_id): Path<String>,
    Query(query): Query<LatestOutputQuery>,
) -> Result<Response, ApiError> {
    let timeout = query
        .timeout_ms
        .map_or(OUTPUT_READ_TIMEOUT, Duration::from_millis)
        .min(OUTPUT_READ_TIMEOUT);
    match state
        .orchestrator
        .fetch_latest_output(&webrtc_id, timeout)
        .await
    {
        Some(QueueRead::Item(outputs)) => Ok(Json(OutputPayload {
            args: outputs.args().to_vec(),
        })
        .into_response()),
        Some(QueueRead::Empty) => Ok(StatusCode::NO_CONTENT.into_response()),
        Some(QueueRead::Closed) | None => Err(session_not_found(&webrtc_id)),
    }
}

/// List live sessions, oldest first.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Live sessions", body = [SessionInfo])
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.orchestrator.sessions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn test_not_found_response() {
        let response = session_not_found("abc").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "Session abc not found");
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let response = ApiError::from(anyhow::anyhow!("secret detail")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("secret"));
    }
}
