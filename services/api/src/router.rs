//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{ErrorResponse, InputPayload, OutputPayload, SessionInfo},
    state::AppState,
    transport::ConnectionState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::set_input,
        handlers::output_stream,
        handlers::latest_output,
        handlers::list_sessions,
    ),
    components(
        schemas(SessionInfo, InputPayload, OutputPayload, ErrorResponse, ConnectionState)
    ),
    tags(
        (name = "Parley API", description = "Session inputs and outputs for turn-taking voice sessions")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route("/input/{webrtc_id}", post(handlers::set_input))
        .route("/outputs/{webrtc_id}", get(handlers::output_stream))
        .route("/outputs/{webrtc_id}/latest", get(handlers::latest_output))
        .route("/ws/{webrtc_id}", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
