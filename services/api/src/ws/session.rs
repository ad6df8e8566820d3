//! Runs one WebSocket connection as an orchestrated session.

use super::{
    peer::{TransportParams, WsTransport},
    protocol::WireMessage,
};
use crate::{handlers::ApiError, orchestrator::OfferOutcome, state::AppState};
use axum::{
    extract::{
        Path, Query, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use parley_core::ParleyError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Axum handler to upgrade an HTTP connection to a session WebSocket.
///
/// The query parameters describe the client's inbound media; the upgrade
/// itself is the session offer.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(webrtc_id): Path<String>,
    Query(params): Query<TransportParams>,
) -> Result<Response, ApiError> {
    params.validate().map_err(ApiError::BadRequest)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, webrtc_id, params)))
}

#[instrument(name = "ws_session", skip_all, fields(%webrtc_id))]
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    webrtc_id: String,
    params: TransportParams,
) {
    info!(tracks = %params.tracks, sample_rate = params.sample_rate, "New WebSocket offer");
    let (transport, handle) = WsTransport::new(params);
    let offer = transport.offer(webrtc_id);

    match state.orchestrator.handle_offer(offer, handle).await {
        Ok(OfferOutcome::Answer(_)) => {
            transport.run(socket).await;
            info!("WebSocket session finished");
        }
        Ok(OfferOutcome::Rejected(rejection)) => {
            WsTransport::refuse(socket, WireMessage::Rejected(rejection)).await;
        }
        Err(e) => {
            match &e {
                ParleyError::DuplicateSession(_) => warn!(error = %e, "Offer refused"),
                _ => error!(error = ?e, "Offer failed"),
            }
            WsTransport::refuse(
                socket,
                WireMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    }
}
