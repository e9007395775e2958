//! Direct LAN WebSocket endpoint.
//!
//! `GET /ws?token=<auth_key>&device_id=<id>` — same protocol as the tunnel
//! path, for clients on the workstation's own network and for tests. The
//! token is validated before the upgrade completes; the `auth` frame is
//! still required afterwards to reach authenticated state, mirroring the
//! tunnel handshake.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use tiflis_protocol::{codec, ErrorPayload, Outbound, ServerMessage};

use crate::state::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// Auth key as a query parameter (browsers can't set headers on
    /// WebSocket upgrades).
    pub token: String,
    /// Process-stable client identity.
    pub device_id: String,
}

/// `GET /ws?token=<key>&device_id=<id>` — WebSocket upgrade handler.
///
/// Returns `403 Forbidden` when the token doesn't match.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::verify_key(
        state.config.auth.auth_key.as_bytes(),
        query.token.as_bytes(),
    ) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.device_id))
}

/// Per-connection loop: pump the device's fan-out queue into the socket and
/// dispatch inbound frames.
async fn handle_socket(socket: axum::extract::ws::WebSocket, state: AppState, device_id: String) {
    info!("Device {device_id} connected (local)");
    let (mut ws_sink, mut ws_stream) = socket.split();

    state.devices.register(&device_id).await;
    let mut outbound_rx = state.router.register_device(&device_id).await;

    // Pump: router queue → socket. Ends when the sink is dropped (device
    // unregistered or replaced) or the socket dies.
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match codec::encode_outbound(&frame) {
                Ok(t) => t,
                Err(e) => {
                    debug!("Encode failed: {e}");
                    continue;
                }
            };
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            axum::extract::ws::Message::Text(text) => {
                match codec::decode_inbound(&text) {
                    Ok(mut frame) => {
                        // The local transport is its own trust boundary: the
                        // verified query identity wins over anything inside
                        // the envelope.
                        frame.device_id = Some(device_id.clone());
                        crate::ws::handle_frame(&state, &device_id, frame).await;
                    }
                    Err(payload) => {
                        send_decode_error(&state, &device_id, payload).await;
                    }
                }
            }
            axum::extract::ws::Message::Close(_) => break,
            _ => {}
        }
    }

    info!("Device {device_id} disconnected (local)");
    state.router.unregister_device(&device_id).await;
    state.devices.remove(&device_id).await;
    send_task.abort();
}

async fn send_decode_error(state: &AppState, device_id: &str, payload: ErrorPayload) {
    state
        .router
        .send_to_device(
            device_id,
            Outbound::new(ServerMessage::Error {
                payload,
                session_id: None,
            }),
        )
        .await;
}
