//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::app::AppState;
use crate::http::auth::verify_token;
use crate::room::AdmissionError;
use crate::ws::protocol::{encode, WsResp};
use crate::ws::session::{close_socket, WsSession};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub auth_token: String,
    pub player_id: i32,
    pub species_id: i32,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify the token before upgrading, the room layer never sees rejected players
    match verify_token(&query.auth_token, query.player_id, &state.config.auth_token_secret) {
        Ok(_) => {
            info!(player_id = query.player_id, "WebSocket upgrade for authenticated player");
            ws.on_upgrade(move |socket| {
                handle_socket(socket, query.player_id, query.species_id, state)
            })
        }
        Err(e) => {
            warn!(player_id = query.player_id, error = %e, "WebSocket auth failed");
            e.into_response()
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, player_id: i32, species_id: i32, state: AppState) {
    let (session, link) = WsSession::new(player_id);
    info!(session_id = %session.id, player_id, "New WebSocket connection");

    let Some(room) = state.room_manager.pop() else {
        warn!(player_id, "No available room");
        reject(socket, AdmissionError::NoRoomAvailable).await;
        return;
    };
    let admission = room.add_player_if_possible(player_id, species_id, link);
    state.room_manager.push(room.clone());

    let join_index = match admission {
        Ok(join_index) => join_index,
        Err(e) => {
            warn!(room_id = room.id(), player_id, error = %e, "Failed to add player to room");
            reject(socket, e).await;
            return;
        }
    };
    info!(room_id = room.id(), player_id, join_index, "Added player to room");

    let initial = WsResp::battle_collider_info(room.battle_collider_info(), join_index);
    let (ws_sink, close) = session.run(socket, initial).await;

    room.on_player_disconnected(player_id);
    if let Some(ws_sink) = ws_sink {
        close_socket(ws_sink, close).await;
    }

    info!(room_id = room.id(), player_id, "WebSocket connection closed");
}

/// Tell the client why it was not seated, then close
async fn reject(mut socket: WebSocket, err: AdmissionError) {
    if let Ok(bytes) = encode(&WsResp::error(err.err_code())) {
        let _ = socket.send(Message::Binary(bytes)).await;
    }
    let _ = socket.close().await;
}
