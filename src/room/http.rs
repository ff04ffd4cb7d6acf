//! HTTP and WebSocket surface for the room service (§6).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tower_http::cors::{Any, CorsLayer};

use crate::room::service::RoomRegistry;
use crate::types::{is_valid_room_id, Frontier, RoomId};
use crate::wire::{self, C_AWARENESS, C_UPDATE, C_VERSION_VECTOR};

#[derive(Clone)]
pub struct AppState {
    pub rooms: RoomRegistry,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods([Method::GET]);
    Router::new()
        .route("/rooms/:room_id/snapshot", get(get_snapshot))
        .route("/rooms/:room_id/history", get(get_history))
        .route("/rooms/:room_id/ws", get(upgrade_ws))
        .layer(cors)
        .layer(middleware::from_fn(preflight_no_content))
        .with_state(Arc::new(state))
}

/// `tower_http`'s `CorsLayer` answers a preflight `OPTIONS` with 200; §6
/// requires 204. Rewrite just that one response rather than hand-rolling
/// the rest of what `CorsLayer` already gets right.
async fn preflight_no_content(req: Request, next: Next) -> Response {
    let is_preflight = req.method() == Method::OPTIONS;
    let mut response = next.run(req).await;
    if is_preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

fn validate_room(room_id: &RoomId) -> Result<(), Response> {
    if is_valid_room_id(room_id) {
        Ok(())
    } else {
        Err((StatusCode::NOT_FOUND, "invalid room id").into_response())
    }
}

async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = validate_room(&room_id) {
        return resp;
    }

    let at = match params.get("at") {
        Some(raw) => match Frontier::parse(raw) {
            Ok(frontier) => Some(frontier),
            Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        },
        None => None,
    };

    let room = match state.rooms.ensure_room(&room_id).await {
        Ok(room) => room,
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    };

    match room.snapshot(at).await {
        Ok(bytes) => ([("content-type", "application/octet-stream")], bytes).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn get_history(State(state): State<Arc<AppState>>, Path(room_id): Path<RoomId>) -> Response {
    if let Err(resp) = validate_room(&room_id) {
        return resp;
    }
    let room = match state.rooms.ensure_room(&room_id).await {
        Ok(room) => room,
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    };
    axum::Json(room.history().await).into_response()
}

async fn upgrade_ws(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = validate_room(&room_id) {
        return resp;
    }
    let room = match state.rooms.ensure_room(&room_id).await {
        Ok(room) => room,
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, room))
}

async fn handle_socket(socket: WebSocket, room: crate::room::service::RoomHandle) {
    let (mut sink, mut stream) = socket.split();
    let (peer_id, mut outbound) = room.connect().await;

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let bytes = match message {
            Message::Binary(b) => b,
            Message::Close(_) => break,
            _ => continue,
        };
        let frame = match wire::decode_message(&bytes) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        match frame.tag {
            C_UPDATE => room.update(peer_id, frame.payload).await,
            C_VERSION_VECTOR => room.version_vector(peer_id, frame.payload).await,
            C_AWARENESS => room.awareness(peer_id, frame.payload).await,
            _ => {}
        }
    }

    room.disconnect(peer_id).await;
    send_task.abort();
}
