mod config;
mod error;
mod lobby;
mod session;
mod store;
mod tournament;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tower_http::services::ServeDir;

use crate::lobby::LobbyHandle;
use crate::session::{SessionCommand, SessionEvent, SessionHandle, SessionRegistry};
use crate::store::{MemoryStore, RoomStore};
use crate::tournament::BracketEngine;
use crate::types::*;

#[derive(Clone)]
struct AppState {
    registry: Arc<SessionRegistry>,
    bracket: Arc<BracketEngine>,
    store: Arc<MemoryStore>,
    lobby: LobbyHandle,
}

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

async fn send_json<T: serde::Serialize>(sender: &WsSender, msg: &T) -> bool {
    if let Ok(json) = serde_json::to_string(msg) {
        let mut s = sender.lock().await;
        if s.send(Message::Text(json.into())).await.is_err() {
            return false;
        }
    }
    true
}

// ─── Game socket ──────────────────────────────────────────────────

async fn game_ws_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Identity is established upstream; here it arrives as query parameters.
    let Some(user_id) = params.get("userId").cloned().filter(|s| !s.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let username = params
        .get("username")
        .cloned()
        .unwrap_or_else(|| user_id.clone());

    ws.on_upgrade(move |socket| handle_game_socket(socket, state, room, user_id, username))
        .into_response()
}

async fn handle_game_socket(
    socket: WebSocket,
    state: AppState,
    room: String,
    user_id: String,
    username: String,
) {
    let (sender, mut receiver) = socket.split();
    let sender: WsSender = Arc::new(Mutex::new(sender));

    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("Game socket connected: {} user: {} room: {}", conn_id, user_id, room);

    let handle = match state.registry.get_or_create(&room) {
        Ok(handle) => handle,
        Err(err) => {
            send_json(
                &sender,
                &ServerMsg::Error {
                    message: err.to_string(),
                },
            )
            .await;
            return;
        }
    };

    // Forward session events to this socket, filtered by connection id.
    let mut event_rx = handle.event_tx.subscribe();
    let sender_clone = sender.clone();
    let conn = conn_id.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => match event {
                    SessionEvent::Broadcast { msg } => {
                        if !send_json(&sender_clone, &msg).await {
                            return;
                        }
                    }
                    SessionEvent::SendTo { conn_id, msg } if conn_id == conn => {
                        if !send_json(&sender_clone, &msg).await {
                            return;
                        }
                    }
                    SessionEvent::CloseConn { conn_id } if conn_id == conn => {
                        let mut s = sender_clone.lock().await;
                        let _ = s.send(Message::Close(None)).await;
                        return;
                    }
                    _ => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let _ = handle
        .cmd_tx
        .send(SessionCommand::Join {
            conn_id: conn_id.clone(),
            user_id: user_id.clone(),
            username,
        })
        .await;

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };

        let client_msg: ClientMsg = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid game message: {}", e);
                continue;
            }
        };

        let cmd = match client_msg {
            ClientMsg::PaddleMove { position, rotation } => SessionCommand::PaddleMove {
                conn_id: conn_id.clone(),
                position,
                rotation,
            },
            ClientMsg::PlayerReady => SessionCommand::Ready {
                conn_id: conn_id.clone(),
            },
            ClientMsg::StartGame => SessionCommand::Start {
                conn_id: conn_id.clone(),
            },
            ClientMsg::UpdateScore { side } => SessionCommand::UpdateScore {
                conn_id: conn_id.clone(),
                side,
            },
            ClientMsg::SetBallVelocity { x, y } => SessionCommand::SetBallVelocity {
                conn_id: conn_id.clone(),
                x,
                y,
            },
            ClientMsg::ResetRound {
                last_winner,
                last_loser,
            } => SessionCommand::ResetRound {
                conn_id: conn_id.clone(),
                last_winner,
                last_loser,
            },
            ClientMsg::GameOver => SessionCommand::EndGame {
                conn_id: conn_id.clone(),
            },
        };

        if handle.cmd_tx.send(cmd).await.is_err() {
            // Session ended underneath us.
            break;
        }
    }

    // A dropped socket is the common way games end; it always becomes a leave.
    tracing::info!("Game socket disconnected: {} room: {}", conn_id, handle.room);
    event_task.abort();
    let _ = handle
        .cmd_tx
        .send(SessionCommand::Disconnect { conn_id })
        .await;
}

// ─── Lobby socket ─────────────────────────────────────────────────

async fn lobby_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user_id = params.get("userId").cloned().unwrap_or_default();
    let username = params
        .get("username")
        .cloned()
        .unwrap_or_else(|| user_id.clone());
    ws.on_upgrade(move |socket| handle_lobby_socket(socket, state, user_id, username))
}

async fn handle_lobby_socket(
    socket: WebSocket,
    state: AppState,
    user_id: String,
    username: String,
) {
    let (sender, mut receiver) = socket.split();
    let sender: WsSender = Arc::new(Mutex::new(sender));
    tracing::info!("Lobby socket connected");

    // Subscribe before the snapshots so no event lands in the gap.
    let mut lobby_rx = state.lobby.subscribe();

    send_json(
        &sender,
        &LobbyMsg::RoomList {
            rooms: state.store.available_rooms(),
        },
    )
    .await;
    send_json(
        &sender,
        &LobbyMsg::TournamentList {
            tournaments: state.bracket.snapshot_all().await,
        },
    )
    .await;
    let sender_clone = sender.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match lobby_rx.recv().await {
                Ok(msg) => {
                    if !send_json(&sender_clone, &msg).await {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };

        let client_msg: LobbyClientMsg = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid lobby message: {}", e);
                continue;
            }
        };

        match client_msg {
            LobbyClientMsg::CreateRoom { name, config } => {
                match state.store.create_room(&name, config, None) {
                    Ok(()) => {
                        if let Ok(room) = state.store.room_summary(&name) {
                            state.lobby.send(LobbyMsg::RoomCreated { room });
                        }
                        tracing::info!("Room {} created", name);
                    }
                    Err(err) => {
                        send_json(
                            &sender,
                            &LobbyMsg::Error {
                                message: err.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
            LobbyClientMsg::CreateTournament {
                name,
                max_participants,
            } => {
                let result = if user_id.is_empty() {
                    Err("identity required".to_string())
                } else {
                    state
                        .bracket
                        .create(&name, max_participants, &username)
                        .map_err(|e| e.to_string())
                };
                if let Err(message) = result {
                    send_json(&sender, &LobbyMsg::Error { message }).await;
                }
            }
            LobbyClientMsg::JoinTournament { name } => {
                let result = if user_id.is_empty() {
                    Err("identity required".to_string())
                } else {
                    state
                        .bracket
                        .join(&name, &user_id, &username)
                        .await
                        .map_err(|e| e.to_string())
                };
                if let Err(message) = result {
                    send_json(&sender, &LobbyMsg::Error { message }).await;
                }
            }
            LobbyClientMsg::LeaveTournament { name } => {
                let result = if user_id.is_empty() {
                    Err("identity required".to_string())
                } else {
                    state
                        .bracket
                        .leave(&name, &user_id)
                        .await
                        .map_err(|e| e.to_string())
                };
                if let Err(message) = result {
                    send_json(&sender, &LobbyMsg::Error { message }).await;
                }
            }
        }
    }

    tracing::info!("Lobby socket disconnected");
    event_task.abort();
}

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    config::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .expect("Invalid PORT");

    let settings = config::load_settings();

    let store = Arc::new(MemoryStore::new());
    let lobby = LobbyHandle::new();
    let sessions: Arc<DashMap<String, SessionHandle>> = Arc::new(DashMap::new());
    let bracket = Arc::new(BracketEngine::new(
        store.clone(),
        store.clone(),
        lobby.clone(),
        sessions.clone(),
    ));
    let registry = Arc::new(SessionRegistry::new(
        store.clone(),
        bracket.clone(),
        settings,
        sessions,
    ));

    let state = AppState {
        registry,
        bracket,
        store,
        lobby,
    };

    let app = Router::new()
        .route("/ws/game/{room}", get(game_ws_handler))
        .route("/ws/lobby", get(lobby_ws_handler))
        .nest_service("/static", ServeDir::new("static"))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind");

    tracing::info!("pongrush server running on port {}", port);

    axum::serve(listener, app).await.unwrap();
}
