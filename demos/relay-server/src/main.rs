//! Room relay server speaking the chat wire protocol.
//!
//! Run with: cargo run -p relay-server-demo
//!
//! Clients connect to `ws://127.0.0.1:8000/ws/chat/<room>/?user_id=<id>`.
//! Chat messages are stamped and broadcast to the whole room, delivery acks
//! and typing indicators to everyone but their author.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::{RwLock, broadcast};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Per-room broadcast buffer.
const ROOM_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(about = "WebSocket room relay for the chat protocol")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "ROOMCHAT_LISTEN", default_value = "127.0.0.1:8000")]
    listen: SocketAddr,
}

/// Application state shared across handlers.
#[derive(Clone, Default)]
struct AppState {
    rooms: Arc<RwLock<HashMap<String, broadcast::Sender<RoomEvent>>>>,
}

impl AppState {
    async fn join(&self, room: &str) -> broadcast::Sender<RoomEvent> {
        if let Some(tx) = self.rooms.read().await.get(room) {
            return tx.clone();
        }
        self.rooms
            .write()
            .await
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }

    async fn leave(&self, room: &str) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room).is_some_and(|tx| tx.receiver_count() == 0) {
            rooms.remove(room);
            tracing::info!(room = %room, "Room closed");
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    user_id: Option<String>,
    username: Option<String>,
}

struct Participant {
    connection: Uuid,
    user_id: String,
    username: String,
}

#[derive(Clone, Debug)]
struct RoomEvent {
    origin: Uuid,
    frame: ServerFrame,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    ChatMessage {
        message: String,
        recipient_id: serde_json::Value,
        #[serde(default)]
        message_id: Option<WireId>,
    },
    MessageDelivered {
        message_id: WireId,
    },
    Typing {
        #[serde(default)]
        is_typing: bool,
    },
}

/// Message id as sent by clients, either a string or an integer.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl From<WireId> for String {
    fn from(id: WireId) -> Self {
        match id {
            WireId::Text(s) => s,
            WireId::Signed(n) => n.to_string(),
            WireId::Unsigned(n) => n.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    ChatMessage {
        message_id: String,
        message: String,
        sender: String,
        sender_id: String,
        timestamp: String,
    },
    MessageDelivered {
        message_id: String,
    },
    Typing {
        user: String,
        is_typing: bool,
    },
}

impl RoomEvent {
    /// Whether `viewer` should see this event.
    fn visible_to(&self, viewer: Uuid) -> bool {
        match self.frame {
            ServerFrame::ChatMessage { .. } => true,
            ServerFrame::MessageDelivered { .. } | ServerFrame::Typing { .. } => self.origin != viewer,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let app = router(AppState::default());

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!("Relay listening on ws://{}", args.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/chat/{room}/", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let connection = Uuid::new_v4();
    let user_id = params.user_id.unwrap_or_else(|| connection.to_string());
    let participant = Participant {
        connection,
        username: params.username.unwrap_or_else(|| format!("user-{user_id}")),
        user_id,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, room, participant, state))
}

async fn handle_socket(socket: WebSocket, room: String, me: Participant, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let room_tx = state.join(&room).await;
    let mut room_rx = room_tx.subscribe();
    tracing::info!(room = %room, user = %me.username, "Participant joined");

    // Forward room traffic to this socket
    let viewer = me.connection;
    let send_task = tokio::spawn(async move {
        loop {
            let event = match room_rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Participant lagging, frames dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if !event.visible_to(viewer) {
                continue;
            }
            let json = match serde_json::to_string(&event.frame) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming frames
    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Invalid client frame: {e}");
                continue;
            }
        };

        let outgoing = relay_frame(frame, &me);
        if room_tx
            .send(RoomEvent {
                origin: me.connection,
                frame: outgoing,
            })
            .is_err()
        {
            tracing::debug!(room = %room, "No listeners in room");
        }
    }

    // Cleanup
    send_task.abort();
    let _ = send_task.await;
    drop(room_tx);
    state.leave(&room).await;
    tracing::info!(room = %room, user = %me.username, "Participant left");
}

fn relay_frame(frame: ClientFrame, me: &Participant) -> ServerFrame {
    match frame {
        ClientFrame::ChatMessage {
            message,
            recipient_id,
            message_id,
        } => {
            tracing::debug!(from = %me.user_id, to = %recipient_id, "Relaying chat message");
            ServerFrame::ChatMessage {
                message_id: message_id.map_or_else(|| Uuid::new_v4().to_string(), String::from),
                message,
                sender: me.username.clone(),
                sender_id: me.user_id.clone(),
                timestamp: now_rfc3339(),
            }
        }
        ClientFrame::MessageDelivered { message_id } => ServerFrame::MessageDelivered {
            message_id: message_id.into(),
        },
        ClientFrame::Typing { is_typing } => ServerFrame::Typing {
            user: me.username.clone(),
            is_typing,
        },
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}
