//! WebSocket connection handling

use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use crypto_session::TransitEnvelope;
use futures::{SinkExt, StreamExt};
use shared_protocol::{ChatMessage, ConnectionId, ErrorCode, UserId};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::relay;
use crate::state::AppState;

/// Outbound queue depth per connection
const OUTBOUND_QUEUE: usize = 100;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// What the read loop should do after a message
enum Flow {
    Continue,
    Close,
}

/// Per-connection context
struct Connection {
    id: ConnectionId,
    user: Option<UserId>,
    tx: mpsc::Sender<ChatMessage>,
}

impl Connection {
    async fn send(&self, msg: ChatMessage) {
        if self.tx.send(msg).await.is_err() {
            debug!("Outbound queue closed for {}", self.id);
        }
    }

    async fn send_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.send(ChatMessage::error(code, message)).await;
    }
}

/// Handle a WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (msg_tx, mut msg_rx) = mpsc::channel::<ChatMessage>(OUTBOUND_QUEUE);

    let mut conn = Connection {
        id: ConnectionId::new(),
        user: None,
        tx: msg_tx,
    };
    debug!("Connection opened: {}", conn.id);

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            let json = match msg.to_json() {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => match ChatMessage::from_json(text.as_str()) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Invalid message format on {}: {}", conn.id, e);
                    conn.send_error(ErrorCode::MalformedMessage, e.to_string())
                        .await;
                    continue;
                }
            },
            Ok(Message::Binary(_)) => {
                conn.send_error(ErrorCode::MalformedMessage, "binary frames are not supported")
                    .await;
                continue;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!("WebSocket error on {}: {}", conn.id, e);
                break;
            }
        };

        debug!("Received {} on {}", msg.kind(), conn.id);
        match handle_message(&state, &mut conn, msg).await {
            Flow::Continue => {}
            Flow::Close => break,
        }
    }

    if let Some(user) = state.registry.unregister(&conn.id) {
        info!("User {} disconnected", user);
    }
    state.engine.close(&conn.id);

    // Flush queued replies such as a final error before the socket drops
    drop(conn);
    let mut forward_task = forward_task;
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut forward_task).await.is_err() {
        forward_task.abort();
    }
}

async fn handle_message(state: &AppState, conn: &mut Connection, msg: ChatMessage) -> Flow {
    match msg {
        ChatMessage::Register { user_id } => handle_register(state, conn, user_id).await,

        ChatMessage::KeyResponse { remote_public } => {
            handle_key_response(state, conn, remote_public).await
        }

        ChatMessage::Ciphertext {
            to,
            ciphertext,
            nonce,
            ..
        } => {
            handle_ciphertext(state, conn, to, TransitEnvelope { ciphertext, nonce }).await;
            Flow::Continue
        }

        ChatMessage::Ping => {
            conn.send(ChatMessage::Pong).await;
            Flow::Continue
        }

        other => {
            conn.send_error(
                ErrorCode::MalformedMessage,
                format!("unexpected {} from client", other.kind()),
            )
            .await;
            Flow::Continue
        }
    }
}

async fn handle_register(state: &AppState, conn: &mut Connection, user_id: UserId) -> Flow {
    if conn.user.is_some() {
        conn.send_error(ErrorCode::AlreadyRegistered, "connection is already registered")
            .await;
        return Flow::Continue;
    }
    // Wire ids skip the constructor's checks
    let user_id = match UserId::parse(user_id.as_str()) {
        Ok(id) => id,
        Err(e) => {
            conn.send_error(ErrorCode::MalformedMessage, e.to_string()).await;
            return Flow::Continue;
        }
    };

    state
        .registry
        .register(user_id.clone(), conn.id.clone(), conn.tx.clone());
    conn.user = Some(user_id);

    let engine = state.engine.clone();
    let connection_id = conn.id.clone();
    let started = tokio::task::spawn_blocking(move || engine.start(&connection_id))
        .await
        .map_err(|e| RelayError::Task(e.to_string()));

    match started {
        Ok(Ok(init)) => {
            conn.send(init.to_message(&conn.id)).await;
            Flow::Continue
        }
        Ok(Err(e)) => {
            error!("Key agreement could not start on {}: {}", conn.id, e);
            conn.send_error(ErrorCode::KeyAgreementFailed, e.to_string()).await;
            Flow::Close
        }
        Err(e) => {
            error!("Key agreement task failed on {}: {}", conn.id, e);
            conn.send_error(ErrorCode::KeyAgreementFailed, "internal error").await;
            Flow::Close
        }
    }
}

async fn handle_key_response(state: &AppState, conn: &Connection, remote_public: String) -> Flow {
    if conn.user.is_none() {
        conn.send_error(ErrorCode::NotRegistered, "register before key exchange")
            .await;
        return Flow::Continue;
    }

    let engine = state.engine.clone();
    let connection_id = conn.id.clone();
    let completed = tokio::task::spawn_blocking(move || {
        engine.complete_with_peer_decimal(&connection_id, &remote_public)
    })
    .await
    .map_err(|e| RelayError::Task(e.to_string()));

    match completed {
        Ok(Ok(_)) => {
            info!("Session established on {}", conn.id);
            conn.send(ChatMessage::Ready {
                connection_id: conn.id.clone(),
            })
            .await;
            Flow::Continue
        }
        Ok(Err(e)) => {
            warn!("Key agreement failed on {}: {}", conn.id, e);
            conn.send_error(ErrorCode::KeyAgreementFailed, e.to_string()).await;
            Flow::Close
        }
        Err(e) => {
            error!("Key agreement task failed on {}: {}", conn.id, e);
            conn.send_error(ErrorCode::KeyAgreementFailed, "internal error").await;
            Flow::Close
        }
    }
}

async fn handle_ciphertext(
    state: &AppState,
    conn: &Connection,
    to: Option<UserId>,
    envelope: TransitEnvelope,
) {
    let Some(from) = conn.user.as_ref() else {
        conn.send_error(ErrorCode::NotRegistered, "register before sending messages")
            .await;
        return;
    };
    if !state.engine.is_established(&conn.id) {
        conn.send_error(ErrorCode::NotEstablished, "key agreement has not completed")
            .await;
        return;
    }
    let Some(to) = to else {
        conn.send_error(ErrorCode::MalformedMessage, "ciphertext needs a recipient")
            .await;
        return;
    };
    let to = match UserId::parse(to.as_str()) {
        Ok(id) => id,
        Err(e) => {
            conn.send_error(ErrorCode::MalformedMessage, e.to_string()).await;
            return;
        }
    };

    let plaintext = match relay::open_inbound(state, &conn.id, &envelope) {
        Ok(text) => text,
        Err(e) => {
            debug!("Rejected ciphertext on {}: {}", conn.id, e);
            conn.send_error(ErrorCode::DecryptFailed, "could not decrypt message")
                .await;
            return;
        }
    };

    match relay::deliver(state, from, &to, &plaintext).await {
        Ok(delivery) => {
            conn.send(ChatMessage::Delivered {
                message_id: delivery.message_id.to_string(),
                online: delivery.online,
            })
            .await;
        }
        Err(RelayError::Persistence(e)) => {
            error!("Failed to persist message from {}: {}", from, e);
            conn.send_error(ErrorCode::PersistenceFailed, e.to_string()).await;
        }
        Err(e) => {
            error!("Failed to relay message from {}: {}", from, e);
            conn.send_error(ErrorCode::PersistenceFailed, "message was not stored")
                .await;
        }
    }
}
