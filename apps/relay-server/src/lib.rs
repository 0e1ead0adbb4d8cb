//! CareLink Relay Server
//!
//! WebSocket relay that runs one Diffie-Hellman exchange per connection,
//! decrypts transit ciphertext, stores it encrypted at rest and forwards
//! it to the recipient under the recipient's own session key.

pub mod config;
pub mod error;
pub mod handler;
pub mod relay;
pub mod state;
pub mod store;

use std::time::Duration;

use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};
use shared_protocol::{ChatMessage, ErrorCode};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use state::{AppState, PeerDirectory, Registry};
pub use store::{MemoryMessageStore, MessageStore, PersistenceError};

/// HTTP routes for the relay
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handler::ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Stats endpoint
async fn stats_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "connections": state.registry.connection_count(),
        "sessions": state.engine.len(),
        "established": state.engine.established_count(),
        "storedMessages": state.store.message_count(),
    }))
}

/// Periodically drop sessions stuck waiting for a key-response
pub fn spawn_idle_sweeper(state: AppState, every: Duration, max_idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let swept = state.engine.sweep_idle(max_idle);
            for connection_id in swept {
                debug!("Notifying {} of key agreement timeout", connection_id);
                if let Some(tx) = state.registry.sender(&connection_id) {
                    let _ = tx
                        .send(ChatMessage::error(
                            ErrorCode::KeyAgreementFailed,
                            "key agreement timed out",
                        ))
                        .await;
                }
            }
        }
    })
}
