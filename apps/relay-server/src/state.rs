//! Shared relay state: connection registry, key agreement, storage

use std::sync::Arc;

use crypto_session::{AtRestCipher, KeyAgreementEngine};
use dashmap::DashMap;
use shared_protocol::{ChatMessage, ConnectionId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::store::{MemoryMessageStore, MessageStore};

/// Lookup of peers by user, consumed by the relay path
pub trait PeerDirectory: Send + Sync {
    fn lookup_peer_connection(&self, user_id: &UserId) -> Option<ConnectionId>;

    fn is_session_established(&self, connection_id: &ConnectionId) -> bool;
}

/// Outbound side of one live connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub user_id: UserId,
    pub tx: mpsc::Sender<ChatMessage>,
}

/// Connected users and their sockets
pub struct Registry {
    users: DashMap<UserId, ConnectionId>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    engine: Arc<KeyAgreementEngine>,
}

impl Registry {
    pub fn new(engine: Arc<KeyAgreementEngine>) -> Self {
        Self {
            users: DashMap::new(),
            connections: DashMap::new(),
            engine,
        }
    }

    /// Bind `user_id` to a connection; the newest connection wins
    pub fn register(&self, user_id: UserId, connection_id: ConnectionId, tx: mpsc::Sender<ChatMessage>) {
        if let Some(previous) = self.users.insert(user_id.clone(), connection_id.clone()) {
            debug!("User {} replaced connection {}", user_id, previous);
        }
        self.connections
            .insert(connection_id.clone(), ConnectionHandle { user_id: user_id.clone(), tx });
        info!("User {} registered on {}", user_id, connection_id);
    }

    /// Remove the connection and, if still current, the user binding
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<UserId> {
        let (_, handle) = self.connections.remove(connection_id)?;
        self.users
            .remove_if(&handle.user_id, |_, current| current == connection_id);
        info!("User {} left {}", handle.user_id, connection_id);
        Some(handle.user_id)
    }

    pub fn sender(&self, connection_id: &ConnectionId) -> Option<mpsc::Sender<ChatMessage>> {
        self.connections
            .get(connection_id)
            .map(|handle| handle.tx.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl PeerDirectory for Registry {
    fn lookup_peer_connection(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.users.get(user_id).map(|entry| entry.value().clone())
    }

    fn is_session_established(&self, connection_id: &ConnectionId) -> bool {
        self.engine.is_established(connection_id)
    }
}

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<KeyAgreementEngine>,
    pub registry: Arc<Registry>,
    pub at_rest: Arc<AtRestCipher>,
    pub store: Arc<dyn MessageStore>,
}

impl AppState {
    pub fn new(
        engine: Arc<KeyAgreementEngine>,
        at_rest: Arc<AtRestCipher>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            registry: Arc::new(Registry::new(Arc::clone(&engine))),
            engine,
            at_rest,
            store,
        }
    }

    /// State backed by the in-memory store
    pub fn from_config(config: &RelayConfig) -> RelayResult<Self> {
        let cipher = config.build_cipher()?;
        Ok(Self::new(
            Arc::new(KeyAgreementEngine::new(config.crypto.dh_prime_bits)),
            Arc::new(cipher),
            Arc::new(MemoryMessageStore::new()),
        ))
    }
}
