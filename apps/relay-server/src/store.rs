//! Persistence interface for encrypted messages

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_protocol::UserId;
use thiserror::Error;
use uuid::Uuid;

/// Persistence failure
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Store is full ({0} messages)")]
    CapacityExceeded(usize),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Opaque identifier assigned by the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Base64 at-rest envelope of the message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredEnvelope(pub String);

/// Routing data persisted next to the envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub sender: UserId,
    pub recipient: UserId,
    /// HMAC of the sender id, for lookups without decrypting
    pub sender_hash: String,
    /// HMAC of the recipient id
    pub recipient_hash: String,
    /// Seconds since the Unix epoch
    pub sent_at: u64,
}

impl MessageMetadata {
    pub fn now(sender: UserId, recipient: UserId, sender_hash: String, recipient_hash: String) -> Self {
        Self {
            sender,
            recipient,
            sender_hash,
            recipient_hash,
            sent_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// A persisted message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub envelope: StoredEnvelope,
    pub metadata: MessageMetadata,
}

/// Sink for encrypted messages
pub trait MessageStore: Send + Sync {
    fn persist_encrypted_message(
        &self,
        envelope: &StoredEnvelope,
        metadata: &MessageMetadata,
    ) -> Result<MessageId, PersistenceError>;

    /// Number of persisted messages
    fn message_count(&self) -> usize;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
    limit: Option<usize>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects writes past `limit` messages
    pub fn with_limit(limit: usize) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            limit: Some(limit),
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<StoredMessage> {
        self.messages.lock().iter().find(|m| &m.id == id).cloned()
    }

    /// Messages addressed to the recipient with this HMAC
    pub fn find_by_recipient_hash(&self, recipient_hash: &str) -> Vec<StoredMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.metadata.recipient_hash == recipient_hash)
            .cloned()
            .collect()
    }
}

impl MessageStore for MemoryMessageStore {
    fn persist_encrypted_message(
        &self,
        envelope: &StoredEnvelope,
        metadata: &MessageMetadata,
    ) -> Result<MessageId, PersistenceError> {
        let mut messages = self.messages.lock();
        if let Some(limit) = self.limit {
            if messages.len() >= limit {
                return Err(PersistenceError::CapacityExceeded(limit));
            }
        }

        let id = MessageId::new();
        messages.push(StoredMessage {
            id: id.clone(),
            envelope: envelope.clone(),
            metadata: metadata.clone(),
        });
        Ok(id)
    }

    fn message_count(&self) -> usize {
        self.messages.lock().len()
    }
}
