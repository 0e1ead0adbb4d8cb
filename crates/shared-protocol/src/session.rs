//! Connection identifiers and key-agreement session states

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ProtocolError, ProtocolResult};

/// Opaque identifier for one socket connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Allocate a fresh random connection id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application-level user identity, already authenticated by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Parse a user id, rejecting blank input
    pub fn parse(value: &str) -> ProtocolResult<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::MissingField("userId"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key-agreement session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// Connection authenticated, no parameters yet
    Created,
    /// Key-init sent, waiting for the peer's public value
    AwaitingPeer,
    /// Shared secret computed
    Established,
    /// Key material discarded
    Closed,
}

impl SessionState {
    /// Whether `self -> to` is a legal step of the session lifecycle
    pub fn can_transition_to(self, to: SessionState) -> bool {
        matches!(
            (self, to),
            (SessionState::Created, SessionState::AwaitingPeer)
                | (SessionState::AwaitingPeer, SessionState::Established)
                | (SessionState::Created, SessionState::Closed)
                | (SessionState::AwaitingPeer, SessionState::Closed)
                | (SessionState::Established, SessionState::Closed)
        )
    }

    /// Checked transition
    pub fn transition(self, to: SessionState) -> ProtocolResult<SessionState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(ProtocolError::InvalidStateTransition { from: self, to })
        }
    }
}
