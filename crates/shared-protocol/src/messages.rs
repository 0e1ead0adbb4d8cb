//! Messages exchanged over a chat connection
//!
//! All frames are JSON text frames tagged by `type`. Big integers travel
//! as decimal strings, transit ciphertext as base64 with a hex IV.

use serde::{Deserialize, Serialize};

use crate::{ConnectionId, MAX_FRAME_SIZE, ProtocolError, ProtocolResult, UserId};

/// Machine-readable error code carried by [`ChatMessage::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    MalformedMessage,
    NotRegistered,
    AlreadyRegistered,
    KeyAgreementFailed,
    NotEstablished,
    DecryptFailed,
    PersistenceFailed,
}

/// Chat connection message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ChatMessage {
    /// Bind an authenticated user to this connection
    Register { user_id: UserId },
    /// Server DH parameters and public value
    KeyInit {
        connection_id: ConnectionId,
        modulus: String,
        generator: String,
        local_public: String,
    },
    /// Client DH public value, sent exactly once
    KeyResponse { remote_public: String },
    /// Session established, ciphertext may flow
    Ready { connection_id: ConnectionId },
    /// Transit-encrypted chat payload
    Ciphertext {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        ciphertext: String,
        nonce: String,
    },
    /// Acknowledgement for a persisted message
    Delivered { message_id: String, online: bool },
    /// Error report; the connection stays open unless stated otherwise
    Error { code: ErrorCode, message: String },
    Ping,
    Pong,
}

impl ChatMessage {
    /// Outbound ciphertext addressed to `to`
    pub fn ciphertext_to(to: UserId, ciphertext: String, nonce: String) -> Self {
        Self::Ciphertext {
            to: Some(to),
            from: None,
            message_id: None,
            ciphertext,
            nonce,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a JSON text frame
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::KeyInit { .. } => "key-init",
            Self::KeyResponse { .. } => "key-response",
            Self::Ready { .. } => "ready",
            Self::Ciphertext { .. } => "ciphertext",
            Self::Delivered { .. } => "delivered",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_init_wire_format() {
        let msg = ChatMessage::KeyInit {
            connection_id: ConnectionId::from("c-1"),
            modulus: "23".to_string(),
            generator: "2".to_string(),
            local_public: "8".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "key-init");
        assert_eq!(value["connectionId"], "c-1");
        assert_eq!(value["localPublic"], "8");
    }

    #[test]
    fn test_parse_key_response() {
        let msg = ChatMessage::from_json(r#"{"type":"key-response","remotePublic":"12345"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ChatMessage::KeyResponse {
                remote_public: "12345".to_string()
            }
        );
    }

    #[test]
    fn test_parse_ciphertext_without_routing_fields() {
        let msg =
            ChatMessage::from_json(r#"{"type":"ciphertext","ciphertext":"AAAA","nonce":"00ff"}"#)
                .unwrap();
        match msg {
            ChatMessage::Ciphertext { to, from, .. } => {
                assert!(to.is_none());
                assert!(from.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_error_code_serialization() {
        let json = ChatMessage::error(ErrorCode::NotEstablished, "handshake pending")
            .to_json()
            .unwrap();
        assert!(json.contains(r#""code":"not-established""#));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let text = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            ChatMessage::from_json(&text),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
