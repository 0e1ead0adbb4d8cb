//! Decrypt, persist and forward chat payloads

use crypto_session::TransitKey;
use crypto_session::transit::{self, TransitEnvelope};
use shared_protocol::{ChatMessage, ConnectionId, UserId};
use tracing::{debug, warn};

use crate::error::RelayResult;
use crate::state::{AppState, PeerDirectory};
use crate::store::{MessageId, MessageMetadata, StoredEnvelope};

/// Outcome of relaying one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    /// Whether the recipient had an established session and got a copy
    pub online: bool,
}

/// Decrypt a sender's ciphertext under its own session key
pub fn open_inbound(
    state: &AppState,
    connection_id: &ConnectionId,
    envelope: &TransitEnvelope,
) -> RelayResult<String> {
    let key = state.engine.transit_key(connection_id)?;
    Ok(transit::decrypt_text(envelope, &key)?)
}

/// Persist `plaintext` encrypted at rest and forward it to `to` if online
pub async fn deliver(
    state: &AppState,
    from: &UserId,
    to: &UserId,
    plaintext: &str,
) -> RelayResult<Delivery> {
    let stored = StoredEnvelope(state.at_rest.encrypt_text(plaintext)?);
    let metadata = MessageMetadata::now(
        from.clone(),
        to.clone(),
        state.at_rest.compute_hmac(from.as_str())?,
        state.at_rest.compute_hmac(to.as_str())?,
    );
    let message_id = state.store.persist_encrypted_message(&stored, &metadata)?;
    debug!("Persisted message {} ({} bytes)", message_id, plaintext.len());

    // The message is stored; from here on failures only mean "not online"
    let Some((peer, key)) = recipient_key(state, to) else {
        return Ok(Delivery {
            message_id,
            online: false,
        });
    };
    let envelope = transit::encrypt_text(plaintext, &key);
    let outbound = ChatMessage::Ciphertext {
        to: None,
        from: Some(from.clone()),
        message_id: Some(message_id.to_string()),
        ciphertext: envelope.ciphertext,
        nonce: envelope.nonce,
    };

    let online = match state.registry.sender(&peer) {
        Some(tx) => tx.send(outbound).await.is_ok(),
        None => false,
    };
    if !online {
        warn!("Recipient {} disconnected during delivery", to);
    }

    Ok(Delivery { message_id, online })
}

/// Connection and transit key of an online, established recipient
fn recipient_key(state: &AppState, to: &UserId) -> Option<(ConnectionId, TransitKey)> {
    let peer = state.registry.lookup_peer_connection(to)?;
    if !state.registry.is_session_established(&peer) {
        debug!("Recipient {} has no established session yet", to);
        return None;
    }
    // The recipient may close between the check and the lookup
    match state.engine.transit_key(&peer) {
        Ok(key) => Some((peer, key)),
        Err(e) => {
            warn!("Recipient {} lost its session during delivery: {}", to, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crypto_session::{AtRestCipher, DhKeyPair, DhParams, KeyAgreementEngine};
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::RelayError;
    use crate::store::{MemoryMessageStore, MessageStore};

    fn test_state() -> (AppState, Arc<MemoryMessageStore>) {
        let store = Arc::new(MemoryMessageStore::new());
        let cipher = AtRestCipher::new(&[9u8; 32], Some(b"relay-test-hmac".as_slice()), 12).unwrap();
        let state = AppState::new(
            Arc::new(KeyAgreementEngine::new(256)),
            Arc::new(cipher),
            store.clone(),
        );
        (state, store)
    }

    /// Complete a handshake for `connection_id`, returning the client's key
    fn establish(state: &AppState, connection_id: &ConnectionId) -> TransitKey {
        let init = state.engine.start(connection_id).unwrap();
        let params = DhParams::new(init.modulus.clone(), init.generator.clone()).unwrap();
        let client = DhKeyPair::generate(params).unwrap();
        state
            .engine
            .complete_with_peer_public(connection_id, client.public_value())
            .unwrap();
        TransitKey::derive(&client.shared_secret(&init.local_public).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_offline_recipient_is_persisted_only() {
        let (state, store) = test_state();
        let from = UserId::parse("patient-1").unwrap();
        let to = UserId::parse("doctor-1").unwrap();

        let delivery = deliver(&state, &from, &to, "see you tomorrow").await.unwrap();
        assert!(!delivery.online);
        assert_eq!(store.message_count(), 1);

        let stored = store.get(&delivery.message_id).unwrap();
        assert_ne!(stored.envelope.0, "see you tomorrow");
        assert_eq!(state.at_rest.decrypt_text(&stored.envelope.0).unwrap(), "see you tomorrow");
        assert_eq!(
            stored.metadata.recipient_hash,
            state.at_rest.compute_hmac("doctor-1").unwrap()
        );
    }

    #[tokio::test]
    async fn test_online_recipient_gets_reencrypted_copy() {
        let (state, _store) = test_state();
        let from = UserId::parse("patient-1").unwrap();
        let to = UserId::parse("doctor-1").unwrap();

        let peer = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(4);
        state.registry.register(to.clone(), peer.clone(), tx);
        let peer_key = establish(&state, &peer);

        let delivery = deliver(&state, &from, &to, "new lab results").await.unwrap();
        assert!(delivery.online);

        match rx.recv().await.unwrap() {
            ChatMessage::Ciphertext {
                from: Some(sender),
                message_id: Some(message_id),
                ciphertext,
                nonce,
                ..
            } => {
                assert_eq!(sender, from);
                assert_eq!(message_id, delivery.message_id.to_string());
                let envelope = TransitEnvelope { ciphertext, nonce };
                assert_eq!(
                    transit::decrypt_text(&envelope, &peer_key).unwrap(),
                    "new lab results"
                );
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_inbound_uses_sender_key() {
        let (state, _store) = test_state();
        let conn = ConnectionId::new();
        let client_key = establish(&state, &conn);

        let envelope = transit::encrypt_text("hello", &client_key);
        assert_eq!(open_inbound(&state, &conn, &envelope).unwrap(), "hello");

        let bogus = TransitEnvelope {
            ciphertext: envelope.ciphertext.clone(),
            nonce: "00".repeat(4),
        };
        assert!(open_inbound(&state, &conn, &bogus).is_err());
    }

    #[tokio::test]
    async fn test_recipient_with_closed_session_counts_as_offline() {
        let (state, store) = test_state();
        let from = UserId::parse("patient-1").unwrap();
        let to = UserId::parse("doctor-1").unwrap();

        let peer = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(4);
        state.registry.register(to.clone(), peer.clone(), tx);
        establish(&state, &peer);
        state.engine.close(&peer);

        let delivery = deliver(&state, &from, &to, "are you there?").await.unwrap();
        assert!(!delivery.online);
        assert_eq!(store.message_count(), 1);
        assert!(store.get(&delivery.message_id).is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_store_failure_is_reported_and_nothing_forwarded() {
        let store = Arc::new(MemoryMessageStore::with_limit(0));
        let cipher = AtRestCipher::new(&[9u8; 32], Some(b"relay-test-hmac".as_slice()), 12).unwrap();
        let state = AppState::new(
            Arc::new(KeyAgreementEngine::new(256)),
            Arc::new(cipher),
            store.clone(),
        );
        let to = UserId::parse("doctor-1").unwrap();
        let peer = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(4);
        state.registry.register(to.clone(), peer.clone(), tx);
        establish(&state, &peer);

        let result = deliver(&state, &UserId::parse("patient-1").unwrap(), &to, "x").await;
        assert!(matches!(result, Err(RelayError::Persistence(_))));
        assert_eq!(store.message_count(), 0);
        assert!(rx.try_recv().is_err());
    }
}
