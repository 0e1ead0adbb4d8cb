//! End-to-end tests over a real WebSocket connection.
//!
//! Each test starts the relay on an ephemeral port with a small DH modulus
//! and drives it with tokio-tungstenite clients that run their own half of
//! the key agreement.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crypto_session::{
    AtRestCipher, DhKeyPair, DhParams, KeyAgreementEngine, TransitEnvelope, TransitKey,
    parse_decimal, transit,
};
use futures::{SinkExt, StreamExt};
use relay_server::{AppState, MemoryMessageStore, MessageStore, router};
use shared_protocol::{ChatMessage, ErrorCode, UserId};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TEST_PRIME_BITS: usize = 256;

// ========================================
// Test Helpers
// ========================================

/// Start a relay and return its address and store
async fn start_relay() -> (SocketAddr, Arc<MemoryMessageStore>) {
    start_relay_with(MemoryMessageStore::new()).await
}

async fn start_relay_with(store: MemoryMessageStore) -> (SocketAddr, Arc<MemoryMessageStore>) {
    let store = Arc::new(store);
    let cipher = AtRestCipher::new(&[42u8; 32], Some(b"integration-hmac".as_slice()), 12)
        .expect("valid at-rest keys");
    let state = AppState::new(
        Arc::new(KeyAgreementEngine::new(TEST_PRIME_BITS)),
        Arc::new(cipher),
        store.clone(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to random port");
    let addr = listener.local_addr().expect("get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    (addr, store)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("websocket connect");
    ws
}

async fn send(ws: &mut Client, msg: &ChatMessage) {
    ws.send(Message::text(msg.to_json().unwrap()))
        .await
        .expect("send frame");
}

/// Next chat message, or `None` once the server closed the socket
async fn next_message(ws: &mut Client) -> Option<ChatMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for frame")?;
        match frame {
            Ok(Message::Text(text)) => return Some(ChatMessage::from_json(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn expect_message(ws: &mut Client) -> ChatMessage {
    next_message(ws).await.expect("connection closed unexpectedly")
}

fn expect_error(msg: ChatMessage, expected: ErrorCode) {
    match msg {
        ChatMessage::Error { code, .. } => assert_eq!(code, expected),
        other => panic!("expected {:?} error, got {:?}", expected, other),
    }
}

/// Register `user` and complete the key agreement, returning the transit key
async fn register_and_establish(ws: &mut Client, user: &str) -> TransitKey {
    send(
        ws,
        &ChatMessage::Register {
            user_id: UserId::parse(user).unwrap(),
        },
    )
    .await;

    let (modulus, generator, server_public) = match expect_message(ws).await {
        ChatMessage::KeyInit {
            modulus,
            generator,
            local_public,
            ..
        } => (modulus, generator, local_public),
        other => panic!("expected key-init, got {:?}", other),
    };

    let params = DhParams::from_decimal(&modulus, &generator).unwrap();
    let client = DhKeyPair::generate(params).unwrap();
    send(
        ws,
        &ChatMessage::KeyResponse {
            remote_public: client.public_value().to_str_radix(10),
        },
    )
    .await;

    match expect_message(ws).await {
        ChatMessage::Ready { .. } => {}
        other => panic!("expected ready, got {:?}", other),
    }

    let server_public = parse_decimal(&server_public).unwrap();
    TransitKey::derive(&client.shared_secret(&server_public).unwrap()).unwrap()
}

fn ciphertext_to(to: &str, text: &str, key: &TransitKey) -> ChatMessage {
    let envelope = transit::encrypt_text(text, key);
    ChatMessage::ciphertext_to(UserId::parse(to).unwrap(), envelope.ciphertext, envelope.nonce)
}

// ========================================
// Tests
// ========================================

#[tokio::test]
async fn test_message_relayed_between_established_peers() {
    let (addr, store) = start_relay().await;
    let mut patient = connect(addr).await;
    let mut doctor = connect(addr).await;

    let patient_key = register_and_establish(&mut patient, "patient-1").await;
    let doctor_key = register_and_establish(&mut doctor, "doctor-1").await;

    send(
        &mut patient,
        &ciphertext_to("doctor-1", "my fever is gone", &patient_key),
    )
    .await;

    let message_id = match expect_message(&mut patient).await {
        ChatMessage::Delivered { message_id, online } => {
            assert!(online);
            message_id
        }
        other => panic!("expected delivered, got {:?}", other),
    };

    match expect_message(&mut doctor).await {
        ChatMessage::Ciphertext {
            from: Some(from),
            message_id: Some(relayed_id),
            ciphertext,
            nonce,
            ..
        } => {
            assert_eq!(from.as_str(), "patient-1");
            assert_eq!(relayed_id, message_id);
            let envelope = TransitEnvelope { ciphertext, nonce };
            assert_eq!(
                transit::decrypt_text(&envelope, &doctor_key).unwrap(),
                "my fever is gone"
            );
        }
        other => panic!("expected ciphertext, got {:?}", other),
    }

    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn test_offline_recipient_is_stored() {
    let (addr, store) = start_relay().await;
    let mut patient = connect(addr).await;
    let key = register_and_establish(&mut patient, "patient-2").await;

    send(&mut patient, &ciphertext_to("doctor-away", "hello?", &key)).await;
    match expect_message(&mut patient).await {
        ChatMessage::Delivered { online, .. } => assert!(!online),
        other => panic!("expected delivered, got {:?}", other),
    }
    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn test_ciphertext_before_established_is_rejected() {
    let (addr, store) = start_relay().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        &ChatMessage::Register {
            user_id: UserId::parse("patient-3").unwrap(),
        },
    )
    .await;
    assert!(matches!(
        expect_message(&mut ws).await,
        ChatMessage::KeyInit { .. }
    ));

    let early = ChatMessage::ciphertext_to(
        UserId::parse("doctor-1").unwrap(),
        "AAAAAAAAAAAAAAAAAAAAAA==".to_string(),
        "00".repeat(16),
    );
    send(&mut ws, &early).await;
    expect_error(expect_message(&mut ws).await, ErrorCode::NotEstablished);

    // The connection stays usable
    send(&mut ws, &ChatMessage::Ping).await;
    assert_eq!(expect_message(&mut ws).await, ChatMessage::Pong);
    assert_eq!(store.message_count(), 0);
}

#[tokio::test]
async fn test_unregistered_connection_is_rejected() {
    let (addr, _store) = start_relay().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        &ChatMessage::KeyResponse {
            remote_public: "5".to_string(),
        },
    )
    .await;
    expect_error(expect_message(&mut ws).await, ErrorCode::NotRegistered);

    ws.send(Message::text(r#"{"type":"nonsense"}"#.to_string())).await.unwrap();
    expect_error(expect_message(&mut ws).await, ErrorCode::MalformedMessage);
}

#[tokio::test]
async fn test_invalid_peer_public_closes_connection() {
    let (addr, _store) = start_relay().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        &ChatMessage::Register {
            user_id: UserId::parse("patient-4").unwrap(),
        },
    )
    .await;
    assert!(matches!(
        expect_message(&mut ws).await,
        ChatMessage::KeyInit { .. }
    ));

    send(
        &mut ws,
        &ChatMessage::KeyResponse {
            remote_public: "1".to_string(),
        },
    )
    .await;
    expect_error(expect_message(&mut ws).await, ErrorCode::KeyAgreementFailed);
    assert!(next_message(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_undecryptable_ciphertext_is_reported() {
    let (addr, store) = start_relay().await;
    let mut ws = connect(addr).await;
    let key = register_and_establish(&mut ws, "patient-5").await;

    let envelope = transit::encrypt_text("hi", &key);
    let broken = ChatMessage::ciphertext_to(
        UserId::parse("doctor-1").unwrap(),
        envelope.ciphertext,
        "not-hex".to_string(),
    );
    send(&mut ws, &broken).await;
    expect_error(expect_message(&mut ws).await, ErrorCode::DecryptFailed);

    // Still established: a well-formed message goes through
    send(&mut ws, &ciphertext_to("doctor-1", "hi", &key)).await;
    assert!(matches!(
        expect_message(&mut ws).await,
        ChatMessage::Delivered { .. }
    ));
    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn test_second_register_is_rejected() {
    let (addr, _store) = start_relay().await;
    let mut ws = connect(addr).await;
    register_and_establish(&mut ws, "doctor-7").await;

    send(
        &mut ws,
        &ChatMessage::Register {
            user_id: UserId::parse("doctor-8").unwrap(),
        },
    )
    .await;
    expect_error(expect_message(&mut ws).await, ErrorCode::AlreadyRegistered);
}

#[tokio::test]
async fn test_store_failure_reported_to_sender() {
    let (addr, store) = start_relay_with(MemoryMessageStore::with_limit(0)).await;
    let mut patient = connect(addr).await;
    let mut doctor = connect(addr).await;
    let patient_key = register_and_establish(&mut patient, "patient-6").await;
    register_and_establish(&mut doctor, "doctor-6").await;

    send(&mut patient, &ciphertext_to("doctor-6", "lab results?", &patient_key)).await;
    expect_error(expect_message(&mut patient).await, ErrorCode::PersistenceFailed);

    // Nothing reached the recipient; both sides still answer pings
    send(&mut doctor, &ChatMessage::Ping).await;
    assert_eq!(expect_message(&mut doctor).await, ChatMessage::Pong);
    send(&mut patient, &ChatMessage::Ping).await;
    assert_eq!(expect_message(&mut patient).await, ChatMessage::Pong);
    assert_eq!(store.message_count(), 0);
}

#[tokio::test]
async fn test_blank_recipient_is_malformed() {
    let (addr, store) = start_relay().await;
    let mut ws = connect(addr).await;
    let key = register_and_establish(&mut ws, "patient-7").await;

    let envelope = transit::encrypt_text("hello", &key);
    let frame = format!(
        r#"{{"type":"ciphertext","to":"   ","ciphertext":"{}","nonce":"{}"}}"#,
        envelope.ciphertext, envelope.nonce
    );
    ws.send(Message::text(frame)).await.unwrap();
    expect_error(expect_message(&mut ws).await, ErrorCode::MalformedMessage);
    assert_eq!(store.message_count(), 0);
}
