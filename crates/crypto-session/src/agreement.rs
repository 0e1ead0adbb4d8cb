//! Per-connection key-agreement engine
//!
//! Every connection runs exactly one Diffie-Hellman exchange:
//!
//! ```text
//! Created --start--> AwaitingPeer --peer public--> Established
//!    \                    |                             |
//!     +-------------------+------------close------------+--> Closed
//! ```
//!
//! Sessions are inserted only once fully initialised, so a concurrent
//! `complete_with_peer_public` either sees the whole session or nothing.
//! Each session sits behind its own mutex. Neither that mutex nor the map
//! shard lock is held during modular exponentiation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use num_bigint_dig::BigUint;
use parking_lot::Mutex;
use shared_protocol::{ChatMessage, ConnectionId, SessionState};
use tracing::{debug, info, warn};

use crate::session::parse_decimal;
use crate::{CryptoResult, DhKeyPair, DhParams, KeyAgreementError, SharedSecret, TransitKey};

/// Parameters and public value sent to the peer after `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInit {
    pub modulus: BigUint,
    pub generator: BigUint,
    pub local_public: BigUint,
}

impl KeyInit {
    /// Wire form with decimal strings
    pub fn to_message(&self, connection_id: &ConnectionId) -> ChatMessage {
        ChatMessage::KeyInit {
            connection_id: connection_id.clone(),
            modulus: self.modulus.to_str_radix(10),
            generator: self.generator.to_str_radix(10),
            local_public: self.local_public.to_str_radix(10),
        }
    }
}

struct DhSession {
    state: SessionState,
    keypair: Arc<DhKeyPair>,
    remote_public: Option<BigUint>,
    shared_secret: Option<SharedSecret>,
    transit_key: Option<TransitKey>,
    last_activity: Instant,
}

impl DhSession {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Cached secret of an already established session
fn established_secret(session: &DhSession, connection_id: &ConnectionId) -> Option<SharedSecret> {
    if session.state != SessionState::Established {
        return None;
    }
    let secret = session.shared_secret.clone()?;
    warn!(
        "Repeated key-response for {}, keeping the established secret",
        connection_id
    );
    Some(secret)
}

/// Registry of DH sessions keyed by connection
pub struct KeyAgreementEngine {
    sessions: DashMap<ConnectionId, Arc<Mutex<DhSession>>>,
    prime_bits: usize,
}

impl KeyAgreementEngine {
    pub fn new(prime_bits: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            prime_bits,
        }
    }

    pub fn prime_bits(&self) -> usize {
        self.prime_bits
    }

    /// Generate fresh parameters and a key pair for `connection_id`
    ///
    /// CPU-bound: async callers should run this on a blocking pool.
    pub fn start(&self, connection_id: &ConnectionId) -> CryptoResult<KeyInit> {
        if self.sessions.contains_key(connection_id) {
            return Err(KeyAgreementError::SessionExists(connection_id.to_string()).into());
        }

        let started = Instant::now();
        let params = DhParams::generate(self.prime_bits)?;
        let keypair = DhKeyPair::generate(params)?;

        let key_init = KeyInit {
            modulus: keypair.params().modulus().clone(),
            generator: keypair.params().generator().clone(),
            local_public: keypair.public_value().clone(),
        };

        let session = DhSession {
            state: SessionState::AwaitingPeer,
            keypair: Arc::new(keypair),
            remote_public: None,
            shared_secret: None,
            transit_key: None,
            last_activity: Instant::now(),
        };

        match self.sessions.entry(connection_id.clone()) {
            Entry::Occupied(_) => {
                Err(KeyAgreementError::SessionExists(connection_id.to_string()).into())
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(session)));
                info!(
                    "Key agreement started for {} ({}-bit modulus, {:?})",
                    connection_id,
                    self.prime_bits,
                    started.elapsed()
                );
                Ok(key_init)
            }
        }
    }

    /// Finish the exchange with the peer's public value
    ///
    /// A second call on an established session returns the cached secret
    /// and never recomputes it.
    pub fn complete_with_peer_public(
        &self,
        connection_id: &ConnectionId,
        remote_public: &BigUint,
    ) -> CryptoResult<SharedSecret> {
        let handle = self.session(connection_id)?;

        let keypair = {
            let session = handle.lock();
            if let Some(secret) = established_secret(&session, connection_id) {
                return Ok(secret);
            }
            Arc::clone(&session.keypair)
        };

        // Modular exponentiation runs without the session lock
        let secret = keypair.shared_secret(remote_public)?;
        let transit_key = TransitKey::derive(&secret)?;

        let mut session = handle.lock();
        if let Some(secret) = established_secret(&session, connection_id) {
            return Ok(secret);
        }
        if !self.sessions.contains_key(connection_id) {
            return Err(KeyAgreementError::SessionNotFound(connection_id.to_string()).into());
        }
        session.state = session
            .state
            .transition(SessionState::Established)
            .map_err(|e| KeyAgreementError::NotEstablished(e.to_string()))?;
        session.remote_public = Some(remote_public.clone());
        session.shared_secret = Some(secret.clone());
        session.transit_key = Some(transit_key);
        session.touch();

        info!("Key agreement established for {}", connection_id);
        Ok(secret)
    }

    /// [`Self::complete_with_peer_public`] for a wire decimal string
    pub fn complete_with_peer_decimal(
        &self,
        connection_id: &ConnectionId,
        remote_public: &str,
    ) -> CryptoResult<SharedSecret> {
        let remote_public = parse_decimal(remote_public)?;
        self.complete_with_peer_public(connection_id, &remote_public)
    }

    /// Discard all key material for the connection
    pub fn close(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.sessions.remove(connection_id).is_some();
        if removed {
            debug!("Key agreement session closed for {}", connection_id);
        }
        removed
    }

    /// Current state; unknown connections report `Closed`
    pub fn state(&self, connection_id: &ConnectionId) -> SessionState {
        match self.session(connection_id) {
            Ok(session) => {
                let state = session.lock().state;
                state
            }
            Err(_) => SessionState::Closed,
        }
    }

    pub fn is_established(&self, connection_id: &ConnectionId) -> bool {
        self.state(connection_id) == SessionState::Established
    }

    /// Peer public value, once received
    pub fn remote_public(&self, connection_id: &ConnectionId) -> Option<BigUint> {
        let session = self.session(connection_id).ok()?;
        let session = session.lock();
        session.remote_public.clone()
    }

    /// Symmetric key for an established session
    pub fn transit_key(&self, connection_id: &ConnectionId) -> CryptoResult<TransitKey> {
        let session = self.session(connection_id)?;
        let mut session = session.lock();
        let key = session
            .transit_key
            .clone()
            .ok_or_else(|| KeyAgreementError::NotEstablished(connection_id.to_string()))?;
        session.touch();
        Ok(key)
    }

    /// Drop sessions that stayed in `AwaitingPeer` longer than `max_idle`
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let mut expired = Vec::new();

        self.sessions.retain(|connection_id, session| {
            // A session busy in another thread is not idle
            let Some(session) = session.try_lock() else {
                return true;
            };
            let stale = session.state == SessionState::AwaitingPeer
                && session.last_activity.elapsed() > max_idle;
            if stale {
                expired.push(connection_id.clone());
            }
            !stale
        });

        if !expired.is_empty() {
            info!("Swept {} idle key-agreement sessions", expired.len());
        }
        expired
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn established_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().lock().state == SessionState::Established)
            .count()
    }

    fn session(&self, connection_id: &ConnectionId) -> CryptoResult<Arc<Mutex<DhSession>>> {
        self.sessions
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KeyAgreementError::SessionNotFound(connection_id.to_string()).into())
    }
}

impl std::fmt::Debug for KeyAgreementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAgreementEngine")
            .field("sessions", &self.sessions.len())
            .field("prime_bits", &self.prime_bits)
            .finish()
    }
}
