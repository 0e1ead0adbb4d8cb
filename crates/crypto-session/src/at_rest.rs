//! At-rest encryption and keyed hashing
//!
//! Envelope layout: `nonce || tag || ciphertext`. The nonce is 12 bytes for
//! ChaCha20-Poly1305 or 24 bytes for XChaCha20-Poly1305, the tag is always
//! 16 bytes.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce, Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    CryptoConfigError, CryptoError, CryptoResult, MASTER_KEY_SIZE, NONCE_SIZE, TAG_SIZE,
    XNONCE_SIZE,
};

type HmacSha256 = Hmac<Sha256>;

enum AeadCipher {
    Standard(ChaCha20Poly1305),
    Extended(XChaCha20Poly1305),
}

/// Master-key cipher for persisted data
pub struct AtRestCipher {
    cipher: AeadCipher,
    nonce_len: usize,
    hmac_key: Option<Zeroizing<Vec<u8>>>,
}

impl AtRestCipher {
    /// Build from raw key bytes
    ///
    /// The master key must be exactly 32 bytes. A missing HMAC key is
    /// allowed here; [`AtRestCipher::compute_hmac`] then refuses to run.
    pub fn new(
        master_key: &[u8],
        hmac_key: Option<&[u8]>,
        nonce_len: usize,
    ) -> Result<Self, CryptoConfigError> {
        if master_key.is_empty() {
            return Err(CryptoConfigError::MissingMasterKey);
        }
        if master_key.len() != MASTER_KEY_SIZE {
            return Err(CryptoConfigError::InvalidMasterKey(format!(
                "expected {} bytes, got {}",
                MASTER_KEY_SIZE,
                master_key.len()
            )));
        }

        let cipher = match nonce_len {
            NONCE_SIZE => AeadCipher::Standard(
                ChaCha20Poly1305::new_from_slice(master_key)
                    .map_err(|e| CryptoConfigError::InvalidMasterKey(e.to_string()))?,
            ),
            XNONCE_SIZE => AeadCipher::Extended(
                XChaCha20Poly1305::new_from_slice(master_key)
                    .map_err(|e| CryptoConfigError::InvalidMasterKey(e.to_string()))?,
            ),
            other => return Err(CryptoConfigError::UnsupportedNonceLength(other)),
        };

        let hmac_key = hmac_key
            .filter(|key| !key.is_empty())
            .map(|key| Zeroizing::new(key.to_vec()));

        Ok(Self {
            cipher,
            nonce_len,
            hmac_key,
        })
    }

    /// Build from base64-encoded configuration values
    pub fn from_base64(
        master_key: Option<&str>,
        hmac_key: Option<&str>,
        nonce_len: usize,
    ) -> Result<Self, CryptoConfigError> {
        let master_key = master_key
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(CryptoConfigError::MissingMasterKey)?;
        let master = Zeroizing::new(
            BASE64
                .decode(master_key)
                .map_err(|e| CryptoConfigError::InvalidMasterKey(e.to_string()))?,
        );

        let hmac = match hmac_key.map(str::trim).filter(|value| !value.is_empty()) {
            Some(encoded) => Some(Zeroizing::new(
                BASE64
                    .decode(encoded)
                    .map_err(|e| CryptoConfigError::InvalidHmacKey(e.to_string()))?,
            )),
            None => None,
        };

        Self::new(&master, hmac.as_ref().map(|key| key.as_slice()), nonce_len)
    }

    pub fn nonce_len(&self) -> usize {
        self.nonce_len
    }

    pub fn has_hmac_key(&self) -> bool {
        self.hmac_key.is_some()
    }

    /// Encrypt bytes into a `nonce || tag || ciphertext` envelope
    pub fn encrypt_buffer(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut nonce = vec![0u8; self.nonce_len];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let tag = match &self.cipher {
            AeadCipher::Standard(cipher) => {
                cipher.encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
            }
            AeadCipher::Extended(cipher) => {
                cipher.encrypt_in_place_detached(XNonce::from_slice(&nonce), b"", &mut buffer)
            }
        }
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut envelope = Vec::with_capacity(self.nonce_len + TAG_SIZE + buffer.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&tag);
        envelope.extend_from_slice(&buffer);
        Ok(envelope)
    }

    /// Open an envelope produced by [`AtRestCipher::encrypt_buffer`]
    pub fn decrypt_buffer(&self, envelope: &[u8]) -> CryptoResult<Vec<u8>> {
        if envelope.len() < self.nonce_len + TAG_SIZE {
            debug!("At-rest envelope too short: {} bytes", envelope.len());
            return Err(CryptoError::DecryptionFailed);
        }

        let (nonce, rest) = envelope.split_at(self.nonce_len);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);
        let tag = Tag::from_slice(tag);

        let mut buffer = ciphertext.to_vec();
        match &self.cipher {
            AeadCipher::Standard(cipher) => cipher.decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                &mut buffer,
                tag,
            ),
            AeadCipher::Extended(cipher) => cipher.decrypt_in_place_detached(
                XNonce::from_slice(nonce),
                b"",
                &mut buffer,
                tag,
            ),
        }
        .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(buffer)
    }

    /// Encrypt text, returning the base64 envelope
    pub fn encrypt_text(&self, text: &str) -> CryptoResult<String> {
        Ok(BASE64.encode(self.encrypt_buffer(text.as_bytes())?))
    }

    /// Decrypt a base64 envelope back to text
    pub fn decrypt_text(&self, encoded: &str) -> CryptoResult<String> {
        let envelope = BASE64
            .decode(encoded.trim())
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let plaintext = self.decrypt_buffer(&envelope)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Deterministic HMAC-SHA-256 of `value` as lowercase hex
    pub fn compute_hmac(&self, value: &str) -> CryptoResult<String> {
        compute_keyed_hash(
            value.as_bytes(),
            self.hmac_key.as_ref().map(|key| key.as_slice()),
        )
    }
}

impl std::fmt::Debug for AtRestCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtRestCipher")
            .field("nonce_len", &self.nonce_len)
            .field("hmac_key", &self.hmac_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// HMAC-SHA-256 of `value` under `hmac_key`, hex encoded
///
/// Fails with [`CryptoError::KeyNotConfigured`] instead of substituting
/// any other secret.
pub fn compute_keyed_hash(value: &[u8], hmac_key: Option<&[u8]>) -> CryptoResult<String> {
    let key = hmac_key
        .filter(|key| !key.is_empty())
        .ok_or(CryptoError::KeyNotConfigured)?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: MASTER_KEY_SIZE,
            actual: key.len(),
        }
    })?;
    mac.update(value);

    Ok(hex::encode(mac.finalize().into_bytes()))
}
