//! Transit encryption for live chat payloads
//!
//! AES-256-CBC with PKCS#7 padding under a key derived from the session's
//! DH secret. The IV travels next to the ciphertext as hex; there is no
//! authentication tag on this path.

use aes::Aes256;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, CryptoResult, SharedSecret, TRANSIT_IV_SIZE, TRANSIT_KEY_SIZE};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size
const BLOCK_SIZE: usize = 16;

/// Symmetric key for one established session
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TransitKey([u8; TRANSIT_KEY_SIZE]);

impl TransitKey {
    /// `SHA-256` over the fixed-width encoding of the shared secret
    pub fn derive(secret: &SharedSecret) -> CryptoResult<Self> {
        let mut material = secret.to_fixed_bytes()?;
        let digest = Sha256::digest(&material);
        material.zeroize();

        let mut key = [0u8; TRANSIT_KEY_SIZE];
        key.copy_from_slice(&digest);
        Ok(Self(key))
    }

    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; TRANSIT_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; TRANSIT_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for TransitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransitKey([REDACTED])")
    }
}

/// Ciphertext as carried in a `ciphertext` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitEnvelope {
    /// Base64 ciphertext
    pub ciphertext: String,
    /// Hex-encoded 16-byte IV
    pub nonce: String,
}

/// Encrypt a payload under a fresh random IV
pub fn encrypt(plaintext: &[u8], key: &TransitKey) -> TransitEnvelope {
    let mut iv = [0u8; TRANSIT_IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    TransitEnvelope {
        ciphertext: BASE64.encode(ciphertext),
        nonce: hex::encode(iv),
    }
}

/// Decrypt an envelope, failing closed on any malformed input
pub fn decrypt(envelope: &TransitEnvelope, key: &TransitKey) -> CryptoResult<Vec<u8>> {
    let iv = hex::decode(envelope.nonce.trim()).map_err(|_| CryptoError::DecryptionFailed)?;
    let iv: [u8; TRANSIT_IV_SIZE] = iv.try_into().map_err(|_| CryptoError::DecryptionFailed)?;

    let ciphertext = BASE64
        .decode(envelope.ciphertext.trim())
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::DecryptionFailed);
    }

    Aes256CbcDec::new(key.as_bytes().into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt a UTF-8 chat message
pub fn encrypt_text(text: &str, key: &TransitKey) -> TransitEnvelope {
    encrypt(text.as_bytes(), key)
}

/// Decrypt a chat message, rejecting payloads that are not valid UTF-8
pub fn decrypt_text(envelope: &TransitEnvelope, key: &TransitKey) -> CryptoResult<String> {
    let bytes = decrypt(envelope, key)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::DecryptionFailed)
}
