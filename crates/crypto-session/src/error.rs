//! Crypto session error types

use thiserror::Error;

/// Key-agreement failure, scoped to one connection
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyAgreementError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session not established: {0}")]
    NotEstablished(String),

    #[error("Malformed peer public value: {0}")]
    MalformedPeerValue(String),
}

/// Missing or invalid key configuration, fatal at startup
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoConfigError {
    #[error("Master encryption key is not configured")]
    MissingMasterKey,

    #[error("Invalid master encryption key: {0}")]
    InvalidMasterKey(String),

    #[error("HMAC key is not configured")]
    MissingHmacKey,

    #[error("Invalid HMAC key: {0}")]
    InvalidHmacKey(String),

    #[error("Unsupported at-rest nonce length: {0} (expected 12 or 24)")]
    UnsupportedNonceLength(usize),
}

/// Cryptographic operation error
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error(transparent)]
    KeyAgreement(#[from] KeyAgreementError),

    #[error(transparent)]
    Config(#[from] CryptoConfigError),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Keyed hash requested but no HMAC key is configured")]
    KeyNotConfigured,

    #[error("Chunk too large: {chunk_bytes} bytes does not fit a {modulus_bits}-bit modulus")]
    ChunkTooLarge {
        chunk_bytes: usize,
        modulus_bits: usize,
    },

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("No modular inverse exists")]
    NoInverseExists,

    #[error("Invalid bit length for prime generation: {0}")]
    InvalidBitLength(usize),

    #[error("Invalid modulus: must be non-zero")]
    InvalidModulus,

    #[error("Invalid range: minimum exceeds maximum")]
    InvalidRange,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

pub type CryptoResult<T> = Result<T, CryptoError>;
