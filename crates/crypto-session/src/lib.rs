//! Crypto Session - Secure messaging core for CareLink
//!
//! Finite-field Diffie-Hellman per connection, AES-256-CBC transit
//! encryption under the derived key, ChaCha20-Poly1305 at-rest envelopes
//! with HMAC lookups, and chunked ElGamal for key-protected files.

mod agreement;
mod at_rest;
mod error;
mod session;

pub mod elgamal;
pub mod math;
pub mod transit;

pub use agreement::*;
pub use at_rest::*;
pub use error::*;
pub use session::*;
pub use transit::{TransitEnvelope, TransitKey};

/// Nonce size for ChaCha20Poly1305 (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Nonce size for XChaCha20Poly1305 (192 bits / 24 bytes)
pub const XNONCE_SIZE: usize = 24;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// At-rest master key size (256 bits / 32 bytes)
pub const MASTER_KEY_SIZE: usize = 32;

/// Transit key size, the SHA-256 output length
pub const TRANSIT_KEY_SIZE: usize = 32;

/// Transit IV size, one AES block
pub const TRANSIT_IV_SIZE: usize = 16;

/// Smallest DH modulus accepted from configuration or a peer
pub const MIN_DH_PRIME_BITS: usize = 256;
