//! ElGamal encryption of arbitrary buffers in fixed-size chunks
//!
//! Each chunk is read as a big-endian integer `m < p` and encrypted
//! independently as `(g^k, m * y^k)` with a fresh `k`. Chunks record their
//! original length so leading zero bytes survive decryption. Chunk order is
//! the caller's responsibility; nothing in a chunk identifies its position.

use num_bigint_dig::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use shared_protocol::DH_GENERATOR;
use tracing::debug;
use zeroize::Zeroize;

use crate::math::{
    byte_len, generate_probable_prime, mod_inverse, mod_pow, random_in_range, to_fixed_be_bytes,
};
use crate::{CryptoError, CryptoResult, MIN_DH_PRIME_BITS};

/// Keys arrive through serde unchecked, so every use validates the modulus
fn check_modulus(p: &BigUint) -> CryptoResult<()> {
    if p.bits() < MIN_DH_PRIME_BITS || p <= &BigUint::from(3u32) {
        return Err(CryptoError::InvalidKey(format!(
            "modulus must be at least {} bits, got {}",
            MIN_DH_PRIME_BITS,
            p.bits()
        )));
    }
    Ok(())
}

/// `(p, g, y)` with `y = g^x mod p`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElGamalPublicKey {
    #[serde(with = "decimal")]
    pub p: BigUint,
    #[serde(with = "decimal")]
    pub g: BigUint,
    #[serde(with = "decimal")]
    pub y: BigUint,
}

impl ElGamalPublicKey {
    /// Largest chunk, in bytes, that is always below `p`
    pub fn max_chunk_size(&self) -> usize {
        self.p.bits().saturating_sub(1) / 8
    }

    /// Reject moduli below the minimum size and out-of-range `g` or `y`
    pub fn validate(&self) -> CryptoResult<()> {
        check_modulus(&self.p)?;
        if self.g <= BigUint::one() || self.g >= self.p {
            return Err(CryptoError::InvalidKey("generator out of range".into()));
        }
        if self.y.is_zero() || self.y >= self.p {
            return Err(CryptoError::InvalidKey("public value out of range".into()));
        }
        Ok(())
    }
}

/// `(x, p)`
#[derive(Clone, Serialize, Deserialize)]
pub struct ElGamalPrivateKey {
    #[serde(with = "decimal")]
    pub x: BigUint,
    #[serde(with = "decimal")]
    pub p: BigUint,
}

impl Drop for ElGamalPrivateKey {
    fn drop(&mut self) {
        self.x.zeroize();
    }
}

impl std::fmt::Debug for ElGamalPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElGamalPrivateKey")
            .field("x", &"[REDACTED]")
            .field("p_bits", &self.p.bits())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ElGamalKeyPair {
    pub public: ElGamalPublicKey,
    pub private: ElGamalPrivateKey,
}

impl ElGamalKeyPair {
    /// Fresh prime, generator 2, private exponent in `[1, p-2]`
    pub fn generate(bits: usize) -> CryptoResult<Self> {
        let p = generate_probable_prime(bits)?;
        let g = BigUint::from(DH_GENERATOR);
        let x = random_in_range(&BigUint::one(), &(&p - BigUint::from(2u32)))?;
        let y = mod_pow(&g, &x, &p)?;

        debug!("Generated {}-bit ElGamal key pair", bits);

        Ok(Self {
            public: ElGamalPublicKey {
                p: p.clone(),
                g,
                y,
            },
            private: ElGamalPrivateKey { x, p },
        })
    }
}

/// One encrypted chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherChunk {
    #[serde(with = "decimal")]
    pub c1: BigUint,
    #[serde(with = "decimal")]
    pub c2: BigUint,
    /// Plaintext length in bytes
    pub len: usize,
}

/// Encrypt a single chunk
pub fn encrypt_chunk(chunk: &[u8], public: &ElGamalPublicKey) -> CryptoResult<CipherChunk> {
    public.validate()?;
    let m = BigUint::from_bytes_be(chunk);
    if m >= public.p {
        return Err(CryptoError::ChunkTooLarge {
            chunk_bytes: chunk.len(),
            modulus_bits: public.p.bits(),
        });
    }

    let mut k = random_in_range(&BigUint::one(), &(&public.p - BigUint::from(2u32)))?;
    let c1 = mod_pow(&public.g, &k, &public.p)?;
    let shared = mod_pow(&public.y, &k, &public.p)?;
    let c2 = (m * shared) % &public.p;
    k.zeroize();

    Ok(CipherChunk {
        c1,
        c2,
        len: chunk.len(),
    })
}

/// Decrypt a single chunk back to exactly `chunk.len` bytes
pub fn decrypt_chunk(chunk: &CipherChunk, private: &ElGamalPrivateKey) -> CryptoResult<Vec<u8>> {
    check_modulus(&private.p)?;
    if chunk.len > byte_len(&private.p) {
        debug!("Chunk length {} exceeds the modulus width", chunk.len);
        return Err(CryptoError::DecryptionFailed);
    }
    if chunk.c1 >= private.p || chunk.c2 >= private.p {
        return Err(CryptoError::DecryptionFailed);
    }

    let s = mod_pow(&chunk.c1, &private.x, &private.p)?;
    let s_inv = mod_inverse(&s, &private.p)?;
    let m = (&chunk.c2 * s_inv) % &private.p;

    to_fixed_be_bytes(&m, chunk.len).ok_or(CryptoError::DecryptionFailed)
}

/// Split `buffer` into `chunk_size` pieces and encrypt each in order
pub fn encrypt_large(
    buffer: &[u8],
    public: &ElGamalPublicKey,
    chunk_size: usize,
) -> CryptoResult<Vec<CipherChunk>> {
    if chunk_size == 0 {
        return Err(CryptoError::InvalidChunkSize(chunk_size));
    }

    let chunks = buffer
        .chunks(chunk_size)
        .map(|chunk| encrypt_chunk(chunk, public))
        .collect::<CryptoResult<Vec<_>>>()?;

    debug!(
        "Encrypted {} bytes into {} chunks of up to {} bytes",
        buffer.len(),
        chunks.len(),
        chunk_size
    );

    Ok(chunks)
}

/// Decrypt chunks and concatenate them in the given order
pub fn decrypt_large(chunks: &[CipherChunk], private: &ElGamalPrivateKey) -> CryptoResult<Vec<u8>> {
    let total = chunks
        .iter()
        .try_fold(0usize, |total, chunk| total.checked_add(chunk.len))
        .ok_or(CryptoError::DecryptionFailed)?;
    check_modulus(&private.p)?;
    if chunks.iter().any(|chunk| chunk.len > byte_len(&private.p)) {
        return Err(CryptoError::DecryptionFailed);
    }

    let mut buffer = Vec::with_capacity(total);
    for chunk in chunks {
        buffer.extend_from_slice(&decrypt_chunk(chunk, private)?);
    }
    Ok(buffer)
}

/// Serde adapter writing big integers as decimal strings
mod decimal {
    use num_bigint_dig::BigUint;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        BigUint::parse_bytes(text.as_bytes(), 10)
            .ok_or_else(|| D::Error::custom("expected a decimal integer"))
    }
}
