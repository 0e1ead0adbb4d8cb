//! Finite-field Diffie-Hellman key pairs and shared secrets

use num_bigint_dig::BigUint;
use num_traits::One;
use shared_protocol::DH_GENERATOR;
use zeroize::Zeroize;

use crate::math::{byte_len, generate_probable_prime, mod_pow, random_in_range, to_fixed_be_bytes};
use crate::{CryptoError, CryptoResult, KeyAgreementError, MIN_DH_PRIME_BITS};

/// Domain parameters for one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParams {
    modulus: BigUint,
    generator: BigUint,
}

impl DhParams {
    /// Fresh prime modulus with the fixed generator
    pub fn generate(prime_bits: usize) -> CryptoResult<Self> {
        let modulus = generate_probable_prime(prime_bits)?;
        Ok(Self {
            modulus,
            generator: BigUint::from(DH_GENERATOR),
        })
    }

    /// Parameters received from a peer
    pub fn new(modulus: BigUint, generator: BigUint) -> CryptoResult<Self> {
        if modulus.bits() < MIN_DH_PRIME_BITS {
            return Err(KeyAgreementError::MalformedPeerValue(format!(
                "modulus of {} bits is below the {}-bit minimum",
                modulus.bits(),
                MIN_DH_PRIME_BITS
            ))
            .into());
        }
        if generator < BigUint::from(2u32) || generator >= modulus {
            return Err(KeyAgreementError::MalformedPeerValue("generator out of range".into()).into());
        }
        Ok(Self { modulus, generator })
    }

    /// Parse parameters from their wire decimal form
    pub fn from_decimal(modulus: &str, generator: &str) -> CryptoResult<Self> {
        Self::new(parse_decimal(modulus)?, parse_decimal(generator)?)
    }

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Reject public values outside `[2, p-2]`
    pub fn validate_public(&self, value: &BigUint) -> Result<(), KeyAgreementError> {
        let upper = &self.modulus - BigUint::from(2u32);
        if *value < BigUint::from(2u32) || *value > upper {
            return Err(KeyAgreementError::MalformedPeerValue(
                "public value outside [2, p-2]".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a decimal big integer as sent on the wire
pub fn parse_decimal(value: &str) -> Result<BigUint, KeyAgreementError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(KeyAgreementError::MalformedPeerValue(
            "expected a decimal integer".into(),
        ));
    }
    BigUint::parse_bytes(trimmed.as_bytes(), 10)
        .ok_or_else(|| KeyAgreementError::MalformedPeerValue("expected a decimal integer".into()))
}

/// Ephemeral key pair bound to one set of parameters
pub struct DhKeyPair {
    params: DhParams,
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    /// Draw a private exponent in `[1, p-2]` and compute `g^a mod p`
    pub fn generate(params: DhParams) -> CryptoResult<Self> {
        let upper = params.modulus() - BigUint::from(2u32);
        let private = random_in_range(&BigUint::one(), &upper)?;
        let public = mod_pow(params.generator(), &private, params.modulus())?;
        Ok(Self {
            params,
            private,
            public,
        })
    }

    pub fn params(&self) -> &DhParams {
        &self.params
    }

    /// Public value to send to the peer
    pub fn public_value(&self) -> &BigUint {
        &self.public
    }

    /// Compute `their_public^a mod p`
    pub fn shared_secret(&self, their_public: &BigUint) -> CryptoResult<SharedSecret> {
        self.params.validate_public(their_public)?;
        let value = mod_pow(their_public, &self.private, self.params.modulus())?;
        Ok(SharedSecret::new(value, byte_len(self.params.modulus())))
    }
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("modulus_bits", &self.params.modulus().bits())
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Result of a completed exchange
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    value: BigUint,
    width: usize,
}

impl SharedSecret {
    fn new(value: BigUint, width: usize) -> Self {
        Self { value, width }
    }

    pub fn value(&self) -> &BigUint {
        &self.value
    }

    /// Big-endian bytes left-padded to the modulus byte length
    pub fn to_fixed_bytes(&self) -> CryptoResult<Vec<u8>> {
        to_fixed_be_bytes(&self.value, self.width).ok_or(CryptoError::InvalidKeyLength {
            expected: self.width,
            actual: self.value.to_bytes_be().len(),
        })
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([{} bytes])", self.width)
    }
}
