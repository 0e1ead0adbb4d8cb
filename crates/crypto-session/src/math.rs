//! Number-theory primitives over arbitrary-precision integers
//!
//! All randomness comes from the operating system CSPRNG.

use std::time::Instant;

use num_bigint_dig::{BigInt, BigUint, RandBigInt, RandPrime, Sign};
use num_traits::{One, Signed, Zero};
use rand::rngs::OsRng;
use tracing::debug;

use crate::{CryptoError, CryptoResult};

/// Miller-Rabin rounds used when checking primality
const PRIMALITY_ROUNDS: usize = 20;

/// Generate a probable prime of exactly `bits` bits
pub fn generate_probable_prime(bits: usize) -> CryptoResult<BigUint> {
    if bits < 2 {
        return Err(CryptoError::InvalidBitLength(bits));
    }

    let started = Instant::now();
    let mut rng = OsRng;
    let prime = rng.gen_prime(bits);

    debug!(
        "Generated {}-bit probable prime in {:?}",
        bits,
        started.elapsed()
    );

    Ok(prime)
}

/// Probabilistic primality check
pub fn is_probable_prime(candidate: &BigUint) -> bool {
    num_bigint_dig::prime::probably_prime(candidate, PRIMALITY_ROUNDS)
}

/// Sample a value in `[min, max]` inclusive
///
/// Draws an integer as wide (in bytes) as the range and reduces it modulo
/// the range width. The small modulo bias this introduces is accepted.
pub fn random_in_range(min: &BigUint, max: &BigUint) -> CryptoResult<BigUint> {
    if min > max {
        return Err(CryptoError::InvalidRange);
    }

    let width = (max - min) + BigUint::one();
    let sample_bits = width.bits().div_ceil(8) * 8;

    let mut rng = OsRng;
    let sample = rng.gen_biguint(sample_bits);

    Ok(min + (sample % &width))
}

/// `base^exponent mod modulus`
pub fn mod_pow(base: &BigUint, exponent: &BigUint, modulus: &BigUint) -> CryptoResult<BigUint> {
    if modulus.is_zero() {
        return Err(CryptoError::InvalidModulus);
    }
    Ok(base.modpow(exponent, modulus))
}

/// Multiplicative inverse of `value` modulo `modulus` (extended Euclid)
pub fn mod_inverse(value: &BigUint, modulus: &BigUint) -> CryptoResult<BigUint> {
    if modulus.is_zero() {
        return Err(CryptoError::NoInverseExists);
    }

    let m = BigInt::from_biguint(Sign::Plus, modulus.clone());
    let mut old_r = BigInt::from_biguint(Sign::Plus, value % modulus);
    let mut r = m.clone();
    let mut old_s = BigInt::one();
    let mut s = BigInt::zero();

    while !r.is_zero() {
        let q = &old_r / &r;

        let qr = &q * &r;
        let next_r = &old_r - &qr;
        old_r = std::mem::replace(&mut r, next_r);

        let qs = &q * &s;
        let next_s = &old_s - &qs;
        old_s = std::mem::replace(&mut s, next_s);
    }

    // gcd(value, modulus) must be 1
    if !old_r.is_one() {
        return Err(CryptoError::NoInverseExists);
    }

    let mut inverse = &old_s % &m;
    if inverse.is_negative() {
        inverse += &m;
    }

    inverse.to_biguint().ok_or(CryptoError::NoInverseExists)
}

/// Left-pad the big-endian encoding of `value` to exactly `len` bytes
///
/// Returns `None` when the value needs more than `len` bytes.
pub fn to_fixed_be_bytes(value: &BigUint, len: usize) -> Option<Vec<u8>> {
    if value.is_zero() {
        return Some(vec![0u8; len]);
    }

    let raw = value.to_bytes_be();
    if raw.len() > len {
        return None;
    }

    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    Some(out)
}

/// Byte length of the modulus, used for fixed-width encodings
pub fn byte_len(modulus: &BigUint) -> usize {
    modulus.bits().div_ceil(8)
}

#[cfg(test)]
mod tests {
    use num_traits::ToPrimitive;

    use super::*;

    fn big(n: u64) -> BigUint {
        BigUint::from(n)
    }

    #[test]
    fn test_mod_pow_known_value() {
        assert_eq!(mod_pow(&big(4), &big(13), &big(497)).unwrap(), big(445));
        assert!(matches!(
            mod_pow(&big(4), &big(13), &big(0)),
            Err(CryptoError::InvalidModulus)
        ));
    }

    #[test]
    fn test_mod_inverse() {
        assert_eq!(mod_inverse(&big(3), &big(11)).unwrap(), big(4));
        assert_eq!(mod_inverse(&big(10), &big(17)).unwrap(), big(12));
        // value larger than modulus is reduced first
        assert_eq!(mod_inverse(&big(14), &big(11)).unwrap(), big(4));
    }

    #[test]
    fn test_mod_inverse_missing() {
        assert!(matches!(
            mod_inverse(&big(6), &big(9)),
            Err(CryptoError::NoInverseExists)
        ));
        assert!(matches!(
            mod_inverse(&big(0), &big(7)),
            Err(CryptoError::NoInverseExists)
        ));
        assert!(matches!(
            mod_inverse(&big(3), &big(0)),
            Err(CryptoError::NoInverseExists)
        ));
    }

    #[test]
    fn test_mod_inverse_against_large_prime() {
        let p = generate_probable_prime(256).unwrap();
        let value = random_in_range(&big(2), &(&p - big(1))).unwrap();
        let inverse = mod_inverse(&value, &p).unwrap();
        assert_eq!((value * inverse) % &p, big(1));
    }

    #[test]
    fn test_generate_probable_prime() {
        let p = generate_probable_prime(128).unwrap();
        assert_eq!(p.bits(), 128);
        assert!(is_probable_prime(&p));
    }

    #[test]
    fn test_generate_prime_rejects_tiny_bit_length() {
        assert!(matches!(
            generate_probable_prime(1),
            Err(CryptoError::InvalidBitLength(1))
        ));
    }

    #[test]
    fn test_composites_are_not_prime() {
        assert!(!is_probable_prime(&big(561)));
        assert!(!is_probable_prime(&big(1_000_000)));
        assert!(is_probable_prime(&big(1_000_003)));
    }

    #[test]
    fn test_random_in_range_bounds() {
        let min = big(10);
        let max = big(20);
        for _ in 0..500 {
            let v = random_in_range(&min, &max).unwrap();
            assert!(v >= min && v <= max);
        }
    }

    #[test]
    fn test_random_in_range_covers_range() {
        let mut seen = [false; 4];
        for _ in 0..1000 {
            let v = random_in_range(&big(0), &big(3)).unwrap();
            seen[v.to_u64().unwrap() as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_random_in_range_degenerate() {
        assert_eq!(random_in_range(&big(7), &big(7)).unwrap(), big(7));
        assert!(matches!(
            random_in_range(&big(8), &big(7)),
            Err(CryptoError::InvalidRange)
        ));
    }

    #[test]
    fn test_fixed_width_encoding() {
        assert_eq!(to_fixed_be_bytes(&big(1), 3).unwrap(), vec![0, 0, 1]);
        assert_eq!(to_fixed_be_bytes(&big(0), 2).unwrap(), vec![0, 0]);
        assert!(to_fixed_be_bytes(&big(0x1_0000), 2).is_none());
    }
}
