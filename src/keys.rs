//! Textbook block RSA used for directed messages.
//!
//! Keys are built from two primes drawn either from explicit user input or
//! from a candidate pool. Text is ciphered in fixed-size blocks of base-128
//! digits, one big integer per block. The parameter searches are deliberately
//! naive linear scans; their exact behavior (including cost) is part of the
//! protocol's observable surface and must not be replaced with shortcuts
//! such as a modular-inverse computation.

use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, ToPrimitive, Zero};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters per plaintext block. A block encodes as one base-128 integer,
/// so the modulus must satisfy `n >= 128^BLOCK_SIZE`.
pub const BLOCK_SIZE: usize = 8;

/// Base of the block encoding; one digit per character, codes 0..=127.
const BLOCK_RADIX: u32 = 128;

/// Attempt ceiling for pool sampling before giving up.
const MAX_SAMPLE_ATTEMPTS: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimeRole {
    P,
    Q,
}

impl std::fmt::Display for PrimeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimeRole::P => write!(f, "p"),
            PrimeRole::Q => write!(f, "q"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("{0} is not a prime number")]
    NonPrime(PrimeRole),
    #[error("p and q must be different primes")]
    PrimesEqual,
    #[error("the product of p and q must be at least 128^{BLOCK_SIZE}")]
    ProductTooSmall,
    #[error("no usable prime pair found within the attempt limit")]
    Exhausted,
}

/// The part of a key pair that travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub n: BigUint,
    pub e: BigUint,
}

/// A full RSA key pair. Immutable once derived; the private half never
/// leaves the process that generated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub p: BigUint,
    pub q: BigUint,
    pub phi: BigUint,
    pub n: BigUint,
    pub e: BigUint,
    pub d: BigUint,
    pub block_size: usize,
}

impl KeyPair {
    /// Builds a key pair from explicit primes.
    pub fn generate(p: u64, q: u64) -> Result<Self, KeyError> {
        if !is_prime(p) {
            return Err(KeyError::NonPrime(PrimeRole::P));
        }
        if !is_prime(q) {
            return Err(KeyError::NonPrime(PrimeRole::Q));
        }
        if p == q {
            return Err(KeyError::PrimesEqual);
        }
        if !primes_are_large_enough(p, q) {
            return Err(KeyError::ProductTooSmall);
        }
        Ok(Self::derive(p, q))
    }

    /// Samples prime pairs uniformly from `pool` until one satisfies the
    /// same constraints `generate` enforces, or the attempt ceiling is hit.
    pub fn auto_generate(pool: &[u64]) -> Result<Self, KeyError> {
        if pool.is_empty() {
            return Err(KeyError::Exhausted);
        }
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_SAMPLE_ATTEMPTS {
            let p = pool[rng.gen_range(0..pool.len())];
            let q = pool[rng.gen_range(0..pool.len())];
            if !is_prime(p) || !is_prime(q) || p == q {
                continue;
            }
            if !primes_are_large_enough(p, q) {
                continue;
            }
            return Ok(Self::derive(p, q));
        }
        Err(KeyError::Exhausted)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            n: self.n.clone(),
            e: self.e.clone(),
        }
    }

    /// Derives `phi`, `n`, `e`, and `d` from validated primes.
    ///
    /// `e` is the smallest integer >= 2 coprime with `phi`, found by scanning
    /// upward. `d` is found by scanning `k` upward from 0 until
    /// `(k*phi + 1)` divides evenly by `e`; the quotient is `d`.
    fn derive(p: u64, q: u64) -> Self {
        let p = BigUint::from(p);
        let q = BigUint::from(q);
        let n = &p * &q;
        let phi = (&p - 1u32) * (&q - 1u32);

        let mut e = BigUint::from(2u32);
        while phi.gcd(&e) != BigUint::one() {
            e += 1u32;
        }

        let mut k = BigUint::zero();
        let d = loop {
            let candidate = &k * &phi + 1u32;
            if (&candidate % &e).is_zero() {
                break candidate / &e;
            }
            k += 1u32;
        };

        Self {
            p,
            q,
            phi,
            n,
            e,
            d,
            block_size: BLOCK_SIZE,
        }
    }
}

/// Deterministic trial division over `[2, sqrt(n)]`.
///
/// The divisor range is empty for 0, 1, and 2, so all three are accepted;
/// callers that care must pair this with the size bound, which rules the
/// degenerate values out of any real key.
pub fn is_prime(n: u64) -> bool {
    let mut divisor: u64 = 2;
    while u128::from(divisor) * u128::from(divisor) <= u128::from(n) {
        if n % divisor == 0 {
            return false;
        }
        divisor += 1;
    }
    true
}

/// True iff `p * q` is large enough to hold one full block, i.e.
/// `p*q >= 128^BLOCK_SIZE`.
pub fn primes_are_large_enough(p: u64, q: u64) -> bool {
    let product = BigUint::from(p) * BigUint::from(q);
    product >= BigUint::from(BLOCK_RADIX).pow(BLOCK_SIZE as u32)
}

/// Ciphers `text` under `key`, one big integer per block of `BLOCK_SIZE`
/// characters. Block value is `sum(code(text[i+j]) * 128^j)`; the final
/// block may cover fewer characters. Character codes >= 128 are outside the
/// supported alphabet and will not survive a round trip.
pub fn encrypt_text(text: &str, key: &PublicKey) -> Vec<BigUint> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(BLOCK_SIZE)
        .map(|block| {
            let mut total = BigUint::zero();
            for (j, ch) in block.iter().enumerate() {
                total += BigUint::from(*ch as u32) * BigUint::from(BLOCK_RADIX).pow(j as u32);
            }
            total.modpow(&key.e, &key.n)
        })
        .collect()
}

/// Inverse of [`encrypt_text`] under the matching private key.
///
/// Digits are extracted most-significant-first and each chunk reversed to
/// restore character order. A short final block decodes with high digits of
/// zero, so trailing NUL characters are trimmed from the result.
pub fn decrypt_text(blocks: &[BigUint], keys: &KeyPair) -> String {
    let mut text = String::new();
    for cipher in blocks {
        let mut value = cipher.modpow(&keys.d, &keys.n);
        let mut chunk = Vec::with_capacity(keys.block_size);
        for i in (0..keys.block_size).rev() {
            let position = BigUint::from(BLOCK_RADIX).pow(i as u32);
            let digit = &value / &position;
            value = &value % &position;
            chunk.push(digit_to_char(&digit));
        }
        chunk.reverse();
        text.extend(chunk);
    }
    text.trim_end_matches('\0').to_string()
}

// A digit outside the alphabet means the ciphertext was not produced by
// encrypt_text under the matching key; degrade to the replacement character
// rather than panicking on hostile input.
fn digit_to_char(digit: &BigUint) -> char {
    digit
        .to_u32()
        .and_then(char::from_u32)
        .unwrap_or(char::REPLACEMENT_CHARACTER)
}
