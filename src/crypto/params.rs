//! CKKS scheme parameters and modulus-chain construction.
//!
//! The default set mirrors the classic TenSEAL/SEAL configuration used for
//! short text vectors: ring degree 8192, a `[60, 40, 40, 60]` bit modulus
//! chain and a global scale of 2^40.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ntt::is_prime;
use super::CryptoError;

/// Smallest supported ring degree.
pub const MIN_DEGREE: usize = 16;

/// Largest supported ring degree.
pub const MAX_DEGREE: usize = 32768;

/// Bits needed to carry any Unicode scalar value (U+10FFFF < 2^21), plus
/// headroom for the sign and decryption noise.
const MESSAGE_HEADROOM_BITS: u32 = 24;

/// The CRT reconstruction used by decryption works on `i128`.
const MAX_DECODE_BITS: u32 = 126;

/// Scheme parameters shared by every party that encrypts or decrypts.
///
/// Two contexts only interoperate when all three fields are identical; the
/// context fingerprint covers them together with the derived moduli.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeParams {
    /// Degree N of the cyclotomic ring `Z_Q[X]/(X^N + 1)`.
    pub poly_degree: usize,
    /// Bit width of each prime in the coefficient modulus chain.
    pub coeff_mod_bits: Vec<u32>,
    /// log2 of the fixed-point scale applied to every slot value.
    pub scale_bits: u32,
}

impl Default for SchemeParams {
    fn default() -> Self {
        Self {
            poly_degree: 8192,
            coeff_mod_bits: vec![60, 40, 40, 60],
            scale_bits: 40,
        }
    }
}

impl SchemeParams {
    /// Number of real values one ciphertext block can carry (N/2).
    pub fn slot_count(&self) -> usize {
        self.poly_degree / 2
    }

    /// Global scale factor as a float.
    pub fn scale(&self) -> f64 {
        2f64.powi(self.scale_bits as i32)
    }

    /// Number of leading moduli used for CRT reconstruction at decryption.
    ///
    /// Takes the longest prefix of the chain whose product stays within
    /// `i128`, since a fresh ciphertext's message plus noise is far smaller
    /// than that.
    pub fn decode_moduli(&self) -> usize {
        let mut total = 0u32;
        let mut count = 0usize;
        for &bits in &self.coeff_mod_bits {
            if total + bits > MAX_DECODE_BITS {
                break;
            }
            total += bits;
            count += 1;
        }
        count
    }

    fn decode_bits(&self) -> u32 {
        self.coeff_mod_bits[..self.decode_moduli()].iter().sum()
    }

    /// Check the parameter set before any key material is derived from it.
    pub fn validate(&self) -> Result<(), CryptoError> {
        let n = self.poly_degree;
        if !n.is_power_of_two() || !(MIN_DEGREE..=MAX_DEGREE).contains(&n) {
            return Err(CryptoError::InvalidParams(format!(
                "poly_degree must be a power of two in [{MIN_DEGREE}, {MAX_DEGREE}], got {n}"
            )));
        }
        if self.coeff_mod_bits.len() < 2 {
            return Err(CryptoError::InvalidParams(
                "coeff_mod_bits needs at least two moduli".to_string(),
            ));
        }
        if let Some(bits) = self
            .coeff_mod_bits
            .iter()
            .find(|b| !(20..=61).contains(*b))
        {
            return Err(CryptoError::InvalidParams(format!(
                "modulus width {bits} outside supported range [20, 61]"
            )));
        }
        if !(8..=60).contains(&self.scale_bits) {
            return Err(CryptoError::InvalidParams(format!(
                "scale_bits {} outside supported range [8, 60]",
                self.scale_bits
            )));
        }
        let needed = self.scale_bits + MESSAGE_HEADROOM_BITS;
        if self.decode_bits() < needed {
            return Err(CryptoError::InvalidParams(format!(
                "decryption moduli provide {} bits, need at least {needed} for scale 2^{}",
                self.decode_bits(),
                self.scale_bits
            )));
        }
        Ok(())
    }

    /// Derive the modulus chain: one distinct prime `p ≡ 1 (mod 2N)` of exactly
    /// each requested width, searched downward from `2^bits`.
    ///
    /// The search is deterministic, so every party holding the same parameters
    /// derives the same chain.
    pub fn generate_moduli(&self) -> Result<Vec<u64>, CryptoError> {
        self.validate()?;
        let step = 2 * self.poly_degree as u64;
        let mut chosen: Vec<u64> = Vec::with_capacity(self.coeff_mod_bits.len());

        for &bits in &self.coeff_mod_bits {
            let upper = 1u64 << bits;
            let lower = 1u64 << (bits - 1);
            let mut k = (upper - 2) / step;
            let prime = loop {
                if k == 0 {
                    return Err(CryptoError::NoPrime { bits, degree: self.poly_degree });
                }
                let candidate = k * step + 1;
                if candidate < lower {
                    return Err(CryptoError::NoPrime { bits, degree: self.poly_degree });
                }
                if !chosen.contains(&candidate) && is_prime(candidate) {
                    break candidate;
                }
                k -= 1;
            };
            chosen.push(prime);
        }

        Ok(chosen)
    }

    /// Feed the parameters into a fingerprint hash.
    pub(crate) fn digest_into(&self, hasher: &mut Sha256) {
        hasher.update((self.poly_degree as u64).to_le_bytes());
        hasher.update((self.coeff_mod_bits.len() as u64).to_le_bytes());
        for bits in &self.coeff_mod_bits {
            hasher.update(bits.to_le_bytes());
        }
        hasher.update(self.scale_bits.to_le_bytes());
    }
}
