//! Ciphertext container and its wire serialization.
//!
//! A ciphertext holds one or more blocks; each block is a pair (c0, c1) of
//! RNS polynomials in the coefficient domain encrypting up to N/2 slots.
//! Serialization is bincode with fixed-width integers and a size limit, and
//! parsing checks every residue against the context's moduli.

use bincode::Options;
use serde::{Deserialize, Serialize};

use super::rns::RnsPoly;
use super::CryptoError;

/// Version tag written into every serialized ciphertext.
pub const CIPHERTEXT_VERSION: u16 = 1;

/// Identifies the context (parameters, moduli, public key) a ciphertext
/// belongs to.
pub type Fingerprint = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextBlock {
    pub c0: RnsPoly,
    pub c1: RnsPoly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    pub version: u16,
    /// Fingerprint of the producing context.
    pub fingerprint: Fingerprint,
    /// log2 of the scale the plaintext was encoded at.
    pub scale_bits: u32,
    /// Number of encrypted values across all blocks.
    pub len: u64,
    pub blocks: Vec<CiphertextBlock>,
}

fn options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(limit)
}

impl Ciphertext {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        options(u64::MAX)
            .serialize(self)
            .map_err(|e| CryptoError::Malformed(format!("serialize ciphertext: {e}")))
    }

    /// Parse a blob without checking it against any context. The limit is
    /// the blob length, so corrupt length fields cannot trigger large
    /// allocations.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let ct: Ciphertext = options(bytes.len() as u64)
            .deserialize(bytes)
            .map_err(|e| CryptoError::Malformed(format!("deserialize ciphertext: {e}")))?;
        if ct.version != CIPHERTEXT_VERSION {
            return Err(CryptoError::Malformed(format!(
                "unsupported ciphertext version {}",
                ct.version
            )));
        }
        Ok(ct)
    }

    /// Structural checks against the shape of a context.
    pub fn check_shape(&self, moduli: &[u64], n: usize, slots: usize) -> Result<(), CryptoError> {
        let expected_blocks = (self.len as usize).div_ceil(slots);
        if self.blocks.len() != expected_blocks {
            return Err(CryptoError::Malformed(format!(
                "{} blocks cannot hold {} values at {} slots per block",
                self.blocks.len(),
                self.len,
                slots
            )));
        }
        for (i, block) in self.blocks.iter().enumerate() {
            if !block.c0.is_well_formed(moduli, n) || !block.c1.is_well_formed(moduli, n) {
                return Err(CryptoError::Malformed(format!(
                    "block {i} has residues outside the modulus chain"
                )));
            }
        }
        Ok(())
    }
}
