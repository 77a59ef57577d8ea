//! Text ↔ ciphertext conversion.
//!
//! A string is encrypted as the real vector of its Unicode code points, one
//! slot per `char`. Decryption rounds each slot back to the nearest integer
//! and rejects anything that is not a Unicode scalar value, so a corrupted or
//! foreign ciphertext fails loudly instead of producing garbage text.

use thiserror::Error;
use tracing::trace;

use crate::crypto::{Ciphertext, CryptoError, EncryptionContext};

/// Maximum number of blocks in one ciphertext. With the default parameters
/// this gives 16 × 4096 characters per frame.
pub const MAX_CIPHERTEXT_BLOCKS: usize = 16;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{chars} characters exceed ciphertext capacity of {capacity}")]
    CapacityExceeded { chars: usize, capacity: usize },

    #[error("Value {value} at position {index} is not a Unicode code point")]
    Decode { index: usize, value: f64 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Number of characters one ciphertext can carry under `ctx`.
pub fn capacity(ctx: &EncryptionContext) -> usize {
    ctx.slot_count() * MAX_CIPHERTEXT_BLOCKS
}

/// Encrypt `text` and return the serialized ciphertext.
pub fn encrypt(text: &str, ctx: &EncryptionContext) -> Result<Vec<u8>, CodecError> {
    let values: Vec<f64> = text.chars().map(|c| u32::from(c) as f64).collect();
    let capacity = capacity(ctx);
    if values.len() > capacity {
        return Err(CodecError::CapacityExceeded {
            chars: values.len(),
            capacity,
        });
    }
    let blob = ctx.encrypt_values(&values)?.to_bytes()?;
    trace!(chars = values.len(), bytes = blob.len(), "encrypted text");
    Ok(blob)
}

/// Decrypt a serialized ciphertext back to text.
pub fn decrypt(blob: &[u8], ctx: &EncryptionContext) -> Result<String, CodecError> {
    let ct = Ciphertext::from_bytes(blob)?;
    let capacity = capacity(ctx);
    if ct.len as usize > capacity {
        return Err(CodecError::CapacityExceeded {
            chars: ct.len as usize,
            capacity,
        });
    }
    let values = ctx.decrypt_values(&ct)?;
    values
        .iter()
        .enumerate()
        .map(|(index, &value)| to_char(value).ok_or(CodecError::Decode { index, value }))
        .collect()
}

fn to_char(value: f64) -> Option<char> {
    if !value.is_finite() {
        return None;
    }
    let rounded = value.round();
    if !(0.0..=f64::from(u32::from(char::MAX))).contains(&rounded) {
        return None;
    }
    // Surrogates fail here.
    char::from_u32(rounded as u32)
}
