//! Approximate-arithmetic (CKKS) encryption over real vectors.
//!
//! # Architecture
//!
//! ```text
//! SchemeParams ──► generate_moduli ──► NttTable per prime
//!                                           │
//! &[f64] ──► SlotEncoder::encode ──► RnsPoly (m) ──► encrypt ──► Ciphertext
//!                                                                    │
//! Vec<f64> ◄── SlotEncoder::decode ◄── crt_centered ◄── decrypt ◄────┘
//! ```
//!
//! Only fresh encryption and decryption are supported. No homomorphic
//! evaluation happens anywhere in the relay, so there is no relinearization
//! or rescaling machinery.
//!
//! # Usage
//!
//! ```ignore
//! use hecrypt_relay::crypto::{EncryptionContext, SchemeParams};
//!
//! let ctx = EncryptionContext::create(SchemeParams::default())?;
//! let ct = ctx.encrypt_values(&[72.0, 105.0])?;
//! let values = ctx.decrypt_values(&ct)?;
//! ```

mod ciphertext;
mod context;
mod encoding;
mod ntt;
mod params;
mod rns;
mod sampling;

use thiserror::Error;

pub use ciphertext::{Ciphertext, CiphertextBlock, Fingerprint, CIPHERTEXT_VERSION};
pub use context::EncryptionContext;
pub use params::{SchemeParams, MAX_DEGREE, MIN_DEGREE};
pub use rns::RnsPoly;

/// Errors from the encryption layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid scheme parameters: {0}")]
    InvalidParams(String),

    #[error("No {bits}-bit NTT-friendly prime for degree {degree}")]
    NoPrime { bits: u32, degree: usize },

    #[error("Invalid plaintext: {0}")]
    InvalidPlaintext(String),

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),

    /// The ciphertext was produced under a different context.
    #[error("Context mismatch: ciphertext fingerprint {found}, context {expected}")]
    ContextMismatch { expected: String, found: String },

    #[error("Context holds no secret key")]
    MissingSecretKey,

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
