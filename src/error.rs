//! Top-level error type for the relay library.
//!
//! Each layer has its own error enum (`CryptoError`, `CodecError`,
//! `FramingError`, `ServiceError`); `RelayError` is what the server and the
//! client driver surface. The conversions below lift the variants callers
//! branch on (context mismatch, decode failure) to the top level instead of
//! burying them inside a wrapper.

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::CryptoError;
use crate::llm::ServiceError;
use crate::relay::FramingError;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Truncated, oversized or otherwise unreadable frame.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Ciphertext produced under a different encryption context.
    #[error("Context mismatch: ciphertext fingerprint {found}, context {expected}")]
    ContextMismatch { expected: String, found: String },

    /// A decrypted value is not a valid Unicode scalar value.
    #[error("Decode error at position {index}: {value} is not a code point")]
    Decode { index: usize, value: f64 },

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// The relay answered fewer chunks than were sent, or answered out of
    /// order.
    #[error("Relay failure: expected {expected} responses, received {received}")]
    RelayFailure { expected: usize, received: usize },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    /// A decrypted response was not a valid reply envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<CryptoError> for RelayError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::ContextMismatch { expected, found } => {
                RelayError::ContextMismatch { expected, found }
            }
            other => RelayError::Crypto(other),
        }
    }
}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Decode { index, value } => RelayError::Decode { index, value },
            CodecError::Crypto(inner) => inner.into(),
            other => RelayError::Codec(other.to_string()),
        }
    }
}
