//! Encrypted prompt relay.
//!
//! A client encrypts a prompt under a CKKS context and sends it to the relay
//! over TCP; the relay decrypts it, asks an LLM service, and returns the
//! answer encrypted under the same context.
//!
//! - `crypto` - CKKS scheme: parameters, keys, encryption, key files
//! - `codec` - text ↔ ciphertext
//! - `chunker` - prompt splitting and answer joining
//! - `relay` - frame I/O, relay server, client driver
//! - `llm` - LLM service trait, HTTP implementation, query adapter
//! - `models` - reply envelope shared by both ends
//! - `config` - JSON configuration
//!
//! ```ignore
//! use std::sync::Arc;
//! use hecrypt_relay::config::ClientConfig;
//! use hecrypt_relay::crypto::EncryptionContext;
//! use hecrypt_relay::relay::RelayClient;
//!
//! let ctx = Arc::new(EncryptionContext::load(&key_path)?);
//! let client = RelayClient::new(ctx, ClientConfig::default());
//! let answer = client.ask("Summarize the CKKS scheme").await?;
//! ```

pub mod chunker;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod llm;
pub mod models;
pub mod relay;

pub use error::RelayError;
