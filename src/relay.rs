//! Network side of the relay: frame I/O, the relay server and the client
//! driver.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   8-byte BE length + ciphertext   ┌───────────────┐   plaintext   ┌─────┐
//! │  RelayClient  │ ◄───────────────────────────────► │  RelayServer  │ ◄───────────► │ LLM │
//! └───────────────┘            TCP socket             └───────────────┘   (HTTPS)     └─────┘
//! ```
//!
//! One prompt is split into chunks of at most 1000 characters; each chunk
//! travels as one request frame and is answered by exactly one response
//! frame, in order, on the same connection.

mod client;
mod framing;
mod server;

pub use client::RelayClient;
pub use framing::{
    read_frame, read_frame_or_eof, read_length_prefix, read_payload, write_frame,
    write_length_prefix, write_payload, FramingError, DEFAULT_MAX_FRAME_LEN, HEADER_LEN,
    READ_PIECE,
};
pub use server::{serve_connection, RelayHandle, RelayServer, SessionContext, SessionEnd, SessionState};
