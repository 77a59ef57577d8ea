//! Length-prefixed message framing over byte streams.
//!
//! # Wire Format
//!
//! ```text
//! +----------------------------+---------------------+
//! | length: u64, big-endian    | payload: length B   |
//! +----------------------------+---------------------+
//! ```
//!
//! The payload is read in pieces of at most [`READ_PIECE`] bytes until the
//! announced length has arrived, so frames survive arbitrary fragmentation by
//! the transport.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 8;

/// Largest single read while collecting a payload.
pub const READ_PIECE: usize = 4096;

/// Default upper bound on an accepted payload (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Most a payload buffer reserves before any payload bytes have arrived.
const INITIAL_RESERVE: usize = READ_PIECE * 16;

#[derive(Debug, Error)]
pub enum FramingError {
    /// The peer closed the stream before sending a frame.
    #[error("Connection closed by peer")]
    Closed,

    #[error("Connection closed after {received} of 8 header bytes")]
    TruncatedHeader { received: usize },

    #[error("Connection closed after {received} of {expected} payload bytes")]
    TruncatedPayload { expected: u64, received: u64 },

    #[error("Frame length {len} exceeds maximum {max} bytes")]
    Oversized { len: u64, max: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one frame: header, payload, flush.
///
/// Takes the writer by `&mut`, so two frames can never interleave on one
/// stream.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_length_prefix(writer, payload.len() as u64).await?;
    write_payload(writer, payload).await
}

pub async fn write_length_prefix<W>(writer: &mut W, len: u64) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&len.to_be_bytes()).await?;
    Ok(())
}

/// Write the payload that follows a length prefix and flush.
pub async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A stream that ends anywhere, including before the header,
/// is an error.
pub async fn read_frame<R>(reader: &mut R, max_len: u64) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_frame_or_eof(reader, max_len)
        .await?
        .ok_or(FramingError::Closed)
}

/// Read one frame, returning `None` if the stream ends cleanly before the
/// first header byte.
///
/// # Errors
///
/// - `TruncatedHeader` / `TruncatedPayload` on EOF mid-frame
/// - `Oversized` when the announced length exceeds `max_len`; nothing is
///   allocated for the payload in that case
pub async fn read_frame_or_eof<R>(
    reader: &mut R,
    max_len: u64,
) -> Result<Option<Vec<u8>>, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match read_length_prefix(reader, max_len).await? {
        Some(len) => read_payload(reader, len).await.map(Some),
        None => Ok(None),
    }
}

/// Read the 8-byte length prefix and check it against `max_len`.
pub async fn read_length_prefix<R>(reader: &mut R, max_len: u64) -> Result<Option<u64>, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FramingError::TruncatedHeader { received: filled });
        }
        filled += n;
    }

    let len = u64::from_be_bytes(header);
    if len > max_len {
        return Err(FramingError::Oversized { len, max: max_len });
    }
    Ok(Some(len))
}

/// Collect exactly `len` payload bytes in pieces of at most [`READ_PIECE`].
///
/// The buffer grows with the data actually received, so an announced length
/// alone never commits more than a small reservation.
pub async fn read_payload<R>(reader: &mut R, len: u64) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let expected = len as usize;
    let mut payload = Vec::with_capacity(expected.min(INITIAL_RESERVE));
    let mut piece = [0u8; READ_PIECE];
    while payload.len() < expected {
        let want = (expected - payload.len()).min(READ_PIECE);
        let n = reader.read(&mut piece[..want]).await?;
        if n == 0 {
            return Err(FramingError::TruncatedPayload {
                expected: len,
                received: payload.len() as u64,
            });
        }
        payload.extend_from_slice(&piece[..n]);
    }
    Ok(payload)
}
