//! Client driver: turns a prompt into encrypted frames, exchanges them with
//! the relay and assembles the decrypted answer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::framing::{read_length_prefix, read_payload, write_frame, FramingError};
use crate::chunker;
use crate::codec;
use crate::config::ClientConfig;
use crate::crypto::EncryptionContext;
use crate::error::RelayError;
use crate::models::{ChunkReply, RelayAnswer};

/// Connects to a relay and asks prompts, one connection per prompt.
///
/// # Example
///
/// ```ignore
/// let client = RelayClient::new(ctx, ClientConfig::default());
/// let answer = client.ask("What is the capital of France?").await?;
/// println!("{}", answer.text());
/// ```
pub struct RelayClient {
    ctx: Arc<EncryptionContext>,
    config: ClientConfig,
}

impl RelayClient {
    pub fn new(ctx: Arc<EncryptionContext>, config: ClientConfig) -> Self {
        Self { ctx, config }
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.config.relay_addr
    }

    /// Connect with exponential backoff: 100ms, 200ms, 400ms, ...
    ///
    /// # Errors
    ///
    /// Returns the last connection error if all attempts fail.
    pub async fn connect_with_retry(
        addr: SocketAddr,
        max_attempts: u32,
    ) -> Result<TcpStream, RelayError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < max_attempts => {
                    let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(8)));
                    warn!(%addr, attempt, error = %e, ?delay, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(RelayError::Io(e)),
            }
        }
    }

    /// Ask one prompt and wait for the complete answer.
    ///
    /// An empty prompt returns an empty answer without touching the network.
    ///
    /// # Errors
    ///
    /// - `RelayFailure` if the relay answers fewer frames than were sent or
    ///   answers out of order
    /// - `Framing` on a truncated or oversized response frame
    /// - `ContextMismatch` / `Decode` if a response does not decrypt
    /// - `Timeout` if the exchange exceeds the configured response timeout
    pub async fn ask(&self, prompt: &str) -> Result<RelayAnswer, RelayError> {
        let frames = self.encrypt_prompt(prompt).await?;
        if frames.is_empty() {
            return Ok(RelayAnswer::default());
        }
        let stream =
            Self::connect_with_retry(self.config.relay_addr, self.config.connect_attempts).await?;
        stream.set_nodelay(true)?;

        let limit = self.config.response_timeout();
        timeout(limit, self.exchange(stream, frames))
            .await
            .map_err(|_| RelayError::Timeout(limit))?
    }

    /// Split and encrypt a prompt into one frame payload per chunk.
    pub async fn encrypt_prompt(&self, prompt: &str) -> Result<Vec<Vec<u8>>, RelayError> {
        let chunks = chunker::split(prompt);
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = Arc::clone(&self.ctx);
        let frames = tokio::task::spawn_blocking(move || {
            chunks
                .iter()
                .map(|chunk| codec::encrypt(&chunk.text, &ctx))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| RelayError::Io(std::io::Error::other(e)))??;
        info!(chunks = frames.len(), "prompt encrypted");
        Ok(frames)
    }

    /// Send `frames` over `stream` and collect one reply per frame.
    ///
    /// Writing and reading run concurrently, so large frames cannot deadlock
    /// on full socket buffers.
    pub async fn exchange<S>(&self, stream: S, frames: Vec<Vec<u8>>) -> Result<RelayAnswer, RelayError>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let expected = frames.len();
        let (mut reader, mut writer) = tokio::io::split(stream);

        let send = async {
            for frame in &frames {
                write_frame(&mut writer, frame).await?;
            }
            writer.shutdown().await?;
            debug!(frames = expected, "all frames sent");
            Ok::<(), RelayError>(())
        };

        let receive = async {
            let mut answer = RelayAnswer::default();
            for received in 0..expected {
                let len = match read_length_prefix(&mut reader, self.config.max_frame_len).await {
                    Ok(Some(len)) => len,
                    Ok(None) => return Err(RelayError::RelayFailure { expected, received }),
                    Err(e) if closed_at_boundary(&e) => {
                        debug!(error = %e, received, "relay dropped the connection");
                        return Err(RelayError::RelayFailure { expected, received });
                    }
                    Err(e) => return Err(e.into()),
                };
                let blob = read_payload(&mut reader, len).await?;
                let reply = self.decrypt_reply(blob).await?;
                if reply.sequence != received as u64 {
                    warn!(
                        expected = received,
                        got = reply.sequence,
                        "reply out of order"
                    );
                    return Err(RelayError::RelayFailure { expected, received });
                }
                answer.segments.extend(reply.segments);
            }
            Ok::<RelayAnswer, RelayError>(answer)
        };

        // The receive side decides the outcome; a send still pending when it
        // finishes is dropped.
        tokio::pin!(send);
        tokio::pin!(receive);
        let mut sent = None;
        let answer = loop {
            tokio::select! {
                result = &mut send, if sent.is_none() => sent = Some(result),
                answer = &mut receive => break answer?,
            }
        };
        if let Some(Err(e)) = sent {
            return Err(e);
        }
        if !answer.is_complete() {
            warn!(failed = answer.failures().len(), "answer has failed chunks");
        }
        Ok(answer)
    }

    async fn decrypt_reply(&self, blob: Vec<u8>) -> Result<ChunkReply, RelayError> {
        let ctx = Arc::clone(&self.ctx);
        let text = tokio::task::spawn_blocking(move || codec::decrypt(&blob, &ctx))
            .await
            .map_err(|e| RelayError::Io(std::io::Error::other(e)))??;
        ChunkReply::from_json(&text)
            .map_err(|e| RelayError::Protocol(format!("invalid reply envelope: {e}")))
    }
}

/// A relay that aborts a session with request frames still unread closes
/// with a reset rather than a FIN.
fn closed_at_boundary(err: &FramingError) -> bool {
    match err {
        FramingError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SchemeParams;
    use crate::models::Segment;
    use crate::relay::framing::{read_frame, DEFAULT_MAX_FRAME_LEN};
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    /// Reports `ConnectionReset` where the inner stream would report EOF, the
    /// way a TCP peer that closes with unread data does.
    struct ResetOnClose<S>(S);

    impl<S: AsyncRead + Unpin> AsyncRead for ResetOnClose<S> {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let before = buf.filled().len();
            match Pin::new(&mut self.get_mut().0).poll_read(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                    Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
                }
                other => other,
            }
        }
    }

    impl<S: AsyncWrite + Unpin> AsyncWrite for ResetOnClose<S> {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
        }
    }

    fn client() -> RelayClient {
        let params = SchemeParams {
            poly_degree: 256,
            coeff_mod_bits: vec![60, 40, 40],
            scale_bits: 30,
        };
        let ctx = EncryptionContext::create_with_rng(params, &mut StdRng::seed_from_u64(17)).unwrap();
        RelayClient::new(Arc::new(ctx), ClientConfig::default())
    }

    fn reply(ctx: &EncryptionContext, sequence: u64, text: &str) -> Vec<u8> {
        let reply = ChunkReply {
            sequence,
            segments: vec![Segment::Answer { text: text.to_string() }],
        };
        codec::encrypt(&reply.to_json().unwrap(), ctx).unwrap()
    }

    #[tokio::test]
    async fn test_empty_prompt_skips_network() {
        // Nothing listens on the configured address; an empty prompt must not
        // try to connect.
        let answer = client().ask("").await.unwrap();
        assert!(answer.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_collects_replies_in_order() {
        let client = client();
        let ctx = Arc::clone(&client.ctx);
        let frames = client.encrypt_prompt("ab").await.unwrap();
        let (local, mut remote) = duplex(1 << 16);

        let relay = tokio::spawn(async move {
            let blob = read_frame(&mut remote, DEFAULT_MAX_FRAME_LEN).await.unwrap();
            assert_eq!(codec::decrypt(&blob, &ctx).unwrap(), "ab");
            write_frame(&mut remote, &reply(&ctx, 0, "answer")).await.unwrap();
        });

        let answer = client.exchange(local, frames).await.unwrap();
        relay.await.unwrap();
        assert_eq!(answer.text(), "answer");
    }

    #[tokio::test]
    async fn test_missing_reply_is_relay_failure() {
        let client = client();
        let ctx = Arc::clone(&client.ctx);
        let frames = vec![
            codec::encrypt("one", &ctx).unwrap(),
            codec::encrypt("two", &ctx).unwrap(),
        ];
        let (local, mut remote) = duplex(1 << 16);

        tokio::spawn(async move {
            let _ = read_frame(&mut remote, DEFAULT_MAX_FRAME_LEN).await;
            let _ = read_frame(&mut remote, DEFAULT_MAX_FRAME_LEN).await;
            write_frame(&mut remote, &reply(&ctx, 0, "only one")).await.unwrap();
        });

        let err = client.exchange(local, frames).await.unwrap_err();
        assert!(
            matches!(err, RelayError::RelayFailure { expected: 2, received: 1 }),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn test_out_of_order_reply_is_relay_failure() {
        let client = client();
        let ctx = Arc::clone(&client.ctx);
        let frames = vec![
            codec::encrypt("one", &ctx).unwrap(),
            codec::encrypt("two", &ctx).unwrap(),
        ];
        let (local, mut remote) = duplex(1 << 16);

        tokio::spawn(async move {
            let _ = read_frame(&mut remote, DEFAULT_MAX_FRAME_LEN).await;
            let _ = read_frame(&mut remote, DEFAULT_MAX_FRAME_LEN).await;
            write_frame(&mut remote, &reply(&ctx, 1, "second")).await.unwrap();
            write_frame(&mut remote, &reply(&ctx, 0, "first")).await.unwrap();
        });

        let err = client.exchange(local, frames).await.unwrap_err();
        assert!(
            matches!(err, RelayError::RelayFailure { expected: 2, received: 0 }),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn test_reset_between_replies_is_relay_failure() {
        let client = client();
        let ctx = Arc::clone(&client.ctx);
        let frames: Vec<Vec<u8>> = ["one", "two", "three"]
            .iter()
            .map(|text| codec::encrypt(text, &ctx).unwrap())
            .collect();
        let (local, mut remote) = duplex(1 << 16);

        tokio::spawn(async move {
            let _ = read_frame(&mut remote, DEFAULT_MAX_FRAME_LEN).await;
            write_frame(&mut remote, &reply(&ctx, 0, "first")).await.unwrap();
        });

        let err = client.exchange(ResetOnClose(local), frames).await.unwrap_err();
        assert!(
            matches!(err, RelayError::RelayFailure { expected: 3, received: 1 }),
            "got: {err}"
        );
    }

    #[test]
    fn test_only_clean_resets_count_as_boundary_close() {
        assert!(closed_at_boundary(&FramingError::Io(io::ErrorKind::ConnectionReset.into())));
        assert!(closed_at_boundary(&FramingError::Io(io::ErrorKind::UnexpectedEof.into())));
        assert!(!closed_at_boundary(&FramingError::Io(io::ErrorKind::PermissionDenied.into())));
        assert!(!closed_at_boundary(&FramingError::TruncatedHeader { received: 3 }));
    }

    #[tokio::test]
    async fn test_truncated_reply_is_framing_error() {
        let client = client();
        let frames = vec![codec::encrypt("one", &client.ctx).unwrap()];
        let (local, mut remote) = duplex(1 << 16);

        tokio::spawn(async move {
            let _ = read_frame(&mut remote, DEFAULT_MAX_FRAME_LEN).await;
            remote.write_all(&500u64.to_be_bytes()).await.unwrap();
            remote.write_all(b"partial").await.unwrap();
        });

        let err = client.exchange(local, frames).await.unwrap_err();
        assert!(
            matches!(err, RelayError::Framing(FramingError::TruncatedPayload { .. })),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn test_connect_retry_gives_up() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = RelayClient::connect_with_retry(addr, 2).await.unwrap_err();
        assert!(matches!(err, RelayError::Io(_)));
    }
}
