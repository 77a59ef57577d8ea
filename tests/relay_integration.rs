//! End-to-end tests: real TCP relay, real client driver, fake LLM services.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

use hecrypt_relay::chunker;
use hecrypt_relay::codec;
use hecrypt_relay::config::{ClientConfig, RelayConfig, ServiceConfig};
use hecrypt_relay::crypto::{EncryptionContext, SchemeParams};
use hecrypt_relay::llm::{ChatRequest, LlmService, QueryAdapter, ServiceError};
use hecrypt_relay::models::Segment;
use hecrypt_relay::relay::{
    read_frame, write_frame, FramingError, RelayClient, RelayHandle, RelayServer,
    DEFAULT_MAX_FRAME_LEN,
};
use hecrypt_relay::RelayError;

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Fixtures
// =============================================================================

/// Returns the chunk text unchanged (the preamble is configured empty).
struct Echo;

#[async_trait]
impl LlmService for Echo {
    async fn generate(&self, request: &ChatRequest) -> Result<String, ServiceError> {
        Ok(request.messages[1].content.clone())
    }
}

/// Echoes, except that call number `fail_on` fails.
struct FailOnCall {
    fail_on: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl LlmService for FailOnCall {
    async fn generate(&self, request: &ChatRequest) -> Result<String, ServiceError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            return Err(ServiceError::Provider {
                status: 500,
                message: "internal error".to_string(),
            });
        }
        Ok(request.messages[1].content.clone())
    }
}

/// Signals when called, then waits `delay` before echoing.
struct Slow {
    called: Arc<Notify>,
    delay: Duration,
}

#[async_trait]
impl LlmService for Slow {
    async fn generate(&self, request: &ChatRequest) -> Result<String, ServiceError> {
        self.called.notify_one();
        tokio::time::sleep(self.delay).await;
        Ok(request.messages[1].content.clone())
    }
}

fn small_params() -> SchemeParams {
    SchemeParams {
        poly_degree: 256,
        coeff_mod_bits: vec![60, 40, 40],
        scale_bits: 30,
    }
}

fn context(params: SchemeParams, seed: u64) -> Arc<EncryptionContext> {
    Arc::new(EncryptionContext::create_with_rng(params, &mut StdRng::seed_from_u64(seed)).unwrap())
}

fn service_config() -> ServiceConfig {
    ServiceConfig {
        user_preamble: String::new(),
        ..ServiceConfig::default()
    }
}

fn relay_config() -> RelayConfig {
    RelayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..RelayConfig::default()
    }
}

async fn start_relay(
    ctx: Arc<EncryptionContext>,
    service: Arc<dyn LlmService>,
    config: RelayConfig,
) -> RelayHandle {
    let adapter = QueryAdapter::new(service, service_config());
    RelayServer::bind(config, ctx, adapter)
        .await
        .expect("Failed to bind relay")
        .spawn()
        .expect("Failed to start relay")
}

fn client_for(ctx: Arc<EncryptionContext>, addr: SocketAddr) -> RelayClient {
    RelayClient::new(
        ctx,
        ClientConfig {
            relay_addr: addr,
            connect_attempts: 1,
            ..ClientConfig::default()
        },
    )
}

/// Segment texts with the trailing newline the relay appends removed.
fn answer_texts(segments: &[Segment]) -> Vec<String> {
    segments
        .iter()
        .map(|seg| match seg {
            Segment::Answer { text } => text.trim_end_matches('\n').to_string(),
            Segment::Failed { reason, .. } => panic!("unexpected failure: {reason}"),
        })
        .collect()
}

/// Stream wrapper that moves at most `max` bytes per poll and returns
/// `Pending` on every other read, to exercise partial reads and writes.
struct Trickle<S> {
    inner: S,
    max: usize,
    stall: bool,
}

impl<S> Trickle<S> {
    fn new(inner: S, max: usize) -> Self {
        Self {
            inner,
            max,
            stall: false,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Trickle<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.stall = !this.stall;
        if this.stall {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        let mut small = vec![0u8; this.max.min(buf.remaining())];
        let mut limited = ReadBuf::new(&mut small);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                buf.put_slice(limited.filled());
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Trickle<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let len = buf.len().min(this.max);
        Pin::new(&mut this.inner).poll_write(cx, &buf[..len])
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_scenario_a_single_chunk_roundtrip_default_params() {
    let ctx = context(SchemeParams::default(), 1);
    let relay = start_relay(Arc::clone(&ctx), Arc::new(Echo), relay_config()).await;
    let client = client_for(ctx, relay.local_addr());

    let prompt = "Hello, Secure World!";
    let answer = timeout(TEST_TIMEOUT, client.ask(prompt))
        .await
        .expect("Test timed out")
        .expect("Ask failed");

    assert_eq!(answer.segments.len(), 1);
    assert_eq!(answer_texts(&answer.segments), vec![prompt.to_string()]);
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scenario_b_three_chunks_in_order() {
    let ctx = context(small_params(), 2);
    let relay = start_relay(Arc::clone(&ctx), Arc::new(Echo), relay_config()).await;
    let client = client_for(ctx, relay.local_addr());

    let prompt: String = (0..2500).map(|i| (b'a' + (i / 100 % 26) as u8) as char).collect();
    let answer = timeout(TEST_TIMEOUT, client.ask(&prompt))
        .await
        .expect("Test timed out")
        .expect("Ask failed");

    let texts = answer_texts(&answer.segments);
    let sizes: Vec<usize> = texts.iter().map(|t| t.chars().count()).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
    let joined = chunker::join(&texts);
    assert_eq!(joined.chars().count(), 2500);
    assert_eq!(joined, prompt);
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scenario_c_truncated_response_is_framing_error() {
    let ctx = context(small_params(), 3);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        stream.write_all(&100u64.to_be_bytes()).await.unwrap();
        stream.write_all(&[0u8; 50]).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let client = client_for(ctx, addr);
    let err = timeout(TEST_TIMEOUT, client.ask("Hello"))
        .await
        .expect("Client hung on a truncated frame")
        .unwrap_err();
    match err {
        RelayError::Framing(FramingError::TruncatedPayload { expected, received }) => {
            assert_eq!(expected, 100);
            assert_eq!(received, 50);
        }
        other => panic!("Expected FramingError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_scenario_d_partial_failure_is_visible() {
    let ctx = context(small_params(), 4);
    let service = Arc::new(FailOnCall {
        fail_on: 1,
        calls: AtomicUsize::new(0),
    });
    let relay = start_relay(Arc::clone(&ctx), service, relay_config()).await;
    let client = client_for(ctx, relay.local_addr());

    let prompt = format!("{}{}{}", "x".repeat(1000), "y".repeat(1000), "z".repeat(500));
    let answer = timeout(TEST_TIMEOUT, client.ask(&prompt))
        .await
        .expect("Test timed out")
        .expect("Ask failed");

    assert_eq!(answer.segments.len(), 3);
    assert_eq!(
        answer.segments[0],
        Segment::Answer { text: format!("{}\n", "x".repeat(1000)) }
    );
    assert_eq!(
        answer.segments[1],
        Segment::Failed {
            chunk: 1,
            reason: "provider returned HTTP 500: internal error".to_string()
        }
    );
    assert_eq!(
        answer.segments[2],
        Segment::Answer { text: format!("{}\n", "z".repeat(500)) }
    );
    assert_eq!(answer.failures().len(), 1);
    assert!(answer
        .text()
        .contains("[chunk 1 failed: provider returned HTTP 500: internal error]"));
    relay.shutdown().await.unwrap();
}

// =============================================================================
// Transport and session behaviour
// =============================================================================

#[tokio::test]
async fn test_fragmented_transport_preserves_frames() {
    let ctx = context(small_params(), 5);
    let relay = start_relay(Arc::clone(&ctx), Arc::new(Echo), relay_config()).await;
    let client = client_for(Arc::clone(&ctx), relay.local_addr());

    let prompt: String = "fragment ".repeat(250);
    let frames = client.encrypt_prompt(&prompt).await.unwrap();
    assert_eq!(frames.len(), 3);

    let stream = TcpStream::connect(relay.local_addr()).await.unwrap();
    let answer = timeout(TEST_TIMEOUT, client.exchange(Trickle::new(stream, 7), frames))
        .await
        .expect("Test timed out")
        .expect("Exchange failed");

    let expected: Vec<String> = chunker::split(&prompt)
        .into_iter()
        .map(|c| c.text.trim().to_string())
        .collect();
    assert_eq!(answer_texts(&answer.segments), expected);
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_sessions_get_their_own_answers() {
    let ctx = context(small_params(), 6);
    let relay = start_relay(Arc::clone(&ctx), Arc::new(Echo), relay_config()).await;
    let addr = relay.local_addr();

    let mut tasks = Vec::new();
    for i in 0..4 {
        let client = client_for(Arc::clone(&ctx), addr);
        tasks.push(tokio::spawn(async move {
            let prompt = format!("session-{i}-").repeat(150);
            let answer = client.ask(&prompt).await.expect("Ask failed");
            (prompt, answer)
        }));
    }

    for task in tasks {
        let (prompt, answer) = timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        let expected: Vec<String> = chunker::split(&prompt).into_iter().map(|c| c.text).collect();
        assert_eq!(answer_texts(&answer.segments), expected);
    }
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_foreign_context_aborts_session() {
    let relay_ctx = context(small_params(), 7);
    let relay = start_relay(relay_ctx, Arc::new(Echo), relay_config()).await;
    let client = client_for(context(small_params(), 8), relay.local_addr());

    let err = timeout(TEST_TIMEOUT, client.ask("who am I?"))
        .await
        .expect("Test timed out")
        .unwrap_err();
    assert!(
        matches!(err, RelayError::RelayFailure { expected: 1, received: 0 }),
        "got: {err}"
    );
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_foreign_context_multi_chunk_is_relay_failure() {
    let relay_ctx = context(small_params(), 7);
    let relay = start_relay(relay_ctx, Arc::new(Echo), relay_config()).await;
    let client = client_for(context(small_params(), 8), relay.local_addr());

    // The relay aborts with two request frames unread, so the close arrives
    // as a reset rather than an orderly EOF.
    for _ in 0..3 {
        let err = timeout(TEST_TIMEOUT, client.ask(&"x".repeat(3 * chunker::CHUNK_CHARS)))
            .await
            .expect("Test timed out")
            .unwrap_err();
        assert!(
            matches!(err, RelayError::RelayFailure { expected: 3, received: 0 }),
            "got: {err}"
        );
    }
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_public_only_client_cannot_read_replies() {
    let ctx = context(small_params(), 9);
    let relay = start_relay(Arc::clone(&ctx), Arc::new(Echo), relay_config()).await;
    let client = client_for(Arc::new(ctx.public_only()), relay.local_addr());

    let err = timeout(TEST_TIMEOUT, client.ask("hello"))
        .await
        .expect("Test timed out")
        .unwrap_err();
    assert!(matches!(err, RelayError::Crypto(_)), "got: {err}");
    relay.shutdown().await.unwrap();
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_aborts_in_flight_sessions() {
    let ctx = context(small_params(), 10);
    let called = Arc::new(Notify::new());
    let service = Arc::new(Slow {
        called: Arc::clone(&called),
        delay: Duration::from_secs(60),
    });
    let relay = start_relay(Arc::clone(&ctx), service, relay_config()).await;
    let addr = relay.local_addr();
    let client = client_for(ctx, addr);

    let ask = tokio::spawn(async move { client.ask("never answered").await });
    timeout(TEST_TIMEOUT, called.notified()).await.expect("Service never called");

    timeout(TEST_TIMEOUT, relay.shutdown())
        .await
        .expect("Shutdown hung")
        .unwrap();

    let err = timeout(TEST_TIMEOUT, ask).await.unwrap().unwrap().unwrap_err();
    assert!(
        matches!(err, RelayError::RelayFailure { expected: 1, received: 0 }),
        "got: {err}"
    );
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_aborts_multi_chunk_session() {
    let ctx = context(small_params(), 12);
    let called = Arc::new(Notify::new());
    let service = Arc::new(Slow {
        called: Arc::clone(&called),
        delay: Duration::from_secs(60),
    });
    let relay = start_relay(Arc::clone(&ctx), service, relay_config()).await;
    let client = client_for(ctx, relay.local_addr());

    let prompt = "y".repeat(3 * chunker::CHUNK_CHARS);
    let ask = tokio::spawn(async move { client.ask(&prompt).await });
    timeout(TEST_TIMEOUT, called.notified()).await.expect("Service never called");

    timeout(TEST_TIMEOUT, relay.shutdown())
        .await
        .expect("Shutdown hung")
        .unwrap();

    let err = timeout(TEST_TIMEOUT, ask).await.unwrap().unwrap().unwrap_err();
    assert!(
        matches!(err, RelayError::RelayFailure { expected: 3, received: 0 }),
        "got: {err}"
    );
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_sessions() {
    let ctx = context(small_params(), 11);
    let called = Arc::new(Notify::new());
    let service = Arc::new(Slow {
        called: Arc::clone(&called),
        delay: Duration::from_millis(300),
    });
    let config = RelayConfig {
        drain_on_shutdown: true,
        ..relay_config()
    };
    let relay = start_relay(Arc::clone(&ctx), service, config).await;
    let client = client_for(ctx, relay.local_addr());

    let ask = tokio::spawn(async move { client.ask("finish me").await });
    timeout(TEST_TIMEOUT, called.notified()).await.expect("Service never called");

    timeout(TEST_TIMEOUT, relay.shutdown())
        .await
        .expect("Shutdown hung")
        .unwrap();

    let answer = timeout(TEST_TIMEOUT, ask).await.unwrap().unwrap().unwrap();
    assert_eq!(answer_texts(&answer.segments), vec!["finish me".to_string()]);
}

// =============================================================================
// Connection limit
// =============================================================================

/// Counts calls, then waits `delay` before echoing.
struct Counting {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl LlmService for Counting {
    async fn generate(&self, request: &ChatRequest) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(request.messages[1].content.clone())
    }
}

#[tokio::test]
async fn test_max_connections_holds_back_second_session() {
    let ctx = context(small_params(), 13);
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Arc::new(Counting {
        calls: Arc::clone(&calls),
        delay: Duration::from_millis(200),
    });
    let config = RelayConfig {
        max_connections: 1,
        ..relay_config()
    };
    let relay = start_relay(Arc::clone(&ctx), service, config).await;
    let addr = relay.local_addr();

    // First session holds its connection open after the reply.
    let mut first = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut first, &codec::encrypt("first", &ctx).unwrap()).await.unwrap();
    let blob = timeout(TEST_TIMEOUT, read_frame(&mut first, DEFAULT_MAX_FRAME_LEN))
        .await
        .expect("Test timed out")
        .unwrap();
    assert!(!codec::decrypt(&blob, &ctx).unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second_client = client_for(Arc::clone(&ctx), addr);
    let second = tokio::spawn(async move { second_client.ask("second").await });

    // The second connection sits in the backlog while the first is open.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!second.is_finished());

    first.shutdown().await.unwrap();
    drop(first);

    let answer = timeout(TEST_TIMEOUT, second)
        .await
        .expect("Test timed out")
        .unwrap()
        .unwrap();
    assert_eq!(answer_texts(&answer.segments), vec!["second".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    relay.shutdown().await.unwrap();
}
