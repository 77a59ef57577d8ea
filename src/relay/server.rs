//! Relay server: accepts connections, decrypts prompt frames, queries the
//! LLM and answers each frame with one encrypted reply.
//!
//! Each connection runs as its own task. Within a connection frames are
//! handled strictly one at a time, so replies leave in the order requests
//! arrived.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::framing::{
    read_length_prefix, read_payload, write_length_prefix, write_payload, FramingError,
};
use crate::chunker;
use crate::codec;
use crate::config::RelayConfig;
use crate::crypto::EncryptionContext;
use crate::error::RelayError;
use crate::llm::QueryAdapter;
use crate::models::{ChunkReply, Segment};

/// Steps of a relay session, logged at debug level as they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    ReadLengthPrefix,
    ReadPayload,
    Decrypt,
    RouteToService,
    Aggregate,
    Encrypt,
    WriteLengthPrefix,
    WritePayload,
    Closed,
}

/// Everything a session needs, shared by all connections.
#[derive(Clone)]
pub struct SessionContext {
    pub ctx: Arc<EncryptionContext>,
    pub adapter: QueryAdapter,
    pub config: RelayConfig,
}

/// Why a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Peer closed the connection between frames.
    Closed { frames: u64 },
    /// Session aborted; no reply was sent for the frame in progress.
    Failed { frames: u64, error: RelayError },
}

struct Session<'a> {
    shared: &'a SessionContext,
    state: SessionState,
}

impl Session<'_> {
    fn enter(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "session transition");
        self.state = state;
    }
}

/// Run one session over `stream` until the peer closes it or an error
/// ends it.
pub async fn serve_connection<S>(stream: S, shared: &SessionContext) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;
    let mut session = Session {
        shared,
        state: SessionState::Accepted,
    };
    let mut frames = 0u64;
    loop {
        match session.next_frame(&mut stream, frames).await {
            Ok(true) => frames += 1,
            Ok(false) => {
                session.enter(SessionState::Closed);
                return SessionEnd::Closed { frames };
            }
            Err(error) => {
                warn!(state = ?session.state, %error, "session aborted");
                session.enter(SessionState::Closed);
                return SessionEnd::Failed { frames, error };
            }
        }
    }
}

impl Session<'_> {
    /// Handle one request frame. Returns `Ok(false)` on a clean close.
    async fn next_frame<S>(&mut self, stream: &mut S, sequence: u64) -> Result<bool, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let shared = self.shared;
        let config = &shared.config;
        let read_timeout = config.read_timeout();

        self.enter(SessionState::ReadLengthPrefix);
        let len = match timeout(read_timeout, read_length_prefix(stream, config.max_frame_len))
            .await
            .map_err(|_| RelayError::Timeout(read_timeout))??
        {
            Some(len) => len,
            None => return Ok(false),
        };

        self.enter(SessionState::ReadPayload);
        let blob = timeout(read_timeout, read_payload(stream, len))
            .await
            .map_err(|_| RelayError::Timeout(read_timeout))??;

        self.enter(SessionState::Decrypt);
        let ctx = Arc::clone(&shared.ctx);
        let prompt = tokio::task::spawn_blocking(move || codec::decrypt(&blob, &ctx))
            .await
            .map_err(|e| RelayError::Io(std::io::Error::other(e)))??;

        self.enter(SessionState::RouteToService);
        let segments = self.route(&prompt, sequence as usize).await;

        self.enter(SessionState::Aggregate);
        let reply = ChunkReply { sequence, segments }
            .to_json()
            .map_err(|e| RelayError::Protocol(e.to_string()))?;

        self.enter(SessionState::Encrypt);
        let ctx = Arc::clone(&shared.ctx);
        let response = tokio::task::spawn_blocking(move || codec::encrypt(&reply, &ctx))
            .await
            .map_err(|e| RelayError::Io(std::io::Error::other(e)))??;

        self.enter(SessionState::WriteLengthPrefix);
        write_length_prefix(stream, response.len() as u64).await?;
        self.enter(SessionState::WritePayload);
        write_payload(stream, &response).await?;

        debug!(sequence, bytes = response.len(), "reply sent");
        Ok(true)
    }

    /// Query every piece of the frame's prompt. A failed call becomes a
    /// failure segment tagged with `chunk`; it never aborts the session.
    async fn route(&self, prompt: &str, chunk: usize) -> Vec<Segment> {
        let mut segments = Vec::new();
        for piece in chunker::split(prompt) {
            match self.shared.adapter.query(&piece.text).await {
                Ok(answer) => segments.push(Segment::Answer {
                    text: format!("{answer}\n"),
                }),
                Err(e) => {
                    warn!(chunk, piece = piece.index, error = %e, "service call failed");
                    segments.push(Segment::Failed {
                        chunk,
                        reason: e.to_string(),
                    });
                }
            }
        }
        segments
    }
}

/// TCP front end of the relay.
pub struct RelayServer {
    listener: TcpListener,
    shared: SessionContext,
}

impl RelayServer {
    /// Bind the listener. The context must hold the secret key, since the
    /// relay decrypts every prompt.
    pub async fn bind(
        config: RelayConfig,
        ctx: Arc<EncryptionContext>,
        adapter: QueryAdapter,
    ) -> Result<Self, RelayError> {
        if !ctx.can_decrypt() {
            return Err(RelayError::Config(
                "relay needs an encryption context with a secret key".to_string(),
            ));
        }
        if config.max_connections == 0 {
            return Err(RelayError::Config("max_connections must be positive".to_string()));
        }
        let listener = TcpListener::bind(config.listen_addr).await?;
        info!(addr = %listener.local_addr()?, fingerprint = %ctx.fingerprint_hex(), "relay listening");
        Ok(Self {
            listener,
            shared: SessionContext {
                ctx,
                adapter,
                config,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves, then stop accepting and
    /// either abort or drain the in-flight sessions.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let RelayServer { listener, shared } = self;
        let limit = Arc::new(Semaphore::new(shared.config.max_connections));
        let mut sessions: JoinSet<()> = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            while sessions.try_join_next().is_some() {}

            let shared = shared.clone();
            let span = tracing::info_span!("session", %peer);
            sessions.spawn(
                async move {
                    let _permit = permit;
                    info!("connection accepted");
                    log_session_end(serve_connection(stream, &shared).await);
                }
                .instrument(span),
            );
        }

        drop(listener);
        if shared.config.drain_on_shutdown {
            info!(in_flight = sessions.len(), "relay stopping, draining sessions");
        } else {
            info!(in_flight = sessions.len(), "relay stopping, aborting sessions");
            sessions.abort_all();
        }
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "session task panicked");
                }
            }
        }
        info!("relay stopped");
        Ok(())
    }

    /// Run the relay on a background task.
    pub fn spawn(self) -> Result<RelayHandle, RelayError> {
        let addr = self.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            let _ = rx.await;
        }));
        Ok(RelayHandle {
            addr,
            shutdown: tx,
            task,
        })
    }
}

fn log_session_end(end: SessionEnd) {
    match end {
        SessionEnd::Closed { frames } => info!(frames, "connection closed"),
        SessionEnd::Failed { frames, error } => match &error {
            RelayError::Framing(FramingError::Io(_)) | RelayError::Io(_) => {
                warn!(frames, %error, "connection lost")
            }
            _ => error!(frames, %error, "session failed"),
        },
    }
}

/// Handle to a relay running on a background task.
pub struct RelayHandle {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), RelayError>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and wait for the relay task to finish.
    pub async fn shutdown(self) -> Result<(), RelayError> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| RelayError::Io(std::io::Error::other(e)))?
    }
}
