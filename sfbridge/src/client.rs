//! RPC client: typed async calls multiplexed over one worker channel.
//!
//! Each call gets a fresh [`CallId`], registers a pending entry, posts its
//! request and waits for the response carrying the same id. Calls never block
//! each other on this side; the worker serves them in arrival order.
//!
//! ```text
//! caller ──call()──► pending.insert(id) ──post──► worker
//!    ▲                                              │
//!    └──── oneshot ◄── route(Response{id}) ◄────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{RwLock, oneshot};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{CallId, Command, Outcome, Reply, Request, Response};
use crate::bridge::transport::{
    Backend, ChannelError, ChannelEvent, SpawnError, WorkerChannel, WorkerImage, create_channel,
};
use crate::config::BridgeConfig;
use crate::engine::{MmlOutput, SoundfontInfo};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The worker answered with an error; the text is the worker's.
    #[error("{0}")]
    Remote(String),

    #[error("client disposed")]
    Disposed,

    #[error("worker exited before responding")]
    WorkerExited,

    #[error("failed to send request: {0}")]
    Channel(#[from] ChannelError),

    #[error("unexpected '{actual}' reply to {command}")]
    UnexpectedReply {
        command: &'static str,
        actual: &'static str,
    },
}

type CallResult = Result<Reply, ClientError>;

/// Outstanding calls keyed by id, shared with the message handler.
#[derive(Default)]
struct Router {
    pending: DashMap<CallId, oneshot::Sender<CallResult>>,
    closed: AtomicBool,
}

impl Router {
    fn route(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(Response { id, outcome }) => {
                let Some((_, tx)) = self.pending.remove(&id) else {
                    tracing::warn!(%id, "Response for unknown call id, dropping");
                    return;
                };
                let result = match outcome {
                    Outcome::Result(reply) => Ok(reply),
                    Outcome::Error(message) => Err(ClientError::Remote(message)),
                };
                if tx.send(result).is_err() {
                    tracing::debug!(%id, "Caller stopped waiting, dropping response");
                }
            }
            ChannelEvent::Malformed { id, reason } => {
                tracing::warn!(?id, %reason, "Malformed response, dropping");
            }
            ChannelEvent::Closed => {
                self.closed.store(true, Ordering::SeqCst);
                let failed = self.fail_all(|| ClientError::WorkerExited);
                if failed > 0 {
                    tracing::error!(failed, "Worker exited with calls outstanding");
                } else {
                    tracing::debug!("Worker channel closed");
                }
            }
        }
    }

    /// Reject every outstanding call. Returns how many were rejected.
    fn fail_all(&self, error: impl Fn() -> ClientError) -> usize {
        let ids: Vec<CallId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(error()));
                failed += 1;
            }
        }
        failed
    }
}

/// Removes a call's pending entry when the call future goes away, whether it
/// settled, failed to post, or was dropped by its caller.
struct PendingGuard<'a> {
    router: &'a Router,
    id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.router.pending.remove(&self.id).is_some() {
            tracing::debug!(id = %self.id, "Call abandoned before its response");
        }
    }
}

/// Client for a soundfont rendering worker.
///
/// Owns exactly one worker for its whole life. Dropping the client
/// terminates the worker; [`RenderClient::dispose`] does so explicitly and
/// also rejects any outstanding calls.
pub struct RenderClient {
    channel: RwLock<Option<WorkerChannel>>,
    router: Arc<Router>,
    next_id: AtomicU64,
    backend: Backend,
    shutdown: CancellationToken,
}

impl RenderClient {
    /// Start a worker from `image` and connect to it.
    pub async fn start(image: WorkerImage, config: &BridgeConfig) -> Result<Self, SpawnError> {
        let channel = create_channel(image, config).await?;
        Self::with_channel(channel).map_err(|e| SpawnError::Other(e.to_string()))
    }

    /// Wrap an already-running channel. Must be called within a tokio runtime.
    ///
    /// Fails with [`ChannelError::HandlerRegistered`] if something else
    /// already consumes the channel's responses.
    pub fn with_channel(mut channel: WorkerChannel) -> Result<Self, ChannelError> {
        let router = Arc::new(Router::default());
        let handler_router = Arc::clone(&router);
        channel.on_message(move |event| handler_router.route(event))?;

        Ok(Self {
            backend: channel.backend(),
            channel: RwLock::new(Some(channel)),
            router,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Number of calls sent and not yet settled.
    pub fn pending_calls(&self) -> usize {
        self.router.pending.len()
    }

    /// Load a soundfont in the worker. Must succeed before [`info`](Self::info)
    /// or [`compute`](Self::compute).
    pub async fn init(&self, soundfont: impl Into<Bytes>) -> Result<(), ClientError> {
        let command = Command::Init {
            soundfont: soundfont.into(),
        };
        match self.call(command).await? {
            Reply::Initialized => Ok(()),
            other => Err(unexpected("init", &other)),
        }
    }

    pub async fn info(&self) -> Result<SoundfontInfo, ClientError> {
        match self.call(Command::Info {}).await? {
            Reply::Info(info) => Ok(info),
            other => Err(unexpected("info", &other)),
        }
    }

    /// Render a Standard MIDI File to WAV.
    pub async fn compute(&self, smf: impl Into<Bytes>) -> Result<Bytes, ClientError> {
        match self.call(Command::Compute { smf: smf.into() }).await? {
            Reply::Wav { wav } => Ok(wav),
            other => Err(unexpected("compute", &other)),
        }
    }

    /// Compile MML. Compile errors come back as [`MmlOutput::Errors`], not as a failure.
    pub async fn mml_to_smf(&self, mml: impl Into<String>) -> Result<MmlOutput, ClientError> {
        match self.call(Command::MmlToSmf { mml: mml.into() }).await? {
            Reply::Smf { smf } => Ok(MmlOutput::Smf(smf)),
            Reply::MmlErrors { errors } => Ok(MmlOutput::Errors(errors)),
            other => Err(unexpected("mml_to_smf", &other)),
        }
    }

    pub async fn smf_to_mml(&self, smf: impl Into<Bytes>) -> Result<String, ClientError> {
        match self.call(Command::SmfToMml { smf: smf.into() }).await? {
            Reply::Mml { mml } => Ok(mml),
            other => Err(unexpected("smf_to_mml", &other)),
        }
    }

    /// Reject outstanding calls with [`ClientError::Disposed`] and stop the worker.
    /// Later calls fail with the same error. Idempotent.
    ///
    /// Sends blocked on a worker that stopped reading are abandoned first, so
    /// this returns within the configured terminate grace.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let Some(mut channel) = self.channel.write().await.take() else {
            return;
        };
        let rejected = self.router.fail_all(|| ClientError::Disposed);
        tracing::info!(backend = %self.backend, rejected, "Disposing worker");
        channel.terminate().await;
    }

    async fn call(&self, command: Command) -> CallResult {
        let id = CallId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let kind = command.kind();
        let (tx, rx) = oneshot::channel();
        self.router.pending.insert(id, tx);
        let _pending = PendingGuard {
            router: &self.router,
            id,
        };

        if let Err(e) = self.post(Request { id, command }).await {
            tracing::debug!(%id, kind, error = %e, "Request not sent");
            return Err(e);
        }
        tracing::trace!(%id, kind, "Request sent");

        // A dropped sender means the entry was removed without settling.
        rx.await.unwrap_or(Err(ClientError::WorkerExited))
    }

    async fn post(&self, request: Request) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Disposed);
        }
        let guard = self.channel.read().await;
        let channel = guard.as_ref().ok_or(ClientError::Disposed)?;
        // Checked after the pending insert: a close that raced ahead has
        // either drained this entry already or set the flag.
        if self.router.closed.load(Ordering::SeqCst) {
            return Err(ClientError::WorkerExited);
        }
        // The read guard must not outlive a dispose, which needs the write lock.
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ClientError::Disposed),
            sent = channel.post(request) => sent.map_err(Into::into),
        }
    }
}

fn unexpected(command: &'static str, reply: &Reply) -> ClientError {
    ClientError::UnexpectedReply {
        command,
        actual: reply.kind(),
    }
}
