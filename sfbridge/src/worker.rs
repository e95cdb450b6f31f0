//! Worker host loop: runs inside the offloaded context.
//!
//! The host owns the engine, instantiates it lazily on first use, and answers
//! every inbound envelope with exactly one response. Envelopes are handled
//! strictly one at a time; nothing a request does can stop the loop from
//! serving the next one.
//!
//! Parent side (spawning, routing responses to callers) lives in
//! `bridge::transport` and `client`.

use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{Decoded, FrameCodec};
use crate::bridge::protocol::{Command, Reply, Request, Response, WorkerMessage};
use crate::bridge::transport::{ThreadPort, WORKER_ENV};
use crate::config::BridgeConfig;
use crate::engine::{Engine, EngineError, EngineFactory, MmlOutput};
use crate::version::VersionInfo;

/// Worker side of a channel.
#[async_trait::async_trait]
pub trait WorkerPort: Send {
    /// Next inbound envelope, or `None` once the parent side is gone.
    async fn recv(&mut self) -> Option<Decoded<Request>>;

    async fn post(&mut self, message: WorkerMessage) -> io::Result<()>;
}

#[async_trait::async_trait]
impl WorkerPort for ThreadPort {
    async fn recv(&mut self) -> Option<Decoded<Request>> {
        self.requests.recv().await.map(Decoded::Message)
    }

    async fn post(&mut self, message: WorkerMessage) -> io::Result<()> {
        self.messages
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "parent channel closed"))
    }
}

/// Framed protocol over a byte stream pair (stdin/stdout in a process worker).
pub struct StreamPort<R, W> {
    reader: FramedRead<R, FrameCodec<Request>>,
    writer: FramedWrite<W, FrameCodec<WorkerMessage>>,
}

impl<R, W> StreamPort<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(reader: R, writer: W, max_frame_length: usize) -> Self {
        Self {
            reader: FramedRead::new(reader, FrameCodec::with_max_frame_length(max_frame_length)),
            writer: FramedWrite::new(writer, FrameCodec::with_max_frame_length(max_frame_length)),
        }
    }
}

#[async_trait::async_trait]
impl<R, W> WorkerPort for StreamPort<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn recv(&mut self) -> Option<Decoded<Request>> {
        match self.reader.next().await? {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::error!(error = %e, "Request stream error");
                None
            }
        }
    }

    async fn post(&mut self, message: WorkerMessage) -> io::Result<()> {
        self.writer.send(message).await
    }
}

/// Why a request failed. The display text is what the caller sees.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("soundfont not initialized")]
    NotInitialized,

    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("engine panicked: {0}")]
    Panicked(String),
}

/// Engine lifecycle within one worker.
///
/// `Uninstantiated -> Instantiating -> Instantiated -> Ready`, or
/// `Failed` if instantiation fails. `Failed` is terminal.
pub enum EngineState<E: Engine> {
    Uninstantiated,
    Instantiating,
    Instantiated(E),
    Ready { engine: E, soundfont: E::Soundfont },
    Failed(String),
}

/// Observable view of [`EngineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Uninstantiated,
    Instantiating,
    Instantiated,
    Ready,
    Failed,
}

impl<E: Engine> EngineState<E> {
    pub fn phase(&self) -> EnginePhase {
        match self {
            Self::Uninstantiated => EnginePhase::Uninstantiated,
            Self::Instantiating => EnginePhase::Instantiating,
            Self::Instantiated(_) => EnginePhase::Instantiated,
            Self::Ready { .. } => EnginePhase::Ready,
            Self::Failed(_) => EnginePhase::Failed,
        }
    }
}

/// Holds engine state and turns requests into responses.
pub struct WorkerHost<F: EngineFactory> {
    factory: F,
    state: EngineState<F::Engine>,
}

impl<F: EngineFactory> WorkerHost<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            state: EngineState::Uninstantiated,
        }
    }

    pub fn phase(&self) -> EnginePhase {
        self.state.phase()
    }

    /// Handle one request. Always produces a response tagged with the request's id.
    pub fn handle(&mut self, request: Request) -> Response {
        let Request { id, command } = request;
        let kind = command.kind();
        tracing::debug!(%id, kind, "Handling request");

        match self.dispatch(command) {
            Ok(reply) => {
                tracing::debug!(%id, kind, reply = reply.kind(), "Request succeeded");
                Response::result(id, reply)
            }
            Err(e) => {
                tracing::warn!(%id, kind, error = %e, "Request failed");
                Response::error(id, e.to_string())
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<Reply, HandleError> {
        match command {
            Command::Init { soundfont } => {
                self.init(soundfont)?;
                Ok(Reply::Initialized)
            }
            Command::Info {} => {
                let (engine, soundfont) = self.ready()?;
                let info = guard(|| engine.info(soundfont))??;
                Ok(Reply::Info(info))
            }
            Command::Compute { smf } => {
                let (engine, soundfont) = self.ready()?;
                let wav = guard(|| engine.render(soundfont, smf))??;
                Ok(Reply::Wav { wav })
            }
            Command::MmlToSmf { mml } => {
                let engine = self.engine()?;
                match guard(|| engine.mml_to_smf(&mml))?? {
                    MmlOutput::Smf(smf) => Ok(Reply::Smf { smf }),
                    MmlOutput::Errors(errors) => Ok(Reply::MmlErrors { errors }),
                }
            }
            Command::SmfToMml { smf } => {
                let engine = self.engine()?;
                let mml = guard(|| engine.smf_to_mml(smf))??;
                Ok(Reply::Mml { mml })
            }
        }
    }

    /// Load a soundfont, replacing any previous one. A failed load leaves the
    /// previous soundfont in place.
    fn init(&mut self, sf2: Bytes) -> Result<(), HandleError> {
        let engine = self.engine()?;
        let soundfont = guard(|| engine.load_soundfont(sf2))??;

        self.state = match mem::replace(&mut self.state, EngineState::Instantiating) {
            EngineState::Instantiated(engine) | EngineState::Ready { engine, .. } => {
                EngineState::Ready { engine, soundfont }
            }
            other => other,
        };
        tracing::info!("Soundfont loaded");
        Ok(())
    }

    /// The engine with a loaded soundfont.
    #[allow(clippy::type_complexity)]
    fn ready(
        &mut self,
    ) -> Result<(&mut F::Engine, &<F::Engine as Engine>::Soundfont), HandleError> {
        match &mut self.state {
            EngineState::Ready { engine, soundfont } => Ok((engine, soundfont)),
            EngineState::Failed(reason) => Err(HandleError::EngineUnavailable(reason.clone())),
            _ => Err(HandleError::NotInitialized),
        }
    }

    /// The engine, instantiating it on first use.
    fn engine(&mut self) -> Result<&mut F::Engine, HandleError> {
        if matches!(self.state, EngineState::Uninstantiated) {
            self.instantiate();
        }
        match &mut self.state {
            EngineState::Instantiated(engine) | EngineState::Ready { engine, .. } => Ok(engine),
            EngineState::Failed(reason) => Err(HandleError::EngineUnavailable(reason.clone())),
            EngineState::Uninstantiated | EngineState::Instantiating => Err(
                HandleError::EngineUnavailable("instantiation did not complete".to_string()),
            ),
        }
    }

    fn instantiate(&mut self) {
        self.state = EngineState::Instantiating;
        tracing::info!("Instantiating engine");

        let factory = &self.factory;
        self.state = match guard(|| factory.instantiate()) {
            Ok(Ok(engine)) => {
                tracing::info!("Engine instantiated");
                EngineState::Instantiated(engine)
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Engine instantiation failed");
                EngineState::Failed(e.to_string())
            }
            Err(e) => {
                tracing::error!(error = %e, "Engine instantiation panicked");
                EngineState::Failed(e.to_string())
            }
        };
    }
}

/// Run an engine call, turning a panic into an error.
fn guard<T>(f: impl FnOnce() -> T) -> Result<T, HandleError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        HandleError::Panicked(message)
    })
}

/// Serve requests on `port` until the parent side closes.
///
/// Posts `Ready` first, then handles envelopes strictly in arrival order.
pub async fn run_worker<P: WorkerPort, F: EngineFactory>(mut port: P, factory: F) -> io::Result<()> {
    let mut host = WorkerHost::new(factory);

    let version = VersionInfo::new();
    tracing::debug!(pid = version.pid, "Sending Ready to parent");
    port.post(WorkerMessage::Ready(version)).await?;

    while let Some(inbound) = port.recv().await {
        let response = match inbound {
            Decoded::Message(request) => host.handle(request),
            Decoded::Malformed { id: Some(id), reason } => {
                tracing::warn!(%id, %reason, "Rejecting malformed request");
                Response::error(id, HandleError::UnknownCommand(reason).to_string())
            }
            Decoded::Malformed { id: None, reason } => {
                tracing::warn!(%reason, "Dropping malformed frame without id");
                continue;
            }
        };
        let id = response.id;
        match port.post(WorkerMessage::Response(response)).await {
            Ok(()) => {}
            // The encoder rejects a frame before writing any of it.
            Err(e) if is_unsendable(&e) => {
                tracing::warn!(%id, error = %e, "Response could not be encoded, replying with error");
                let fallback = Response::error(id, format!("response could not be sent: {e}"));
                if let Err(e) = port.post(WorkerMessage::Response(fallback)).await {
                    tracing::error!(error = %e, "Failed to send error response, exiting");
                    return Err(e);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to send response, exiting");
                return Err(e);
            }
        }
    }

    tracing::info!("Parent channel closed, worker exiting");
    Ok(())
}

fn is_unsendable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData)
}

/// Entry point for a thread-backend worker.
pub(crate) fn run_thread_worker<F: EngineFactory>(port: ThreadPort, factory: F) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            // Dropping the port reports the exit to the parent.
            tracing::error!(error = %e, "Failed to build worker runtime");
            return;
        }
    };
    if let Err(e) = runtime.block_on(run_worker(port, factory)) {
        tracing::error!(error = %e, "Worker thread exited with error");
    }
}

/// Entry point for a process-backend worker: speaks the framed protocol on
/// stdin/stdout. Logs must go to stderr.
pub fn run_stdio_worker<F: EngineFactory>(factory: F) -> io::Result<()> {
    let config = BridgeConfig::from_env();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let port = StreamPort::new(
            tokio::io::stdin(),
            tokio::io::stdout(),
            config.max_frame_length,
        );
        run_worker(port, factory).await
    })
}

/// True when this process was started as a worker by [`crate::bridge::transport::ProcessImage`].
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some_and(|v| v == "1")
}
