//! Execution context factory: starts a worker and hands back a channel to it.
//!
//! Backends:
//! - **Thread**: the engine runs on a dedicated OS thread with its own
//!   runtime. Envelopes move through in-memory channels, so transferred
//!   buffers change hands without a copy.
//! - **Process**: a child process speaks the framed protocol on stdin/stdout.
//!
//! Both sit behind [`WorkerChannel`]: `post`, `on_message`, `terminate`.
//! The backend is chosen at call time by probing which program images the
//! [`WorkerImage`] carries (see [`create_channel`]).

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::thread;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{Decoded, FrameCodec};
use super::protocol::{CallId, Request, Response, WorkerMessage};
use crate::config::{BackendPreference, BridgeConfig, ENV_MAX_FRAME_BYTES};
use crate::engine::EngineFactory;
use crate::version::VersionInfo;

/// Environment variable marking a process as an sfbridge worker.
pub const WORKER_ENV: &str = "SFBRIDGE_WORKER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Thread,
    Process,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Thread => f.write_str("thread"),
            Self::Process => f.write_str("process"),
        }
    }
}

/// Construction failure: the worker could not be started.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("no usable worker backend: {0}")]
    Unavailable(String),

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    Thread(#[source] io::Error),

    #[error("worker did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("worker exited before becoming ready")]
    Exited,

    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("worker channel closed")]
    Closed,

    #[error("a message handler is already registered on this channel")]
    HandlerRegistered,

    #[error("worker channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What a registered message handler receives.
#[derive(Debug)]
pub enum ChannelEvent {
    Message(Response),
    /// A frame arrived that could not be decoded.
    Malformed {
        id: Option<CallId>,
        reason: String,
    },
    /// The worker side is gone. Delivered once, last.
    Closed,
}

/// Worker end of a thread-backend channel.
pub struct ThreadPort {
    pub(crate) requests: mpsc::UnboundedReceiver<Request>,
    pub(crate) messages: mpsc::UnboundedSender<WorkerMessage>,
}

type ThreadEntry = Box<dyn FnOnce(ThreadPort) + Send>;

/// Program images a worker can be started from.
///
/// Carries an in-process entry, a child-process command line, or both;
/// [`create_channel`] picks whichever the configuration and host allow.
#[derive(Default)]
pub struct WorkerImage {
    thread: Option<ThreadEntry>,
    process: Option<ProcessImage>,
}

impl std::fmt::Debug for WorkerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerImage")
            .field("thread", &self.thread.is_some())
            .field("process", &self.process)
            .finish()
    }
}

impl WorkerImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image that runs `factory`'s engine on a dedicated thread.
    pub fn in_process<F: EngineFactory>(factory: F) -> Self {
        Self::new().with_in_process(factory)
    }

    /// Image that runs a child process.
    pub fn process(image: ProcessImage) -> Self {
        Self::new().with_process(image)
    }

    pub fn with_in_process<F: EngineFactory>(mut self, factory: F) -> Self {
        self.thread = Some(Box::new(move |port| {
            crate::worker::run_thread_worker(port, factory)
        }));
        self
    }

    pub fn with_process(mut self, image: ProcessImage) -> Self {
        self.process = Some(image);
        self
    }
}

/// Command line for a process worker.
///
/// The child must call [`crate::worker::run_stdio_worker`]; stderr is
/// inherited so its logs land next to the parent's.
#[derive(Debug, Clone)]
pub struct ProcessImage {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessImage {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: vec![(WORKER_ENV.into(), "1".into())],
        }
    }

    /// Re-invoke the running executable as the worker.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Locate the program: paths are checked directly, bare names on `PATH`.
    pub fn resolve(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 || self.program.is_absolute() {
            return self.program.is_file().then(|| self.program.clone());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
    }
}

/// Pick a backend by probing what the image can actually start.
fn select_backend(
    image: &WorkerImage,
    preference: BackendPreference,
) -> Result<Backend, SpawnError> {
    let has_thread = image.thread.is_some();
    let process_program = image.process.as_ref().map(ProcessImage::resolve);
    let has_process = matches!(process_program, Some(Some(_)));

    tracing::debug!(
        %preference,
        has_thread,
        has_process,
        "Probing worker backends"
    );

    match preference {
        BackendPreference::Thread if has_thread => Ok(Backend::Thread),
        BackendPreference::Process if has_process => Ok(Backend::Process),
        BackendPreference::Auto if has_thread => Ok(Backend::Thread),
        BackendPreference::Auto if has_process => Ok(Backend::Process),
        _ => {
            let reason = match (&image.process, process_program) {
                (Some(p), Some(None)) => format!(
                    "backend '{}' requested but worker program {} was not found",
                    preference,
                    p.program.display()
                ),
                _ => format!(
                    "backend '{}' requested but the worker image has no matching program",
                    preference
                ),
            };
            Err(SpawnError::Unavailable(reason))
        }
    }
}

/// Start a worker and return a live channel to it.
///
/// Waits for the worker's Ready handshake; a worker that exits or stays
/// silent past `config.startup_timeout` is torn down and reported as a
/// [`SpawnError`]. No retry is attempted.
pub async fn create_channel(
    image: WorkerImage,
    config: &BridgeConfig,
) -> Result<WorkerChannel, SpawnError> {
    let backend = select_backend(&image, config.backend)?;
    tracing::info!(%backend, "Starting worker");

    let mut channel = match backend {
        Backend::Thread => {
            let entry = image
                .thread
                .ok_or_else(|| SpawnError::Other("thread image missing".to_string()))?;
            WorkerChannel::Thread(ThreadChannel::spawn(entry)?)
        }
        Backend::Process => {
            let process = image
                .process
                .ok_or_else(|| SpawnError::Other("process image missing".to_string()))?;
            WorkerChannel::Process(ProcessChannel::spawn(&process, config)?)
        }
    };

    match channel.wait_ready(config.startup_timeout).await {
        Ok(info) => {
            if !info.is_compatible() {
                tracing::warn!(
                    worker_version = %info.sfbridge,
                    client_version = crate::version::SFBRIDGE_VERSION,
                    "Worker version differs from client"
                );
            }
            tracing::info!(%backend, worker_pid = info.pid, "Worker ready");
            Ok(channel)
        }
        Err(e) => {
            tracing::error!(%backend, error = %e, "Worker failed to start");
            channel.terminate().await;
            Err(e)
        }
    }
}

/// Bidirectional channel to a running worker.
pub enum WorkerChannel {
    Thread(ThreadChannel),
    Process(ProcessChannel),
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handler_registered = match self {
            Self::Thread(c) => c.inbox.is_none(),
            Self::Process(c) => c.inbox.is_none(),
        };
        f.debug_struct("WorkerChannel")
            .field("backend", &self.backend())
            .field("handler_registered", &handler_registered)
            .finish()
    }
}

impl WorkerChannel {
    pub fn backend(&self) -> Backend {
        match self {
            Self::Thread(_) => Backend::Thread,
            Self::Process(_) => Backend::Process,
        }
    }

    /// Send a request. The request, and every buffer it owns, moves to the worker.
    pub async fn post(&self, request: Request) -> Result<(), ChannelError> {
        match self {
            Self::Thread(c) => c.post(request),
            Self::Process(c) => c.post(request).await,
        }
    }

    /// Register the message handler. Only one handler may be registered;
    /// a second registration fails with [`ChannelError::HandlerRegistered`].
    ///
    /// The handler runs on a spawned task, in frame order, and receives
    /// [`ChannelEvent::Closed`] once the worker side is gone.
    pub fn on_message<H>(&mut self, mut handler: H) -> Result<(), ChannelError>
    where
        H: FnMut(ChannelEvent) + Send + 'static,
    {
        let mut inbox = self
            .inbox_mut()
            .take()
            .ok_or(ChannelError::HandlerRegistered)?;
        tokio::spawn(async move {
            while let Some(decoded) = inbox.recv().await {
                match decoded {
                    Decoded::Message(WorkerMessage::Response(response)) => {
                        handler(ChannelEvent::Message(response));
                    }
                    Decoded::Message(WorkerMessage::Ready(_)) => {
                        tracing::warn!("Unexpected Ready after startup, ignoring");
                    }
                    Decoded::Malformed { id, reason } => {
                        handler(ChannelEvent::Malformed { id, reason });
                    }
                }
            }
            handler(ChannelEvent::Closed);
            tracing::debug!("Worker message dispatcher exiting");
        });
        Ok(())
    }

    /// Stop the worker. Safe to call more than once.
    pub async fn terminate(&mut self) {
        match self {
            Self::Thread(c) => c.terminate(),
            Self::Process(c) => c.terminate().await,
        }
    }

    fn inbox_mut(&mut self) -> &mut Option<Inbox> {
        match self {
            Self::Thread(c) => &mut c.inbox,
            Self::Process(c) => &mut c.inbox,
        }
    }

    /// Wait for the worker's `Ready`. Frames before it are logged and dropped.
    pub(crate) async fn wait_ready(&mut self, timeout: Duration) -> Result<VersionInfo, SpawnError> {
        let inbox = self
            .inbox_mut()
            .as_mut()
            .ok_or_else(|| SpawnError::Other("message handler registered before Ready".to_string()))?;

        let wait = async {
            loop {
                match inbox.recv().await {
                    Some(Decoded::Message(WorkerMessage::Ready(info))) => return Ok(info),
                    Some(Decoded::Message(WorkerMessage::Response(response))) => {
                        tracing::warn!(id = %response.id, "Response before Ready, dropping");
                    }
                    Some(Decoded::Malformed { reason, .. }) => {
                        tracing::warn!(%reason, "Malformed frame during startup, dropping");
                    }
                    None => return Err(SpawnError::Exited),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SpawnError::StartupTimeout(timeout))?
    }
}

type Inbox = mpsc::UnboundedReceiver<Decoded<WorkerMessage>>;

/// Thread backend: engine on a dedicated OS thread.
pub struct ThreadChannel {
    requests: Option<mpsc::UnboundedSender<Request>>,
    inbox: Option<Inbox>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ThreadChannel {
    fn spawn(entry: ThreadEntry) -> Result<Self, SpawnError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (message_tx, mut message_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let port = ThreadPort {
            requests: request_rx,
            messages: message_tx,
        };
        let thread = thread::Builder::new()
            .name("sfbridge-worker".to_string())
            .spawn(move || entry(port))
            .map_err(SpawnError::Thread)?;

        // Messages from the thread are already typed; wrap them so both
        // backends feed the same inbox shape.
        tokio::spawn(async move {
            while let Some(msg) = message_rx.recv().await {
                if inbox_tx.send(Decoded::Message(msg)).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            requests: Some(request_tx),
            inbox: Some(inbox_rx),
            thread: Some(thread),
        })
    }

    fn post(&self, request: Request) -> Result<(), ChannelError> {
        let tx = self.requests.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(request).map_err(|_| ChannelError::Closed)
    }

    /// Closes the request channel. The worker thread finishes the envelope it
    /// is handling, sees the channel closed, and exits; it is not joined.
    fn terminate(&mut self) {
        if self.requests.take().is_some() {
            tracing::debug!("Closed worker thread request channel");
        }
        if let Some(handle) = self.thread.take() {
            if handle.is_finished() && handle.join().is_err() {
                tracing::warn!("Worker thread panicked");
            }
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Process backend: framed protocol over a byte stream pair, normally a
/// child's stdout/stdin.
pub struct ProcessChannel {
    writer: Mutex<Option<FramedWrite<BoxedWriter, FrameCodec<Request>>>>,
    inbox: Option<Inbox>,
    child: Option<Child>,
    terminate_grace: Duration,
}

/// Child command line. The frame limit is passed down so both ends agree on it.
fn worker_command(program: &Path, image: &ProcessImage, config: &BridgeConfig) -> Command {
    let mut command = Command::new(program);
    command
        .args(&image.args)
        .env(ENV_MAX_FRAME_BYTES, config.max_frame_length.to_string())
        .envs(image.envs.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    command
}

impl ProcessChannel {
    fn spawn(image: &ProcessImage, config: &BridgeConfig) -> Result<Self, SpawnError> {
        let program = image.resolve().ok_or_else(|| {
            SpawnError::Unavailable(format!(
                "worker program {} was not found",
                image.program.display()
            ))
        })?;

        tracing::debug!(program = %program.display(), "Spawning worker process");
        let mut child = worker_command(&program, image, config)
            .spawn()
            .map_err(SpawnError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        let mut channel = Self::from_streams(stdout, stdin, config);
        channel.child = Some(child);
        Ok(channel)
    }

    /// Channel over an arbitrary stream pair with no child process attached.
    ///
    /// Must be called within a tokio runtime: a reader task is spawned
    /// immediately.
    pub fn from_streams<R, W>(reader: R, writer: W, config: &BridgeConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let max = config.max_frame_length;

        let mut frames = FramedRead::new(reader, FrameCodec::<WorkerMessage>::with_max_frame_length(max));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(decoded) => {
                        if inbox_tx.send(decoded).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Worker channel read error");
                        break;
                    }
                }
            }
            tracing::debug!("Worker reader task exiting");
        });

        Self {
            writer: Mutex::new(Some(FramedWrite::new(
                writer,
                FrameCodec::with_max_frame_length(max),
            ))),
            inbox: Some(inbox_rx),
            child: None,
            terminate_grace: config.terminate_grace,
        }
    }

    async fn post(&self, request: Request) -> Result<(), ChannelError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;
        writer.send(request).await?;
        Ok(())
    }

    /// Closes the worker's input, gives it `terminate_grace` to exit, then kills it.
    ///
    /// Closing flushes buffered frames; a worker that has stopped reading
    /// gets `terminate_grace` for that too before the input is dropped.
    async fn terminate(&mut self) {
        if let Some(mut writer) = self.writer.get_mut().take() {
            match tokio::time::timeout(self.terminate_grace, writer.close()).await {
                Ok(Ok(())) => tracing::debug!("Closed worker input"),
                Ok(Err(e)) => tracing::debug!(error = %e, "Failed to close worker input cleanly"),
                Err(_) => tracing::warn!("Worker not reading its input, dropping it unflushed"),
            }
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        match tokio::time::timeout(self.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "Worker process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for worker process"),
            Err(_) => {
                tracing::warn!(
                    grace = ?self.terminate_grace,
                    "Worker process did not exit in time, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill worker process");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Command, Reply};
    use crate::engine::EngineError;
    use crate::testing::fake_factory;
    use tokio_util::bytes::Bytes;

    fn fast_config() -> BridgeConfig {
        BridgeConfig::new()
            .with_startup_timeout(Duration::from_secs(5))
            .with_terminate_grace(Duration::from_millis(200))
    }

    #[test]
    fn auto_prefers_thread_image() {
        let image = WorkerImage::in_process(fake_factory())
            .with_process(ProcessImage::new("/definitely/not/here"));
        let backend = select_backend(&image, BackendPreference::Auto).unwrap();
        assert_eq!(backend, Backend::Thread);
    }

    #[cfg(unix)]
    #[test]
    fn auto_falls_back_to_resolvable_process() {
        let image = WorkerImage::process(ProcessImage::new("sh"));
        let backend = select_backend(&image, BackendPreference::Auto).unwrap();
        assert_eq!(backend, Backend::Process);
    }

    #[test]
    fn empty_image_is_unavailable() {
        let err = select_backend(&WorkerImage::new(), BackendPreference::Auto).unwrap_err();
        assert!(matches!(err, SpawnError::Unavailable(_)));
    }

    #[test]
    fn explicit_preference_is_not_substituted() {
        let image = WorkerImage::in_process(fake_factory());
        let err = select_backend(&image, BackendPreference::Process).unwrap_err();
        assert!(matches!(err, SpawnError::Unavailable(_)));
    }

    #[test]
    fn unresolvable_program_is_reported() {
        let image = WorkerImage::process(ProcessImage::new("/definitely/not/here"));
        let err = select_backend(&image, BackendPreference::Process).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here"), "{err}");
    }

    #[test]
    fn process_image_sets_worker_marker() {
        let image = ProcessImage::new("worker").arg("--quiet").env("A", "B");
        assert!(
            image
                .envs
                .iter()
                .any(|(k, v)| k == WORKER_ENV && v == "1")
        );
        assert_eq!(image.args, vec![OsString::from("--quiet")]);
    }

    #[tokio::test]
    async fn thread_backend_handshakes_and_serves() {
        let mut channel = create_channel(WorkerImage::in_process(fake_factory()), &fast_config())
            .await
            .unwrap();
        assert_eq!(channel.backend(), Backend::Thread);

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel
            .on_message(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();

        channel
            .post(Request {
                id: CallId::new(1),
                command: Command::Init {
                    soundfont: Bytes::from_static(b"TimGM6mb"),
                },
            })
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ChannelEvent::Message(response) => {
                assert_eq!(response, Response::result(CallId::new(1), Reply::Initialized));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        channel.terminate().await;
        assert!(matches!(rx.recv().await, Some(ChannelEvent::Closed)));
    }

    #[tokio::test]
    async fn thread_backend_moves_buffers_without_copying() {
        // Engine that hands the input buffer straight back.
        struct Echo;
        impl crate::engine::Engine for Echo {
            type Soundfont = ();
            fn load_soundfont(&mut self, _sf2: Bytes) -> Result<(), EngineError> {
                Ok(())
            }
            fn info(&self, _sf: &()) -> Result<crate::engine::SoundfontInfo, EngineError> {
                Ok(Default::default())
            }
            fn render(&mut self, _sf: &(), smf: Bytes) -> Result<Bytes, EngineError> {
                Ok(smf)
            }
        }

        let mut channel = create_channel(
            WorkerImage::in_process(|| Ok::<_, EngineError>(Echo)),
            &fast_config(),
        )
        .await
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel
            .on_message(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();

        channel
            .post(Request {
                id: CallId::new(1),
                command: Command::Init {
                    soundfont: Bytes::new(),
                },
            })
            .await
            .unwrap();
        let _ = rx.recv().await;

        let smf = Bytes::from(vec![7u8; 4096]);
        let addr = smf.as_ptr();
        channel
            .post(Request {
                id: CallId::new(2),
                command: Command::Compute { smf },
            })
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ChannelEvent::Message(Response {
                outcome: crate::bridge::protocol::Outcome::Result(Reply::Wav { wav }),
                ..
            }) => assert_eq!(wav.as_ptr(), addr),
            other => panic!("unexpected event: {other:?}"),
        }
        channel.terminate().await;
    }

    #[tokio::test]
    async fn post_after_terminate_fails() {
        let mut channel = create_channel(WorkerImage::in_process(fake_factory()), &fast_config())
            .await
            .unwrap();
        channel.terminate().await;
        channel.terminate().await;

        let err = channel
            .post(Request {
                id: CallId::new(1),
                command: Command::Info {},
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn thread_worker_dying_before_ready_is_a_spawn_error() {
        let mut image = WorkerImage::new();
        image.thread = Some(Box::new(|port: ThreadPort| drop(port)));

        let err = create_channel(image, &fast_config()).await.unwrap_err();
        assert!(matches!(err, SpawnError::Exited));
    }

    #[tokio::test]
    async fn silent_thread_worker_times_out() {
        let mut image = WorkerImage::new();
        image.thread = Some(Box::new(|port: ThreadPort| {
            // Hold the port open without ever sending Ready.
            std::thread::sleep(Duration::from_millis(500));
            drop(port);
        }));

        let config = fast_config().with_startup_timeout(Duration::from_millis(50));
        let err = create_channel(image, &config).await.unwrap_err();
        assert!(matches!(err, SpawnError::StartupTimeout(_)));
    }

    #[tokio::test]
    async fn stream_channel_decodes_worker_frames() {
        let (client_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (_worker_read, worker_write) = tokio::io::split(worker_io);

        let mut channel =
            WorkerChannel::Process(ProcessChannel::from_streams(client_read, client_write, &fast_config()));

        let mut worker = FramedWrite::new(worker_write, FrameCodec::<WorkerMessage>::new());
        worker
            .send(WorkerMessage::Ready(VersionInfo::new()))
            .await
            .unwrap();
        channel.wait_ready(Duration::from_secs(1)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel
            .on_message(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();

        worker
            .send(WorkerMessage::Response(Response::error(CallId::new(4), "boom")))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            ChannelEvent::Message(response) => {
                assert_eq!(response, Response::error(CallId::new(4), "boom"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        worker.close().await.unwrap();
        assert!(matches!(rx.recv().await, Some(ChannelEvent::Closed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_fails_construction() {
        let image = WorkerImage::process(ProcessImage::new("/definitely/not/here"));
        let err = create_channel(image, &fast_config()).await.unwrap_err();
        assert!(matches!(err, SpawnError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exiting_without_handshake_fails_construction() {
        let image = WorkerImage::process(ProcessImage::new("sh").arg("-c").arg("exit 3"));
        let err = create_channel(image, &fast_config()).await.unwrap_err();
        assert!(matches!(err, SpawnError::Exited));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_process_times_out_and_is_reaped() {
        let image = WorkerImage::process(ProcessImage::new("sh").arg("-c").arg("sleep 30"));
        let config = fast_config().with_startup_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = create_channel(image, &config).await.unwrap_err();
        assert!(matches!(err, SpawnError::StartupTimeout(_)));
        // Timeout + grace + kill, well short of the child's own sleep.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn child_inherits_frame_limit() {
        let image = ProcessImage::new("worker").env("EXTRA", "1");
        let config = BridgeConfig::new().with_max_frame_length(2 << 30);
        let command = worker_command(Path::new("/bin/worker"), &image, &config);

        let envs: Vec<(String, Option<String>)> = command
            .as_std()
            .get_envs()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.map(|v| v.to_string_lossy().into_owned()),
                )
            })
            .collect();
        assert!(envs.contains(&(ENV_MAX_FRAME_BYTES.to_string(), Some((2usize << 30).to_string()))));
        assert!(envs.contains(&(WORKER_ENV.to_string(), Some("1".to_string()))));
        assert!(envs.contains(&("EXTRA".to_string(), Some("1".to_string()))));
    }

    #[tokio::test]
    async fn second_handler_is_rejected() {
        let (client_io, _worker_io) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut channel = WorkerChannel::Process(ProcessChannel::from_streams(
            client_read,
            client_write,
            &fast_config(),
        ));

        channel.on_message(|_| {}).unwrap();
        let err = channel.on_message(|_| {}).unwrap_err();
        assert!(matches!(err, ChannelError::HandlerRegistered));
        assert_eq!(
            format!("{channel:?}"),
            "WorkerChannel { backend: Process, handler_registered: true }"
        );
    }
}
