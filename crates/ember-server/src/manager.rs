//! Lifecycle manager for the inference server process.
//!
//! A start walks through `PortSearching -> Spawning -> AwaitingReady ->
//! Initializing -> Running`. Every start and stop bumps a generation counter;
//! background tasks carry the generation they were spawned for and drop
//! events that no longer match, so a late exit of a replaced server never
//! touches its successor.

use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cleanup::kill_port_listeners;
use crate::client::{HttpServerApi, ServerApi};
use crate::config::{ReadinessProbe, ServerConfig};
use crate::error::ServerError;
use crate::launch::{server_args, spawn_server};
use crate::port::find_open_port;

/// Where the managed server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPhase {
    #[default]
    Stopped,
    PortSearching,
    Spawning,
    AwaitingReady,
    Initializing,
    Running,
    SpawnFailed,
    InitFailed,
}

/// Snapshot of the manager for the host application.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub phase: ServerPhase,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub model: Option<String>,
}

type StartResult = Result<(), ServerError>;

/// The live child, as seen from the manager.
///
/// The `Child` itself is owned by its supervisor task; this only holds what is
/// needed to identify it and ask it to stop.
struct LiveServer {
    generation: u64,
    pid: Option<u32>,
    model: String,
    terminate: oneshot::Sender<()>,
}

#[derive(Default)]
struct Shared {
    generation: u64,
    phase: ServerPhase,
    server: Option<LiveServer>,
    /// Last bound port. Kept after the server stops for shutdown cleanup.
    port: Option<u16>,
    pending: Option<oneshot::Sender<StartResult>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    fn owns(&self, generation: u64) -> bool {
        self.server
            .as_ref()
            .is_some_and(|server| server.generation == generation)
    }

    /// Resolve the outstanding start, if it belongs to `generation`.
    fn settle(&mut self, generation: u64, result: StartResult) {
        if !self.is_current(generation) {
            return;
        }
        if let Some(pending) = self.pending.take() {
            let _ = pending.send(result);
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Manager for the inference server process.
///
/// Holds at most one live child. Construct one per application and hand it to
/// whatever drives it.
pub struct ServerManager {
    config: ServerConfig,
    api: Arc<dyn ServerApi>,
    shared: Arc<Mutex<Shared>>,
}

impl ServerManager {
    /// Create a manager talking to the server over HTTP.
    pub fn new(config: ServerConfig) -> Self {
        let api = HttpServerApi::new().with_init_timeout(config.init_timeout);
        Self::with_api(config, Arc::new(api))
    }

    /// Create a manager with a custom server API.
    pub fn with_api(config: ServerConfig, api: Arc<dyn ServerApi>) -> Self {
        Self {
            config,
            api,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start a server for `model`, replacing any running one.
    ///
    /// Resolves once the server reported readiness and accepted the init
    /// handshake. A later `stop` or `start` rejects it with
    /// [`ServerError::StartCancelled`].
    pub async fn start(&self, model: &str) -> Result<(), ServerError> {
        self.stop();

        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.phase = ServerPhase::PortSearching;
            shared.pending = Some(tx);
            shared.generation
        };

        if let Err(e) = self.launch(generation, model).await {
            let mut shared = lock(&self.shared);
            if shared.is_current(generation) {
                error!("Failed to launch server: {}", e);
                shared.phase = ServerPhase::SpawnFailed;
            }
            shared.settle(generation, Err(e));
        }

        let outcome = match self.config.ready_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("Server not ready after {:?}", limit);
                    let mut shared = lock(&self.shared);
                    if shared.is_current(generation) {
                        shared.pending = None;
                    }
                    return Err(ServerError::ServerStartTimeout);
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or(Err(ServerError::StartCancelled))
    }

    /// Start in the background and log the outcome.
    pub fn start_detached(self: &Arc<Self>, model: impl Into<String>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let model = model.into();

        tokio::spawn(async move {
            match manager.start(&model).await {
                Ok(()) => info!("Server started successfully"),
                Err(e) => error!("Error starting server: {}", e),
            }
        })
    }

    /// Find a port, spawn the server and wire up its background tasks.
    async fn launch(&self, generation: u64, model: &str) -> Result<(), ServerError> {
        let port = find_open_port(self.config.preferred_port, self.config.max_port_attempts).await?;
        info!("Starting server for model: {} on port: {}", model, port);

        let args = server_args(port, model, self.config.adapter_file.as_deref());

        let (mut child, terminate) = {
            let mut shared = lock(&self.shared);
            if !shared.is_current(generation) {
                return Err(ServerError::StartCancelled);
            }

            shared.phase = ServerPhase::Spawning;
            let child = spawn_server(&self.config.launcher, &args)?;
            let (terminate_tx, terminate_rx) = oneshot::channel();

            shared.server = Some(LiveServer {
                generation,
                pid: child.id(),
                model: model.to_string(),
                terminate: terminate_tx,
            });
            shared.port = Some(port);
            shared.phase = ServerPhase::AwaitingReady;

            (child, terminate_rx)
        };

        let handshake = Handshake {
            shared: Arc::clone(&self.shared),
            api: Arc::clone(&self.api),
            generation,
            port,
            model: model.to_string(),
            grace: self.config.init_grace,
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let stdout = child.stdout.take();
        match &self.config.readiness {
            ReadinessProbe::LogMarker { marker } => match stdout {
                Some(stdout) => {
                    tokio::spawn(watch_stdout(stdout, Some((marker.clone(), handshake))));
                }
                None => warn!("Server stdout is not captured; readiness marker can't be seen"),
            },
            ReadinessProbe::Poll {
                interval,
                max_interval,
            } => {
                if let Some(stdout) = stdout {
                    tokio::spawn(watch_stdout(stdout, None));
                }
                tokio::spawn(handshake.poll(*interval, *max_interval));
            }
        }

        tokio::spawn(supervise(
            child,
            terminate,
            Arc::clone(&self.shared),
            generation,
            self.config.stop_grace,
        ));

        Ok(())
    }

    /// Stop the server process.
    ///
    /// Returns immediately; the process is signalled and reaped in the
    /// background. Rejects an in-flight `start`. Calling it with nothing
    /// running is a no-op.
    pub fn stop(&self) {
        let mut shared = lock(&self.shared);
        shared.generation += 1;

        if let Some(pending) = shared.pending.take() {
            let _ = pending.send(Err(ServerError::StartCancelled));
        }

        if let Some(server) = shared.server.take() {
            info!("Stopping the server (PID: {:?})", server.pid);
            let _ = server.terminate.send(());
        }

        shared.phase = ServerPhase::Stopped;
    }

    /// Stop the server and kill anything still listening on its last port.
    ///
    /// The port sweep shells out and blocks until it finishes.
    pub fn shutdown(&self) {
        self.stop();

        let Some(port) = self.port() else {
            return;
        };

        match run_blocking(|| kill_port_listeners(port)) {
            Ok(pids) if !pids.is_empty() => {
                info!("Killed leftover processes on port {}: {:?}", port, pids)
            }
            Ok(_) => debug!("No leftover processes on port {}", port),
            Err(e) => warn!("Port cleanup failed for {}: {}", port, e),
        }
    }

    /// Last port a server was started on, if any.
    pub fn port(&self) -> Option<u16> {
        lock(&self.shared).port
    }

    /// PID of the live server process.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.shared).server.as_ref().and_then(|s| s.pid)
    }

    /// Check if a server process is being supervised.
    pub fn is_running(&self) -> bool {
        lock(&self.shared).server.is_some()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ServerPhase {
        lock(&self.shared).phase
    }

    /// Snapshot of the manager's state.
    pub fn status(&self) -> ServerStatus {
        let shared = lock(&self.shared);
        ServerStatus {
            phase: shared.phase,
            port: shared.port,
            pid: shared.server.as_ref().and_then(|s| s.pid),
            model: shared.server.as_ref().map(|s| s.model.clone()),
        }
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run blocking work, moving it off the async scheduler when on a worker thread.
///
/// `block_in_place` panics on a current-thread runtime, so it is only used on
/// the multi-threaded one.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Readiness-to-running step for one spawned server.
struct Handshake {
    shared: Arc<Mutex<Shared>>,
    api: Arc<dyn ServerApi>,
    generation: u64,
    port: u16,
    model: String,
    grace: Duration,
}

impl Handshake {
    fn still_owned(&self) -> bool {
        lock(&self.shared).owns(self.generation)
    }

    /// Mark the server as initializing; false if it was replaced meanwhile.
    fn begin(&self) -> bool {
        let mut shared = lock(&self.shared);
        if !shared.owns(self.generation) {
            return false;
        }
        shared.phase = ServerPhase::Initializing;
        true
    }

    fn finish(&self, result: StartResult) {
        let mut shared = lock(&self.shared);
        if !shared.owns(self.generation) {
            debug!("Dropping init result for a replaced server");
            return;
        }

        match result {
            Ok(()) => {
                info!("Server on port {} initialized with {}", self.port, self.model);
                shared.phase = ServerPhase::Running;
                shared.settle(self.generation, Ok(()));
            }
            Err(e) => {
                error!("Server init failed: {}", e);
                shared.phase = ServerPhase::InitFailed;
                shared.settle(self.generation, Err(e));
            }
        }
    }

    async fn initialize(self) {
        if !self.begin() {
            debug!("Ignoring readiness of a replaced server");
            return;
        }

        tokio::time::sleep(self.grace).await;
        let result = self.api.init(self.port, &self.model).await;
        self.finish(result);
    }

    async fn poll(self, interval: Duration, max_interval: Duration) {
        let mut delay = interval;

        loop {
            if !self.still_owned() {
                return;
            }
            if self.api.probe(self.port).await {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max_interval);
        }

        self.initialize().await;
    }
}

/// Log stdout and, if a marker is given, start the handshake on first sight of it.
///
/// The marker is matched against the unterminated tail after every read, so a
/// server that prints it without a newline is still picked up.
async fn watch_stdout<R>(mut stdout: R, mut ready: Option<(String, Handshake)>)
where
    R: AsyncRead + Unpin,
{
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to read server output: {}", e);
                break;
            }
        };
        pending.extend_from_slice(&chunk[..n]);

        let seen = ready
            .as_ref()
            .is_some_and(|(marker, _)| contains_marker(&pending, marker));
        if seen {
            if let Some((_, handshake)) = ready.take() {
                tokio::spawn(handshake.initialize());
            }
        }

        while let Some(end) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=end).collect();
            log_output_line(&raw[..end]);
        }
    }

    if !pending.is_empty() {
        log_output_line(&pending);
    }
}

fn contains_marker(buf: &[u8], marker: &str) -> bool {
    String::from_utf8_lossy(buf).contains(marker)
}

fn log_output_line(raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    info!("server output: {}", line.trim_end_matches('\r'));
}

async fn forward_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).split(b'\n');

    while let Ok(Some(raw)) = lines.next_segment().await {
        let line = String::from_utf8_lossy(&raw);
        warn!("server error: {}", line.trim_end_matches('\r'));
    }
}

/// Own the child until it exits, terminating it on request.
async fn supervise(
    mut child: Child,
    terminate: oneshot::Receiver<()>,
    shared: Arc<Mutex<Shared>>,
    generation: u64,
    stop_grace: Duration,
) {
    let pid = child.id();

    let status = tokio::select! {
        status = child.wait() => status,
        // A dropped sender means the manager is gone; stop as well.
        _ = terminate => terminate_gracefully(&mut child, stop_grace).await,
    };

    let mut shared = lock(&shared);
    if !shared.owns(generation) {
        debug!("Server process {:?} exited after being replaced: {:?}", pid, status);
        return;
    }
    shared.server = None;
    shared.phase = ServerPhase::Stopped;

    match status {
        Ok(status) => {
            info!("Server process exited with code {:?}", status.code());
            shared.settle(
                generation,
                Err(ServerError::ServerExitedBeforeReady {
                    code: status.code(),
                }),
            );
        }
        Err(e) => {
            error!("Error in server process: {}", e);
            shared.settle(generation, Err(ServerError::ProcessFailed(e.to_string())));
        }
    }
}

/// SIGTERM first, SIGKILL after `grace`.
async fn terminate_gracefully(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid is our own child and has not been reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status;
            }
            warn!("Server didn't exit gracefully, killing...");
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    child.kill().await?;
    child.wait().await
}
