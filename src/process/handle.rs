//! # ProcessHandle: one live OS process speaking the node protocol.
//!
//! A handle is created either by spawning the root command line
//! ([`ProcessHandle::spawn`]) or by attaching to the transport a parent
//! process handed back for a child node ([`ProcessHandle::attach`]).
//!
//! ## Startup sequence
//! ```text
//! spawn(argv)
//!   ├─► socketpair; child inherits one end via FORKVISOR_MASTER_FD
//!   ├─► read_fd()              ◄── process's private control socket
//! attach(transport)
//!   ├─► read "P:<pid>:<ppid>:<identifier>"
//!   └─► run task:
//!         read_fd()            ◄── feature pipe (F:<path> lines)
//!         read "R:<text>"      ◄── OK → Ready, else Failed(ActionFailed)
//!         serve boot queue     ──► "S:<name>" / "C:<name>", read_fd() → reply
//! ```
//!
//! ## Rules
//! - [`ProcessHandle::boot`] never blocks: a full queue fails the request with
//!   [`BootError::QueueFull`], a stopping handle with [`BootError::Stopping`].
//! - The phase moves `Starting → Ready` at most once and records only the first failure.
//! - [`ProcessHandle::stop`] is idempotent and fails every queued request with
//!   [`BootError::Stopping`].
//! - The dependency-path stream ends when the process's feature pipe closes;
//!   for forked nodes that closure is reported as [`ProcessError::Gone`].

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use nix::sys::socket::SockType;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use super::boot::BootRequest;
use super::kill::force_kill;
use super::output::{self, OutputTail};
use crate::config::{Config, IDENTIFIER_ENV, MASTER_FD_ENV};
use crate::error::{BootError, ProcessError, TransportError};
use crate::transport::frame::{parse_action_response, parse_feature_line, parse_registration};
use crate::transport::{Transport, sys};

/// How long registration failures wait for a matching exit report.
const EXIT_REPORT_WAIT: Duration = Duration::from_millis(500);

/// How long output capture may lag behind the exit of the root process.
const OUTPUT_DRAIN_WAIT: Duration = Duration::from_millis(100);

/// Lazy sequence of dependency paths reported by a process.
///
/// Ends when the process's feature pipe closes.
pub type FileStream = BoxStream<'static, String>;

/// Observable state of a live process.
#[derive(Debug, Clone)]
pub enum ProcessPhase {
    /// Registered, action still running.
    Starting,
    /// Action succeeded; boot requests are served.
    Ready,
    /// Initialization failed or the process crashed.
    Failed(Arc<ProcessError>),
}

/// Write side of a handle's phase, shared by its background tasks.
#[derive(Clone)]
struct PhaseTx(Arc<watch::Sender<ProcessPhase>>);

impl PhaseTx {
    fn set_ready(&self) {
        self.0.send_if_modified(|phase| match phase {
            ProcessPhase::Starting => {
                *phase = ProcessPhase::Ready;
                true
            }
            _ => false,
        });
    }

    fn fail(&self, err: ProcessError) {
        self.0.send_if_modified(|phase| match phase {
            ProcessPhase::Failed(_) => false,
            _ => {
                *phase = ProcessPhase::Failed(Arc::new(err));
                true
            }
        });
    }
}

#[derive(Clone, Copy)]
struct KillSettings {
    timeout: Duration,
    poll: Duration,
}

/// Handle to one live node process.
pub struct ProcessHandle {
    pid: i32,
    parent_pid: i32,
    identifier: String,
    requests: mpsc::Sender<BootRequest>,
    phase: watch::Receiver<ProcessPhase>,
    files: Mutex<Option<FileStream>>,
    stop: CancellationToken,
    stopped: AtomicBool,
    runner: Mutex<Option<JoinHandle<()>>>,
    kill: KillSettings,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("parent_pid", &self.parent_pid)
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl ProcessHandle {
    /// Starts `argv` as the root process and waits for it to register.
    ///
    /// The process's combined output is captured; if it exits at any point
    /// the failure carries its exit status and the captured tail.
    pub async fn spawn(argv: &[String], identifier: &str, cfg: &Config) -> Result<Self, ProcessError> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommandLine)?;
        let (local, remote) = sys::socket_pair(SockType::Stream)
            .map_err(|e| ProcessError::Spawn(io::Error::from(e)))?;
        let remote_raw = remote.as_raw_fd();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(MASTER_FD_ENV, remote_raw.to_string())
            .env(IDENTIFIER_ENV, identifier)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // SAFETY: only fcntl(2) runs between fork and exec.
        unsafe {
            cmd.pre_exec(move || sys::set_cloexec(remote_raw, false).map_err(io::Error::from));
        }
        let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
        drop(remote);

        let tail = Arc::new(Mutex::new(OutputTail::new(cfg.output_tail_bytes)));
        let mut captures = Vec::new();
        if let Some(out) = child.stdout.take() {
            captures.push(tokio::spawn(output::capture(out, tail.clone())));
        }
        if let Some(err) = child.stderr.take() {
            captures.push(tokio::spawn(output::capture(err, tail.clone())));
        }

        let child_pid = child.id().map(|p| p as i32).unwrap_or_default();
        tracing::debug!(pid = child_pid, program = %program, "spawned root process");

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("unknown status ({e})"),
            };
            let _ = time::timeout(OUTPUT_DRAIN_WAIT, futures::future::join_all(captures)).await;
            let _ = exit_tx.send(ProcessError::Exited {
                status,
                output: output::snapshot(&tail),
            });
        });
        let mut exit = Some(exit_rx);

        let local = Transport::from_fd(local)
            .map_err(|e| ProcessError::Registration(TransportError::Io(e)))?;
        let private = select! {
            fd = local.read_fd() => fd,
            err = exited(&mut exit) => return Err(err),
        };
        let transport = match private.and_then(|fd| Transport::from_fd(fd).map_err(TransportError::Io)) {
            Ok(transport) => transport,
            Err(source) => return Err(registration_failure(source, &mut exit, child_pid, cfg).await),
        };
        drop(local);

        Self::start(transport, identifier, cfg, exit, child_pid).await
    }

    /// Attaches to a process whose control transport a parent handed back.
    pub async fn attach(transport: Transport, identifier: &str, cfg: &Config) -> Result<Self, ProcessError> {
        Self::start(transport, identifier, cfg, None, 0).await
    }

    async fn start(
        transport: Transport,
        identifier: &str,
        cfg: &Config,
        mut exit: Option<oneshot::Receiver<ProcessError>>,
        child_pid: i32,
    ) -> Result<Self, ProcessError> {
        let frame = select! {
            msg = transport.read_message() => msg,
            err = exited(&mut exit) => return Err(err),
        };
        let registration = frame.and_then(|msg| parse_registration(&msg).map_err(TransportError::from));
        let (pid, parent_pid, actual) = match registration {
            Ok(parts) => parts,
            Err(source) => return Err(registration_failure(source, &mut exit, child_pid, cfg).await),
        };

        let kill = KillSettings {
            timeout: cfg.force_kill_timeout,
            poll: cfg.kill_poll_interval,
        };
        if actual != identifier {
            let _ = force_kill(pid, kill.timeout, kill.poll).await;
            return Err(ProcessError::IdentifierMismatch {
                expected: identifier.to_string(),
                actual,
            });
        }

        let (requests_tx, requests_rx) = mpsc::channel(cfg.boot_queue_capacity_clamped());
        let (phase_tx, phase_rx) = watch::channel(ProcessPhase::Starting);
        let phase_tx = PhaseTx(Arc::new(phase_tx));
        let (files_tx, files_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let reaps = exit.is_some();
        if let Some(exit) = exit {
            let phase = phase_tx.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                if let Ok(err) = exit.await {
                    if !stop.is_cancelled() {
                        phase.fail(err);
                    }
                }
            });
        }

        let runner = Runner {
            pid,
            transport: Arc::new(transport),
            phase: phase_tx,
            requests: requests_rx,
            files: Some(files_tx),
            stop: stop.clone(),
            report_pipe_close: !reaps,
        };
        let runner = tokio::spawn(runner.run());

        tracing::debug!(pid, parent_pid, identifier = %actual, "process registered");
        Ok(Self {
            pid,
            parent_pid,
            identifier: actual,
            requests: requests_tx,
            phase: phase_rx,
            files: Mutex::new(Some(file_stream(files_rx))),
            stop,
            stopped: AtomicBool::new(false),
            runner: Mutex::new(Some(runner)),
            kill,
        })
    }

    /// Process id reported at registration.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Parent process id reported at registration.
    pub fn parent_pid(&self) -> i32 {
        self.parent_pid
    }

    /// Identifier reported at registration.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Current phase.
    pub fn phase(&self) -> ProcessPhase {
        self.phase.borrow().clone()
    }

    /// Waits until the process is ready, or returns its failure.
    pub async fn ready(&self) -> Result<(), Arc<ProcessError>> {
        let mut rx = self.phase.clone();
        let phase = rx
            .wait_for(|p| !matches!(p, ProcessPhase::Starting))
            .await
            .map(|p| p.clone());
        match phase {
            Ok(ProcessPhase::Failed(err)) => Err(err),
            Ok(_) => Ok(()),
            Err(_) => std::future::pending().await,
        }
    }

    /// Waits until the process fails.
    pub async fn failed(&self) -> Arc<ProcessError> {
        let mut rx = self.phase.clone();
        let phase = rx
            .wait_for(|p| matches!(p, ProcessPhase::Failed(_)))
            .await
            .map(|p| p.clone());
        match phase {
            Ok(ProcessPhase::Failed(err)) => err,
            _ => std::future::pending().await,
        }
    }

    /// Takes the dependency-path stream. Returns `None` after the first call.
    pub fn take_files(&self) -> Option<FileStream> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Queues a boot request without blocking.
    pub fn boot(&self, req: BootRequest) {
        if self.stop.is_cancelled() {
            req.fail(BootError::Stopping);
            return;
        }
        match self.requests.try_send(req) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::warn!(pid = self.pid, "boot queue full");
                req.fail(BootError::QueueFull { pid: self.pid });
            }
            Err(mpsc::error::TrySendError::Closed(req)) => req.fail(BootError::Stopping),
        }
    }

    /// Terminates the process (SIGTERM, then SIGKILL after the configured
    /// timeout) and fails every queued request. Idempotent.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.cancel();
        let killed = force_kill(self.pid, self.kill.timeout, self.kill.poll).await;

        let runner = self
            .runner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(runner) = runner {
            let _ = runner.await;
        }
        killed
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Background half of a handle: initialization and the boot queue.
struct Runner {
    pid: i32,
    transport: Arc<Transport>,
    phase: PhaseTx,
    requests: mpsc::Receiver<BootRequest>,
    files: Option<mpsc::UnboundedSender<String>>,
    stop: CancellationToken,
    report_pipe_close: bool,
}

impl Runner {
    async fn run(mut self) {
        let stop = self.stop.clone();
        let initialized = select! {
            _ = stop.cancelled() => None,
            res = self.initialize() => Some(res),
        };
        match initialized {
            Some(Ok(())) => {
                self.phase.set_ready();
                self.serve().await;
            }
            Some(Err(err)) => {
                tracing::debug!(pid = self.pid, error = %err, "process failed to initialize");
                self.phase.fail(err);
            }
            None => {}
        }

        self.requests.close();
        while let Ok(req) = self.requests.try_recv() {
            req.fail(BootError::Stopping);
        }
    }

    async fn initialize(&mut self) -> Result<(), ProcessError> {
        let pid = self.pid;
        let lost = |source: TransportError| ProcessError::Transport { pid, source };

        let pipe = self.transport.read_fd().await.map_err(lost)?;
        let on_close = self
            .report_pipe_close
            .then(|| (self.phase.clone(), self.stop.clone()));
        // The stream ends when the reader drops the only sender.
        if let Some(files) = self.files.take() {
            tokio::spawn(read_features(pid, pipe, files, on_close));
        }

        let msg = self.transport.read_message().await.map_err(lost)?;
        match parse_action_response(&msg).map_err(|e| lost(e.into()))? {
            Ok(()) => Ok(()),
            Err(text) => Err(ProcessError::ActionFailed(text)),
        }
    }

    async fn serve(&mut self) {
        loop {
            let req = select! {
                _ = self.stop.cancelled() => return,
                req = self.requests.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
            };
            if req.is_abandoned() {
                continue;
            }

            let frame = req.kind().frame().encode();
            let relayed = select! {
                _ = self.stop.cancelled() => {
                    req.fail(BootError::Stopping);
                    return;
                }
                res = relay(&self.transport, &frame) => res,
            };
            match relayed {
                Ok(transport) => {
                    tracing::debug!(pid = self.pid, request = %frame, "boot request served");
                    req.respond(transport);
                }
                Err(source) => {
                    req.fail(BootError::Relay(Arc::from(source.to_string())));
                    self.phase.fail(ProcessError::Transport {
                        pid: self.pid,
                        source,
                    });
                    return;
                }
            }
        }
    }
}

/// Sends one spawn frame and receives the new process's control socket.
async fn relay(transport: &Transport, frame: &str) -> Result<Transport, TransportError> {
    let _exchange = transport.lock_exchange().await;
    transport.write_message(frame).await?;
    let fd = transport.read_fd().await?;
    Ok(Transport::from_fd(fd)?)
}

async fn read_features(
    pid: i32,
    fd: OwnedFd,
    files: mpsc::UnboundedSender<String>,
    on_close: Option<(PhaseTx, CancellationToken)>,
) {
    match pipe::Receiver::from_owned_fd(fd) {
        Ok(pipe) => {
            let mut lines = BufReader::new(pipe).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(path) = parse_feature_line(&line) {
                            let _ = files.send(path);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "error reading feature pipe");
                        break;
                    }
                }
            }
        }
        Err(e) => tracing::warn!(pid, error = %e, "feature descriptor is not a pipe"),
    }
    drop(files);

    if let Some((phase, stop)) = on_close {
        if !stop.is_cancelled() {
            phase.fail(ProcessError::Gone { pid });
        }
    }
}

fn file_stream(rx: mpsc::UnboundedReceiver<String>) -> FileStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|path| (path, rx)) }).boxed()
}

/// Resolves to the exit report of a spawned root, or never.
async fn exited(exit: &mut Option<oneshot::Receiver<ProcessError>>) -> ProcessError {
    let Some(rx) = exit.as_mut() else {
        return std::future::pending().await;
    };
    let report = rx.await;
    *exit = None;
    match report {
        Ok(err) => err,
        Err(_) => std::future::pending().await,
    }
}

/// Prefers the exit report over a transport error when the root died during registration.
async fn registration_failure(
    source: TransportError,
    exit: &mut Option<oneshot::Receiver<ProcessError>>,
    child_pid: i32,
    cfg: &Config,
) -> ProcessError {
    if exit.is_some() {
        if let Ok(err) = time::timeout(EXIT_REPORT_WAIT, exited(exit)).await {
            return err;
        }
        let _ = force_kill(child_pid, cfg.force_kill_timeout, cfg.kill_poll_interval).await;
    }
    ProcessError::Registration(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::boot::BootRequest;
    use std::os::fd::AsFd;

    struct FakePeer {
        transport: Transport,
        feature_tx: Option<OwnedFd>,
        child: tokio::process::Child,
    }

    /// Attaches a handle to an in-test peer that registers as `identifier`.
    async fn attach_fake(identifier: &str, cfg: &Config) -> (Result<ProcessHandle, ProcessError>, FakePeer) {
        let (ours, theirs) = Transport::pair().unwrap();
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap() as i32;
        theirs
            .write_message(&format!("P:{pid}:1:{identifier}"))
            .await
            .unwrap();
        let (read, write) = nix::unistd::pipe().unwrap();
        theirs.write_fd(read.as_fd()).await.unwrap();
        let handle = ProcessHandle::attach(ours, "code", cfg).await;
        let peer = FakePeer {
            transport: theirs,
            feature_tx: Some(write),
            child,
        };
        (handle, peer)
    }

    fn test_config() -> Config {
        Config {
            force_kill_timeout: Duration::from_millis(200),
            boot_queue_capacity: 2,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn ok_response_reaches_ready() {
        let cfg = test_config();
        let (handle, peer) = attach_fake("code", &cfg).await;
        let handle = handle.unwrap();
        peer.transport.write_message("R:OK").await.unwrap();
        handle.ready().await.unwrap();
        assert!(matches!(handle.phase(), ProcessPhase::Ready));
        assert_eq!(handle.identifier(), "code");
        assert_eq!(handle.parent_pid(), 1);
        drop(peer);
    }

    #[tokio::test]
    async fn error_response_fails_with_text() {
        let cfg = test_config();
        let (handle, peer) = attach_fake("code", &cfg).await;
        let handle = handle.unwrap();
        peer.transport
            .write_message("R:cannot load such file -- code")
            .await
            .unwrap();
        let err = handle.ready().await.unwrap_err();
        assert_eq!(err.to_string(), "cannot load such file -- code");
    }

    #[tokio::test]
    async fn identifier_mismatch_is_rejected() {
        let cfg = test_config();
        let (handle, mut peer) = attach_fake("data", &cfg).await;
        let err = handle.unwrap_err();
        assert_eq!(err.as_label(), "process_identifier_mismatch");
        peer.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn features_stream_until_pipe_closes() {
        let cfg = test_config();
        let (handle, mut peer) = attach_fake("code", &cfg).await;
        let handle = handle.unwrap();
        let write = peer.feature_tx.take().unwrap();
        nix::unistd::write(&write, b"F:/app/code.rb\n/app/lib.rb\n").unwrap();
        drop(write);

        let files: Vec<String> = handle.take_files().unwrap().collect().await;
        assert_eq!(files, vec!["/app/code.rb", "/app/lib.rb"]);
        assert!(handle.take_files().is_none());
        assert_eq!(handle.failed().await.as_label(), "process_gone");
    }

    #[tokio::test]
    async fn full_queue_fails_excess_requests_immediately() {
        let cfg = test_config();
        let (handle, peer) = attach_fake("code", &cfg).await;
        let handle = handle.unwrap();
        peer.transport.write_message("R:OK").await.unwrap();
        handle.ready().await.unwrap();

        // The peer never answers S: frames, so accepted requests stay queued.
        let pending: Vec<_> = (0..6)
            .map(|i| {
                let (req, pending) = BootRequest::node(format!("child{i}"));
                handle.boot(req);
                pending
            })
            .collect();

        let mut queue_full = 0;
        for pending in pending {
            if let Ok(res) = time::timeout(Duration::from_millis(100), pending.wait()).await {
                assert!(matches!(res, Err(BootError::QueueFull { .. })));
                queue_full += 1;
            }
        }
        assert_eq!(queue_full, 4);
    }

    #[tokio::test]
    async fn stop_fails_queued_requests_and_kills() {
        let cfg = test_config();
        let (handle, mut peer) = attach_fake("code", &cfg).await;
        let handle = handle.unwrap();
        peer.transport.write_message("R:OK").await.unwrap();
        handle.ready().await.unwrap();

        let (req, pending) = BootRequest::command("rake");
        handle.boot(req);
        let reaper = tokio::spawn(async move { peer.child.wait().await });
        handle.stop().await.unwrap();
        handle.stop().await.unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "process is stopping");
        reaper.await.unwrap().unwrap();

        let (req, pending) = BootRequest::node("late");
        handle.boot(req);
        assert!(matches!(pending.wait().await, Err(BootError::Stopping)));
    }

    #[tokio::test]
    async fn served_request_returns_child_transport() {
        let cfg = test_config();
        let (handle, peer) = attach_fake("code", &cfg).await;
        let handle = handle.unwrap();
        peer.transport.write_message("R:OK").await.unwrap();
        handle.ready().await.unwrap();

        let (req, pending) = BootRequest::command("rake");
        handle.boot(req);
        assert_eq!(peer.transport.read_message().await.unwrap(), "C:rake");
        let (child_ours, child_theirs) = Transport::pair().unwrap();
        peer.transport.write_fd(child_ours.as_fd()).await.unwrap();
        drop(child_ours);

        let child = pending.wait().await.unwrap();
        child_theirs.write_message("hello").await.unwrap();
        assert_eq!(child.read_message().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn root_that_exits_reports_output() {
        let cfg = test_config();
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo loading app; echo boom >&2; exit 3".to_string(),
        ];
        let err = ProcessHandle::spawn(&argv, "boot", &cfg).await.unwrap_err();
        let text = err.to_string();
        assert_eq!(err.as_label(), "process_exited");
        assert!(text.contains("loading app"), "{text}");
        assert!(text.contains("boom"), "{text}");
    }

    #[tokio::test]
    async fn empty_command_line_is_rejected() {
        let err = ProcessHandle::spawn(&[], "boot", &Config::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::EmptyCommandLine));
    }
}
