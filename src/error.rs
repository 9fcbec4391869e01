//! Error types used by the forkvisor runtime.
//!
//! One enum per concern, ordered from the wire upwards:
//!
//! - [`FrameError`] — a frame could not be parsed.
//! - [`TransportError`] — the control transport failed (I/O, closed, descriptor ordering).
//! - [`ProcessError`] — an OS process failed to spawn, register, initialize, or crashed.
//! - [`BootError`] — a boot request could not be served.
//! - [`ConfigError`] — the tree topology handed to the builder is inconsistent.
//! - [`ClientError`] — a client handshake step failed.
//! - [`RuntimeError`] — the supervisor itself cannot continue.
//! - [`AgentError`] — the node-side runner lost its connection or could not fork.
//!
//! Every enum provides `as_label` (stable snake_case label for logs).

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// # Errors produced while parsing frames.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame carries a tag other than the one the reader expected.
    #[error("expected frame type {expected}, got {frame:?}")]
    UnexpectedTag {
        /// Tag the reader expected (`P`, `R`, ...).
        expected: &'static str,
        /// Raw frame text.
        frame: String,
    },

    /// The frame has the right tag but a malformed body.
    #[error("malformed frame {frame:?}: {detail}")]
    Malformed {
        /// Raw frame text.
        frame: String,
        /// What was wrong with it.
        detail: &'static str,
    },

    /// The text to be written contains the frame terminator.
    #[error("frame contains the terminator byte: {frame:?}")]
    ContainsTerminator {
        /// Offending text.
        frame: String,
    },
}

impl FrameError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            FrameError::UnexpectedTag { .. } => "frame_unexpected_tag",
            FrameError::Malformed { .. } => "frame_malformed",
            FrameError::ContainsTerminator { .. } => "frame_contains_terminator",
        }
    }
}

/// # Errors produced by the control transport.
///
/// Fatal only to the one connection or process involved.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying socket I/O failed.
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the socket.
    #[error("transport closed by peer")]
    Closed,

    /// A message was expected but only a descriptor arrived.
    #[error("expected a message, received a file descriptor")]
    UnexpectedDescriptor,

    /// A descriptor was expected but none arrived.
    #[error("expected a file descriptor, none received")]
    MissingDescriptor,

    /// A frame was received or about to be sent that does not parse.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl TransportError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportError::Io(_) => "transport_io",
            TransportError::Closed => "transport_closed",
            TransportError::UnexpectedDescriptor => "transport_unexpected_fd",
            TransportError::MissingDescriptor => "transport_missing_fd",
            TransportError::Frame(_) => "transport_frame",
        }
    }
}

impl From<nix::Error> for TransportError {
    fn from(errno: nix::Error) -> Self {
        TransportError::Io(io::Error::from(errno))
    }
}

/// # Errors produced by an OS process managed by a node.
///
/// Terminal for that node's current process only; absorbed by the Crashed state.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The command line was empty.
    #[error("empty command line")]
    EmptyCommandLine,

    /// The OS refused to start the process.
    #[error("error starting process: {0}")]
    Spawn(#[source] io::Error),

    /// The process exited (before or after registering).
    #[error("process exited with {status}. Output was:\n{output}")]
    Exited {
        /// Rendered exit status.
        status: String,
        /// Tail of the captured stdout/stderr.
        output: String,
    },

    /// Registration frame or hand-off was invalid.
    #[error("error registering process: {0}")]
    Registration(#[source] TransportError),

    /// The process registered under another name.
    #[error("booted node with identifier {actual:?} but expected {expected:?}")]
    IdentifierMismatch {
        /// Name the node asked for.
        expected: String,
        /// Name the process reported.
        actual: String,
    },

    /// The process ran its action and reported a failure.
    #[error("{0}")]
    ActionFailed(String),

    /// The control transport broke after registration.
    #[error("process {pid} lost its control transport: {source}")]
    Transport {
        /// Process id.
        pid: i32,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The process's feature channel closed while it was supposed to be alive.
    #[error("process {pid} went away")]
    Gone {
        /// Process id.
        pid: i32,
    },

    /// Signalling the process failed.
    #[error("error signalling pid {pid}: {source}")]
    Signal {
        /// Process id.
        pid: i32,
        /// Errno reported by `kill(2)`.
        #[source]
        source: nix::Error,
    },
}

impl ProcessError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessError::EmptyCommandLine => "process_empty_command",
            ProcessError::Spawn(_) => "process_spawn",
            ProcessError::Exited { .. } => "process_exited",
            ProcessError::Registration(_) => "process_registration",
            ProcessError::IdentifierMismatch { .. } => "process_identifier_mismatch",
            ProcessError::ActionFailed(_) => "process_action_failed",
            ProcessError::Transport { .. } => "process_transport",
            ProcessError::Gone { .. } => "process_gone",
            ProcessError::Signal { .. } => "process_signal",
        }
    }
}

/// # Errors delivered to the requester of a boot.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum BootError {
    /// The process serving the request is stopping; retry against the next incarnation.
    #[error("process is stopping")]
    Stopping,

    /// The process's boot queue is full.
    #[error("request queue for process {pid} is full")]
    QueueFull {
        /// Process whose queue overflowed.
        pid: i32,
    },

    /// The node's own inbox is full, typically while its process is still booting.
    #[error("request queue for node {0:?} is full")]
    InboxFull(Arc<str>),

    /// The parent node is crashed; carries the parent's error text.
    #[error("parent crashed: {0}")]
    ParentCrashed(Arc<str>),

    /// The node was shut down and no longer accepts requests.
    #[error("node {0:?} is stopped")]
    NodeStopped(Arc<str>),

    /// The reply slot was dropped without an answer.
    #[error("boot request for {0:?} was abandoned")]
    Abandoned(Arc<str>),

    /// Relaying the request to the process failed.
    #[error("boot relay failed: {0}")]
    Relay(Arc<str>),
}

impl BootError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BootError::Stopping => "boot_stopping",
            BootError::QueueFull { .. } => "boot_queue_full",
            BootError::InboxFull(_) => "boot_inbox_full",
            BootError::ParentCrashed(_) => "boot_parent_crashed",
            BootError::NodeStopped(_) => "boot_node_stopped",
            BootError::Abandoned(_) => "boot_abandoned",
            BootError::Relay(_) => "boot_relay",
        }
    }

    /// Indicates whether the caller may retry the request.
    ///
    /// Returns `true` for [`BootError::Stopping`] and the two queue-full variants.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BootError::Stopping | BootError::QueueFull { .. } | BootError::InboxFull(_)
        )
    }
}

/// # Errors detected while building the process tree.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The root command line is empty.
    #[error("root node {0:?} has an empty command line")]
    EmptyCommandLine(String),

    /// Two nodes share a name.
    #[error("duplicate node name {0:?}")]
    DuplicateNode(String),

    /// A node or command names a parent that does not exist.
    #[error("unknown parent node {parent:?} for {child:?}")]
    UnknownParent {
        /// Missing parent.
        parent: String,
        /// Node or command that referenced it.
        child: String,
    },

    /// A command name or alias is already taken.
    #[error("command name {name:?} is already used by command {existing:?}")]
    NameCollision {
        /// Colliding name or alias.
        name: String,
        /// Command that owns it.
        existing: String,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::EmptyCommandLine(_) => "config_empty_command",
            ConfigError::DuplicateNode(_) => "config_duplicate_node",
            ConfigError::UnknownParent { .. } => "config_unknown_parent",
            ConfigError::NameCollision { .. } => "config_name_collision",
        }
    }
}

/// # Errors produced by a client handshake.
///
/// Surfaced to the requesting client only.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ClientError {
    /// The requested name resolves to no command.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// The owning node could not boot a command process.
    #[error(transparent)]
    Boot(#[from] BootError),

    /// Talking to the client or the command process failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Writing to the client's terminal failed.
    #[error("error writing to client terminal: {0}")]
    Terminal(#[source] io::Error),

    /// The supervisor shut down before the command finished.
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl ClientError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ClientError::UnknownCommand(_) => "client_unknown_command",
            ClientError::Boot(e) => e.as_label(),
            ClientError::Transport(e) => e.as_label(),
            ClientError::Terminal(_) => "client_terminal",
            ClientError::ShuttingDown => "client_shutting_down",
        }
    }
}

/// # Errors produced by the supervisor runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The rendezvous socket is already bound by another instance.
    #[error("another instance is already running on {path:?}; remove the socket and try again")]
    AlreadyRunning {
        /// Socket path.
        path: PathBuf,
    },

    /// The rendezvous socket could not be created.
    #[error("cannot listen on {path:?}: {source}")]
    Listener {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The file watcher could not be created.
    #[error("file watcher failed: {0}")]
    Watcher(#[from] notify::Error),

    /// Shutdown grace period was exceeded; some nodes did not stop in time.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Nodes that had not reached Stopped.
        stuck: Vec<String>,
    },

    /// Signal handlers could not be installed.
    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] io::Error),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use forkvisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::AlreadyRunning { .. } => "runtime_already_running",
            RuntimeError::Listener { .. } => "runtime_listener",
            RuntimeError::Watcher(_) => "runtime_watcher",
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::Signals(_) => "runtime_signals",
        }
    }
}

/// # Errors produced inside a node process by [`crate::agent`].
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AgentError {
    /// `FORKVISOR_MASTER_FD` is unset or not a descriptor number.
    #[error("{var} is missing or invalid: {value:?}")]
    MasterFd {
        /// Variable name.
        var: &'static str,
        /// Raw value, if set.
        value: Option<String>,
    },

    /// Talking to the parent or the supervisor failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A system call (fork, pipe, wait) failed.
    #[error("{call} failed: {source}")]
    Sys {
        /// Name of the failing call.
        call: &'static str,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
}

impl AgentError {
    pub(crate) fn sys(call: &'static str) -> impl FnOnce(nix::Error) -> Self {
        move |source| AgentError::Sys { call, source }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            AgentError::MasterFd { .. } => "agent_master_fd",
            AgentError::Transport(e) => e.as_label(),
            AgentError::Sys { .. } => "agent_sys",
        }
    }
}
