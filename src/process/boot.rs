//! # Boot requests: single-response spawn requests.
//!
//! A [`BootRequest`] pairs the frame sent to a live process (`S:<name>` or
//! `C:<name>`) with a one-shot reply slot. The requester keeps the matching
//! [`PendingBoot`] and awaits the outcome.
//!
//! ```text
//! requester ──BootRequest──► Node inbox ──► ProcessHandle queue ──► process
//!     ▲                                                               │
//!     └──────────── PendingBoot::wait() ◄── respond(Transport) ◄──────┘
//! ```
//!
//! ## Rules
//! - A request is answered exactly once: [`BootRequest::respond`] and
//!   [`BootRequest::fail`] consume it.
//! - A request dropped unanswered resolves as [`BootError::Abandoned`].

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::{error::BootError, transport::Frame, transport::Transport};

/// What the live process is asked to fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootKind {
    /// A child node running the named action.
    Node(Arc<str>),
    /// A command process for the named command.
    Command(Arc<str>),
}

impl BootKind {
    /// Name of the node or command being booted.
    pub fn name(&self) -> &Arc<str> {
        match self {
            BootKind::Node(name) | BootKind::Command(name) => name,
        }
    }

    /// Frame relayed to the live process.
    pub fn frame(&self) -> Frame {
        match self {
            BootKind::Node(name) => Frame::SpawnNode(name.to_string()),
            BootKind::Command(name) => Frame::SpawnCommand(name.to_string()),
        }
    }
}

/// Outcome of a boot: the new process's control transport.
pub type BootResult = Result<Transport, BootError>;

/// A queued request to fork a new process from a live one.
#[derive(Debug)]
pub struct BootRequest {
    kind: BootKind,
    reply: oneshot::Sender<BootResult>,
}

/// Requester side of a [`BootRequest`].
#[derive(Debug)]
pub struct PendingBoot {
    name: Arc<str>,
    rx: oneshot::Receiver<BootResult>,
}

impl BootRequest {
    /// Creates a request to boot child node `name`.
    pub fn node(name: impl Into<Arc<str>>) -> (Self, PendingBoot) {
        Self::new(BootKind::Node(name.into()))
    }

    /// Creates a request to boot a process for command `name`.
    pub fn command(name: impl Into<Arc<str>>) -> (Self, PendingBoot) {
        Self::new(BootKind::Command(name.into()))
    }

    fn new(kind: BootKind) -> (Self, PendingBoot) {
        let (reply, rx) = oneshot::channel();
        let pending = PendingBoot {
            name: kind.name().clone(),
            rx,
        };
        (Self { kind, reply }, pending)
    }

    /// What is being booted.
    pub fn kind(&self) -> &BootKind {
        &self.kind
    }

    /// Delivers the new process's transport.
    pub fn respond(self, transport: Transport) {
        let _ = self.reply.send(Ok(transport));
    }

    /// Fails the request.
    pub fn fail(self, err: BootError) {
        let _ = self.reply.send(Err(err));
    }

    /// Returns `true` if the requester stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

impl PendingBoot {
    /// Waits for the request to be answered.
    pub async fn wait(self) -> BootResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(BootError::Abandoned(self.name)),
        }
    }
}
