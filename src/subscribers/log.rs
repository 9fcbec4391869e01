//! # Logging subscriber.
//!
//! [`LogWriter`] renders every event through `tracing` under the
//! `forkvisor::events` target, one line per event:
//!
//! ```text
//! INFO  forkvisor::events: node ready node=code pid=4242
//! ERROR forkvisor::events: node crashed node=test reason="parent crashed: ..."
//! INFO  forkvisor::events: files changed reason="app/models/user.rb"
//! ```

use async_trait::async_trait;

use super::Subscribe;
use crate::events::{Event, EventKind};

const TARGET: &str = "forkvisor::events";

/// Renders events as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWriter;

impl LogWriter {
    /// Creates the writer.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let node = e.node.as_deref().unwrap_or("");
        let command = e.command.as_deref().unwrap_or("");
        let reason = e.reason.as_deref().unwrap_or("");
        let pid = e.pid.unwrap_or_default();

        match e.kind {
            EventKind::NodeUnbooted => tracing::debug!(target: TARGET, node, "node unbooted"),
            EventKind::NodeBooting => tracing::debug!(target: TARGET, node, pid, "node booting"),
            EventKind::NodeReady => tracing::info!(target: TARGET, node, pid, "node ready"),
            EventKind::NodeCrashed => tracing::error!(target: TARGET, node, reason, "node crashed"),
            EventKind::NodeStopped => tracing::debug!(target: TARGET, node, "node stopped"),
            EventKind::FilesChanged => tracing::info!(target: TARGET, reason, "files changed"),
            EventKind::RestartRequested => {
                tracing::info!(target: TARGET, node, reason, "restart requested")
            }
            EventKind::CommandBooted => {
                tracing::info!(target: TARGET, command, node, pid, "command booted")
            }
            EventKind::CommandFinished => {
                tracing::info!(target: TARGET, command, pid, status = reason, "command finished")
            }
            EventKind::ClientFailed => {
                tracing::warn!(target: TARGET, command, reason, "client request failed")
            }
            EventKind::ShutdownRequested => tracing::info!(target: TARGET, "shutdown requested"),
            EventKind::AllStoppedWithin => tracing::info!(target: TARGET, "all nodes stopped within grace"),
            EventKind::GraceExceeded => tracing::warn!(target: TARGET, stuck = reason, "grace exceeded"),
            EventKind::SubscriberOverflow => {
                tracing::warn!(target: TARGET, subscriber = node, reason, "subscriber dropped event")
            }
            EventKind::SubscriberPanicked => {
                tracing::error!(target: TARGET, subscriber = node, reason, "subscriber panicked")
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
