//! # Runtime events emitted by nodes, the tree, the client handler and the supervisor.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Node lifecycle**: state machine transitions (unbooted, booting, ready, crashed, stopped)
//! - **Restart propagation**: file-change batches and the restarts they cause
//! - **Commands**: client handshakes (booted, finished, failed)
//! - **Runtime**: shutdown and subscriber health
//!
//! The [`Event`] struct carries additional metadata such as timestamps, node
//! and command names, process ids and reasons.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use forkvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::NodeCrashed)
//!     .with_node("code")
//!     .with_pid(4242)
//!     .with_reason("undefined method `boot'");
//!
//! assert_eq!(ev.kind, EventKind::NodeCrashed);
//! assert_eq!(ev.node.as_deref(), Some("code"));
//! assert_eq!(ev.pid, Some(4242));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

/// Global sequence counter for event ordering. `0` is never issued.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `node`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `node`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Shutdown events ===
    /// Shutdown requested (OS signal or caller future).
    ShutdownRequested,

    /// Every node reached Stopped within the grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some nodes did not stop in time.
    ///
    /// Sets:
    /// - `reason`: comma-separated list of stuck nodes
    GraceExceeded,

    // === Node lifecycle ===
    /// Node entered Unbooted and is about to spawn.
    ///
    /// Sets:
    /// - `node`: node name
    NodeUnbooted,

    /// Node's process registered; its action is running.
    ///
    /// Sets:
    /// - `node`: node name
    /// - `pid`: process id
    NodeBooting,

    /// Node's process finished its action; boot requests are served.
    ///
    /// Sets:
    /// - `node`: node name
    /// - `pid`: process id
    NodeReady,

    /// Node failed to spawn, initialize, or its process died.
    ///
    /// Sets:
    /// - `node`: node name
    /// - `pid`: process id, when one was registered
    /// - `reason`: error text
    NodeCrashed,

    /// Node reached the terminal Stopped state (tree shutdown).
    ///
    /// Sets:
    /// - `node`: node name
    NodeStopped,

    // === Restart propagation ===
    /// A debounced batch of changed files arrived.
    ///
    /// Sets:
    /// - `reason`: changed paths, comma-separated
    FilesChanged,

    /// A node was asked to restart.
    ///
    /// Sets:
    /// - `node`: node name
    /// - `reason`: what triggered it (a changed path or the parent's name)
    RestartRequested,

    // === Commands ===
    /// A command process was booted and handed to its client.
    ///
    /// Sets:
    /// - `command`: command name
    /// - `node`: owning node
    /// - `pid`: command process id
    CommandBooted,

    /// A command process reported its exit status.
    ///
    /// Sets:
    /// - `command`: command name
    /// - `pid`: command process id
    /// - `reason`: exit status as relayed
    CommandFinished,

    /// A client handshake failed; the client received pid 0 and exit status 1.
    ///
    /// Sets:
    /// - `command`: requested name
    /// - `reason`: error text
    ClientFailed,
}

impl EventKind {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EventKind::SubscriberPanicked => "subscriber_panicked",
            EventKind::SubscriberOverflow => "subscriber_overflow",
            EventKind::ShutdownRequested => "shutdown_requested",
            EventKind::AllStoppedWithin => "all_stopped_within",
            EventKind::GraceExceeded => "grace_exceeded",
            EventKind::NodeUnbooted => "node_unbooted",
            EventKind::NodeBooting => "node_booting",
            EventKind::NodeReady => "node_ready",
            EventKind::NodeCrashed => "node_crashed",
            EventKind::NodeStopped => "node_stopped",
            EventKind::FilesChanged => "files_changed",
            EventKind::RestartRequested => "restart_requested",
            EventKind::CommandBooted => "command_booted",
            EventKind::CommandFinished => "command_finished",
            EventKind::ClientFailed => "client_failed",
        }
    }
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Node name (or subscriber name for subscriber events).
    pub node: Option<Arc<str>>,
    /// Command name, for command events.
    pub command: Option<Arc<str>>,
    /// OS process id.
    pub pid: Option<i32>,
    /// Human-readable reason (errors, paths, exit statuses, etc.).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            node: None,
            command: None,
            pid: None,
            reason: None,
        }
    }

    /// Attaches a node name.
    #[inline]
    pub fn with_node(mut self, node: impl Into<Arc<str>>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Attaches a command name.
    #[inline]
    pub fn with_command(mut self, command: impl Into<Arc<str>>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Attaches a process id.
    #[inline]
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_node(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_node(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }

    #[inline]
    pub fn is_subscriber_panic(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic() {
        let a = Event::new(EventKind::NodeReady);
        let b = Event::new(EventKind::NodeReady);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn overflow_event_names_subscriber() {
        let ev = Event::subscriber_overflow("log", "full");
        assert!(ev.is_subscriber_overflow());
        assert_eq!(ev.node.as_deref(), Some("log"));
        assert_eq!(ev.reason.as_deref(), Some("subscriber=log reason=full"));
    }
}
