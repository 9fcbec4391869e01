//! Node lifecycle states and the status snapshot published for readers.

use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a node.
///
/// ```text
/// Unbooted ──► Booting ──► Ready ──► Crashed
///    ▲                       │          │
///    └──────── restart ──────┴──────────┘
///
/// any state ──► Stopped (tree shutdown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// No process; a spawn is about to be attempted.
    Unbooted,
    /// A process registered and is running its action.
    Booting,
    /// The process is ready and serving boot requests.
    Ready,
    /// The last spawn or process failed; requests are rejected until a restart.
    Crashed,
    /// Terminal state reached at tree shutdown.
    Stopped,
}

impl NodeState {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            NodeState::Unbooted => "unbooted",
            NodeState::Booting => "booting",
            NodeState::Ready => "ready",
            NodeState::Crashed => "crashed",
            NodeState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Current state.
    pub state: NodeState,
    /// Pid of the live process, if any.
    pub pid: Option<i32>,
    /// Last error, set while Crashed.
    pub error: Option<Arc<str>>,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            state: NodeState::Unbooted,
            pid: None,
            error: None,
        }
    }
}
