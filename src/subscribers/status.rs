//! # Node state tracker with sequence-based ordering.
//!
//! Maintains the last known lifecycle state of every node from bus events,
//! for status rendering and for naming stuck nodes on shutdown.
//!
//! ```text
//! Bus ──► SubscriberSet ──► StatusTracker::update()
//!                                  │
//!                                  ▼
//!                       HashMap<String, Entry>
//!                     (name → {seq, state, pid, error})
//! ```
//!
//! ## Rules
//! - Only node lifecycle events (`NodeUnbooted` .. `NodeStopped`) change state.
//! - Other events naming a node advance its seq only.
//! - Events with `seq <= last_seq` are rejected (stale).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Subscribe;
use crate::events::{Event, EventKind};
use crate::node::{NodeState, NodeStatus};

#[derive(Debug, Clone)]
struct Entry {
    last_seq: u64,
    status: NodeStatus,
}

/// Tracks node states from lifecycle events.
#[derive(Default)]
pub struct StatusTracker {
    state: RwLock<HashMap<String, Entry>>,
}

impl StatusTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `ev` if it is newer than the last event seen for its node.
    ///
    /// Returns `true` if the node's state changed.
    pub async fn update(&self, ev: &Event) -> bool {
        let Some(name) = ev.node.as_deref() else {
            return false;
        };
        let next = match ev.kind {
            EventKind::NodeUnbooted => Some(NodeState::Unbooted),
            EventKind::NodeBooting => Some(NodeState::Booting),
            EventKind::NodeReady => Some(NodeState::Ready),
            EventKind::NodeCrashed => Some(NodeState::Crashed),
            EventKind::NodeStopped => Some(NodeState::Stopped),
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked => return false,
            _ => None,
        };

        let mut state = self.state.write().await;
        let entry = state.entry(name.to_string()).or_insert(Entry {
            last_seq: 0,
            status: NodeStatus::default(),
        });
        if ev.seq <= entry.last_seq {
            return false;
        }
        entry.last_seq = ev.seq;

        let Some(next) = next else {
            return false;
        };
        entry.status = NodeStatus {
            state: next,
            pid: ev.pid.filter(|_| matches!(next, NodeState::Booting | NodeState::Ready)),
            error: ev.reason.clone().filter(|_| next == NodeState::Crashed),
        };
        true
    }

    /// Last known status of every node seen so far.
    pub async fn snapshot(&self) -> BTreeMap<String, NodeStatus> {
        self.state
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status.clone()))
            .collect()
    }

    /// Last known state of `name`.
    pub async fn state(&self, name: &str) -> Option<NodeState> {
        self.state.read().await.get(name).map(|e| e.status.state)
    }

    /// Sorted names of nodes not yet in Stopped.
    pub async fn not_stopped(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.status.state != NodeState::Stopped)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl Subscribe for StatusTracker {
    async fn on_event(&self, ev: &Event) {
        self.update(ev).await;
    }

    fn name(&self) -> &'static str {
        "status"
    }

    fn queue_capacity(&self) -> usize {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn follows_lifecycle_and_rejects_stale_events() {
        let tracker = StatusTracker::new();
        let booting = Event::new(EventKind::NodeBooting).with_node("code").with_pid(7);
        let ready = Event::new(EventKind::NodeReady).with_node("code").with_pid(7);
        let crashed = Event::new(EventKind::NodeCrashed)
            .with_node("code")
            .with_reason("LoadError");

        assert!(tracker.update(&ready).await);
        assert!(!tracker.update(&booting).await);
        assert_eq!(tracker.state("code").await, Some(NodeState::Ready));

        assert!(tracker.update(&crashed).await);
        let snap = tracker.snapshot().await;
        assert_eq!(snap["code"].state, NodeState::Crashed);
        assert_eq!(snap["code"].error.as_deref(), Some("LoadError"));
        assert_eq!(snap["code"].pid, None);
    }

    #[tokio::test]
    async fn reports_nodes_not_stopped() {
        let tracker = StatusTracker::new();
        for (name, kind) in [
            ("boot", EventKind::NodeStopped),
            ("test", EventKind::NodeReady),
            ("code", EventKind::NodeBooting),
        ] {
            tracker.update(&Event::new(kind).with_node(name)).await;
        }
        let restart = Event::new(EventKind::RestartRequested).with_node("test");
        assert!(!tracker.update(&restart).await);

        assert_eq!(tracker.not_stopped().await, vec!["code", "test"]);
        assert_eq!(tracker.state("data").await, None);
    }
}
