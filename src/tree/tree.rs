//! # The process tree: indices, command routing and restart propagation.
//!
//! Built once by [`TreeBuilder`](super::TreeBuilder); the name and command
//! indices are read-only afterwards and need no synchronization.
//!
//! ## Restart propagation
//! ```text
//! restart_nodes_with_features(paths)      (one pass at a time)
//!   for path in paths:
//!     walk from root:
//!       node has path ─► node.request_restart(), do not descend
//!       otherwise      ─► visit children
//! ```
//! A restarting node restarts its own children, so the subtree below a
//! matched node is covered without visiting it here.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::events::{Bus, Event, EventKind};
use crate::node::{Command, Node, NodeContext, NodeState, NodeStatus};
use crate::process::CommandProcess;

/// Point-in-time view of the tree for status rendering.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TreeSnapshot {
    /// Root node name.
    pub root: String,
    /// Status of every node.
    pub nodes: BTreeMap<String, NodeStatus>,
    /// Command name → owning node.
    pub commands: BTreeMap<String, String>,
    /// Alias → command name.
    pub aliases: BTreeMap<String, String>,
    /// Node → direct children, in declaration order.
    pub children: BTreeMap<String, Vec<String>>,
}

/// The node/command hierarchy.
pub struct ProcessTree {
    root: Arc<Node>,
    nodes: HashMap<Arc<str>, Arc<Node>>,
    commands: HashMap<Arc<str>, Arc<Command>>,
    aliases: HashMap<Arc<str>, Arc<Command>>,
    bus: Bus,
    restart_lock: tokio::sync::Mutex<()>,
    token: CancellationToken,
    running: Mutex<Option<JoinSet<()>>>,
}

impl std::fmt::Debug for ProcessTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTree")
            .field("root", &self.root.name())
            .field("nodes", &self.nodes.len())
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl ProcessTree {
    pub(super) fn new(
        root: Arc<Node>,
        nodes: HashMap<Arc<str>, Arc<Node>>,
        commands: HashMap<Arc<str>, Arc<Command>>,
        aliases: HashMap<Arc<str>, Arc<Command>>,
        bus: Bus,
    ) -> Self {
        Self {
            root,
            nodes,
            commands,
            aliases,
            bus,
            restart_lock: tokio::sync::Mutex::new(()),
            token: CancellationToken::new(),
            running: Mutex::new(None),
        }
    }

    /// Root node.
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Looks up a node by name.
    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.get(name)
    }

    /// Every node, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    /// Resolves a command by primary name, then by alias. Case-sensitive.
    pub fn resolve_command(&self, name: &str) -> Option<&Arc<Command>> {
        self.commands.get(name).or_else(|| self.aliases.get(name))
    }

    /// Resolves `name` and boots a command process on its owning node.
    pub async fn boot_command(&self, name: &str) -> Result<(Arc<Command>, CommandProcess), ClientError> {
        let command = self
            .resolve_command(name)
            .ok_or_else(|| ClientError::UnknownCommand(name.to_string()))?;
        let node = self
            .nodes
            .get(command.node())
            .ok_or_else(|| ClientError::UnknownCommand(name.to_string()))?;
        let process = node.boot_command(command.name()).await?;
        Ok((command.clone(), process))
    }

    /// Restarts every node whose feature set contains one of `paths`.
    ///
    /// Passes are serialized. Returns the nodes that received a restart
    /// request, in visiting order.
    pub async fn restart_nodes_with_features(&self, paths: &[String]) -> Vec<Arc<str>> {
        let _pass = self.restart_lock.lock().await;
        self.bus.publish(
            Event::new(EventKind::FilesChanged).with_reason(paths.join(", ")),
        );

        let mut restarted: Vec<Arc<str>> = Vec::new();
        let mut seen: HashSet<Arc<str>> = HashSet::new();
        for path in paths {
            let mut stack = vec![Arc::clone(&self.root)];
            while let Some(node) = stack.pop() {
                if !node.has_feature(path) {
                    stack.extend(node.children().iter().rev().cloned());
                    continue;
                }
                if !seen.insert(node.name().clone()) {
                    continue;
                }
                tracing::info!(node = %node.name(), path = %path, "dependency changed, restarting node");
                self.bus.publish(
                    Event::new(EventKind::RestartRequested)
                        .with_node(node.name().clone())
                        .with_reason(path.as_str()),
                );
                node.request_restart();
                restarted.push(node.name().clone());
            }
        }
        restarted
    }

    /// Starts one task per node. Calling it again has no effect.
    pub fn run(&self, ctx: NodeContext) {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running.is_some() {
            tracing::warn!("process tree is already running");
            return;
        }
        let mut set = JoinSet::new();
        for node in self.nodes.values() {
            set.spawn(Arc::clone(node).run(ctx.clone(), self.token.child_token()));
        }
        tracing::debug!(nodes = self.nodes.len(), "process tree started");
        *running = Some(set);
    }

    /// Stops every node and waits up to `grace` for their tasks.
    ///
    /// On timeout returns the names of nodes that had not reached Stopped.
    pub async fn stop(&self, grace: Duration) -> Result<(), Vec<String>> {
        self.token.cancel();
        let set = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut set) = set else {
            return Ok(());
        };

        let drained = time::timeout(grace, async {
            while let Some(res) = set.join_next().await {
                if let Err(err) = res {
                    tracing::warn!(error = %err, "node task ended abnormally");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                set.abort_all();
                let mut stuck: Vec<String> = self
                    .nodes
                    .values()
                    .filter(|n| n.state() != NodeState::Stopped)
                    .map(|n| n.name().to_string())
                    .collect();
                stuck.sort();
                Err(stuck)
            }
        }
    }

    /// Captures node states and routing tables.
    pub fn snapshot(&self) -> TreeSnapshot {
        let nodes = self
            .nodes
            .iter()
            .map(|(name, node)| (name.to_string(), node.status()))
            .collect();
        let children = self
            .nodes
            .iter()
            .map(|(name, node)| {
                let kids = node.children().iter().map(|c| c.name().to_string()).collect();
                (name.to_string(), kids)
            })
            .collect();
        let commands = self
            .commands
            .iter()
            .map(|(name, cmd)| (name.to_string(), cmd.node().to_string()))
            .collect();
        let aliases = self
            .aliases
            .iter()
            .map(|(alias, cmd)| (alias.to_string(), cmd.name().to_string()))
            .collect();

        TreeSnapshot {
            root: self.root.name().to_string(),
            nodes,
            commands,
            aliases,
            children,
        }
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
