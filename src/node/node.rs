//! # Node: one vertex of the process tree and its lifecycle state machine.
//!
//! Each node runs a single task ([`Node::run`]) that drives its OS process
//! through the lifecycle and serializes boot requests from children and
//! clients through one inbox.
//!
//! ## State machine
//! ```text
//! loop {
//!   Unbooted ─► root: spawner.spawn_root(argv)
//!             └ child: BootRequest::node(name) ─► parent inbox (retry on Stopping)
//!        ok ─► Booting, err ─► Crashed
//!   Booting  ─► drain feature paths; wait ready (─► Ready) or failure (─► Crashed)
//!   Ready    ─► select:
//!               ├─ restart  ─► stop process, restart children ─► Unbooted
//!               ├─ inbox    ─► process.boot(req)
//!               └─ failure  ─► stop process ─► Crashed
//!   Crashed  ─► select:
//!               ├─ restart  ─► restart children ─► Unbooted
//!               └─ inbox    ─► req.fail(ParentCrashed(error))
//!   token cancelled (any state) ─► stop process ─► Stopped
//! }
//! ```
//!
//! ## Rules
//! - At most one live process per node; it is stopped before the node leaves
//!   Booting or Ready.
//! - Restart requests coalesce into one pending permit.
//! - Inbox requests are served in arrival order.
//! - Only the node's own task writes its status and feature set.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Notify, mpsc};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use super::command::Command;
use super::process::{NodeProcess, Spawn};
use super::state::{NodeState, NodeStatus};
use crate::error::BootError;
use crate::events::{Bus, Event, EventKind};
use crate::process::{BootRequest, CommandProcess};

/// Pause before re-sending a boot request that hit a stopping or full parent.
const BOOT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Shared collaborators handed to every node's run loop.
#[derive(Clone)]
pub struct NodeContext {
    /// How nodes obtain processes.
    pub spawner: Arc<dyn Spawn>,
    /// Event bus.
    pub bus: Bus,
    /// Receives every dependency path a process reports, for file watching.
    pub features: Option<mpsc::UnboundedSender<String>>,
}

/// Non-owning reference from a node to its parent: the parent's name and inbox.
#[derive(Clone, Debug)]
pub struct ParentLink {
    name: Arc<str>,
    inbox: mpsc::Sender<BootRequest>,
}

/// A node's request queue, created before the node so children can link to it.
pub struct Inbox {
    tx: mpsc::Sender<BootRequest>,
    rx: mpsc::Receiver<BootRequest>,
}

impl Inbox {
    /// Creates an inbox holding up to `capacity` pending requests.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { tx, rx }
    }

    /// Link through which children of node `name` reach it.
    pub fn link(&self, name: Arc<str>) -> ParentLink {
        ParentLink {
            name,
            inbox: self.tx.clone(),
        }
    }
}

enum Step {
    Unbooted,
    Booting(Arc<dyn NodeProcess>),
    Ready(Arc<dyn NodeProcess>),
    Crashed(Arc<str>),
    Stopped,
}

/// One preloadable unit of application state.
pub struct Node {
    name: Arc<str>,
    argv: Vec<String>,
    parent: Option<ParentLink>,
    children: Vec<Arc<Node>>,
    commands: Vec<Arc<Command>>,
    inbox_tx: mpsc::Sender<BootRequest>,
    inbox_rx: Mutex<Option<mpsc::Receiver<BootRequest>>>,
    restart: Notify,
    restart_pending: AtomicBool,
    status: RwLock<NodeStatus>,
    features: Mutex<HashSet<String>>,
    /// Bumped on every return to Unbooted; feature drains of older processes stop recording.
    generation: AtomicU64,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("parent", &self.parent_name())
            .field("children", &self.children.len())
            .field("status", &self.status())
            .finish()
    }
}

impl Node {
    /// Creates a node. The root passes its command line in `argv` and no parent.
    pub fn new(
        name: Arc<str>,
        argv: Vec<String>,
        parent: Option<ParentLink>,
        children: Vec<Arc<Node>>,
        commands: Vec<Arc<Command>>,
        inbox: Inbox,
    ) -> Self {
        Self {
            name,
            argv,
            parent,
            children,
            commands,
            inbox_tx: inbox.tx,
            inbox_rx: Mutex::new(Some(inbox.rx)),
            restart: Notify::new(),
            restart_pending: AtomicBool::new(false),
            status: RwLock::new(NodeStatus::default()),
            features: Mutex::new(HashSet::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Node name.
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Parent node name, `None` for the root.
    pub fn parent_name(&self) -> Option<&Arc<str>> {
        self.parent.as_ref().map(|p| &p.name)
    }

    /// Direct children.
    pub fn children(&self) -> &[Arc<Node>] {
        &self.children
    }

    /// Commands owned by this node.
    pub fn commands(&self) -> &[Arc<Command>] {
        &self.commands
    }

    /// Current status.
    pub fn status(&self) -> NodeStatus {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Current state.
    pub fn state(&self) -> NodeState {
        self.status().state
    }

    /// Returns `true` if the current process reported loading `path`.
    pub fn has_feature(&self, path: &str) -> bool {
        self.lock_features().contains(path)
    }

    /// Dependency paths reported by the current process.
    pub fn features(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock_features().iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Asks the node to restart.
    ///
    /// Requests made before the node re-enters Unbooted coalesce into one;
    /// returns `false` for a coalesced request.
    pub fn request_restart(&self) -> bool {
        if self.restart_pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.restart.notify_one();
        true
    }

    /// Queues a boot request on this node without waiting for room.
    ///
    /// Fails the request with [`BootError::InboxFull`] when the inbox is full and
    /// with [`BootError::NodeStopped`] once the node has shut down.
    pub fn boot(&self, req: BootRequest) {
        enqueue(&self.inbox_tx, &self.name, req);
    }

    /// Boots a process for `command`, retrying while the node's process is stopping.
    pub async fn boot_command(&self, command: &str) -> Result<CommandProcess, BootError> {
        loop {
            let (req, pending) = BootRequest::command(command);
            self.boot(req);
            match pending.wait().await {
                Ok(transport) => return Ok(CommandProcess::new(transport)),
                Err(BootError::Stopping) => time::sleep(BOOT_RETRY_DELAY).await,
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs the state machine until `token` is cancelled.
    pub async fn run(self: Arc<Self>, ctx: NodeContext, token: CancellationToken) {
        let inbox = self
            .inbox_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut inbox) = inbox else {
            tracing::warn!(node = %self.name, "node is already running");
            return;
        };

        let mut step = Step::Unbooted;
        loop {
            step = match step {
                Step::Unbooted => self.unbooted(&ctx, &token).await,
                Step::Booting(proc) => self.booting(proc, &ctx, &token).await,
                Step::Ready(proc) => self.ready(proc, &mut inbox, &ctx, &token).await,
                Step::Crashed(err) => self.crashed(err, &mut inbox, &ctx, &token).await,
                Step::Stopped => break,
            };
        }

        inbox.close();
        while let Ok(req) = inbox.try_recv() {
            req.fail(BootError::NodeStopped(self.name.clone()));
        }
        self.set_status(NodeState::Stopped, None, None);
        ctx.bus
            .publish(Event::new(EventKind::NodeStopped).with_node(self.name.clone()));
        tracing::debug!(node = %self.name, "node stopped");
    }

    async fn unbooted(&self, ctx: &NodeContext, token: &CancellationToken) -> Step {
        self.restart_pending.store(false, Ordering::SeqCst);
        {
            let mut features = self.lock_features();
            features.clear();
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.set_status(NodeState::Unbooted, None, None);
        ctx.bus
            .publish(Event::new(EventKind::NodeUnbooted).with_node(self.name.clone()));

        let spawned = select! {
            _ = token.cancelled() => return Step::Stopped,
            res = self.spawn_process(ctx) => res,
        };
        match spawned {
            Ok(proc) => Step::Booting(proc),
            Err(err) => Step::Crashed(err),
        }
    }

    async fn spawn_process(&self, ctx: &NodeContext) -> Result<Arc<dyn NodeProcess>, Arc<str>> {
        let Some(parent) = &self.parent else {
            return ctx
                .spawner
                .spawn_root(&self.name, &self.argv)
                .await
                .map_err(|e| Arc::from(e.to_string()));
        };

        loop {
            let (req, pending) = BootRequest::node(self.name.clone());
            enqueue(&parent.inbox, &parent.name, req);
            match pending.wait().await {
                Ok(transport) => {
                    return ctx
                        .spawner
                        .attach(&self.name, transport)
                        .await
                        .map_err(|e| Arc::from(e.to_string()));
                }
                Err(err) if err.is_retryable() => {
                    tracing::debug!(node = %self.name, error = %err, "retrying boot request");
                    time::sleep(BOOT_RETRY_DELAY).await;
                }
                Err(err) => return Err(Arc::from(err.to_string())),
            }
        }
    }

    async fn booting(
        self: &Arc<Self>,
        proc: Arc<dyn NodeProcess>,
        ctx: &NodeContext,
        token: &CancellationToken,
    ) -> Step {
        let pid = proc.pid();
        self.set_status(NodeState::Booting, Some(pid), None);
        ctx.bus.publish(
            Event::new(EventKind::NodeBooting)
                .with_node(self.name.clone())
                .with_pid(pid),
        );

        if let Some(mut files) = proc.take_files() {
            let node = Arc::clone(self);
            let sink = ctx.features.clone();
            let generation = self.generation.load(Ordering::SeqCst);
            tokio::spawn(async move {
                while let Some(path) = files.next().await {
                    if !node.record_feature(generation, &path) {
                        break;
                    }
                    if let Some(sink) = &sink {
                        let _ = sink.send(path);
                    }
                }
                tracing::trace!(node = %node.name, pid, "feature stream closed");
            });
        }

        select! {
            _ = token.cancelled() => {
                self.stop_process(&proc).await;
                Step::Stopped
            }
            err = proc.failed() => {
                self.stop_process(&proc).await;
                Step::Crashed(Arc::from(err.to_string()))
            }
            res = proc.ready() => match res {
                Ok(()) => Step::Ready(proc),
                Err(err) => {
                    self.stop_process(&proc).await;
                    Step::Crashed(Arc::from(err.to_string()))
                }
            },
        }
    }

    async fn ready(
        &self,
        proc: Arc<dyn NodeProcess>,
        inbox: &mut mpsc::Receiver<BootRequest>,
        ctx: &NodeContext,
        token: &CancellationToken,
    ) -> Step {
        let pid = proc.pid();
        self.set_status(NodeState::Ready, Some(pid), None);
        ctx.bus.publish(
            Event::new(EventKind::NodeReady)
                .with_node(self.name.clone())
                .with_pid(pid),
        );
        tracing::info!(node = %self.name, pid, "node ready");

        loop {
            select! {
                biased;
                _ = token.cancelled() => {
                    self.stop_process(&proc).await;
                    return Step::Stopped;
                }
                err = proc.failed() => {
                    self.stop_process(&proc).await;
                    return Step::Crashed(Arc::from(err.to_string()));
                }
                _ = self.restart.notified() => {
                    tracing::info!(node = %self.name, pid, "restarting node");
                    self.stop_process(&proc).await;
                    self.restart_children(ctx);
                    return Step::Unbooted;
                }
                req = inbox.recv() => match req {
                    Some(req) => {
                        tracing::debug!(node = %self.name, pid, request = ?req.kind(), "forwarding boot request");
                        proc.boot(req);
                    }
                    None => {
                        self.stop_process(&proc).await;
                        return Step::Stopped;
                    }
                },
            }
        }
    }

    async fn crashed(
        &self,
        err: Arc<str>,
        inbox: &mut mpsc::Receiver<BootRequest>,
        ctx: &NodeContext,
        token: &CancellationToken,
    ) -> Step {
        self.set_status(NodeState::Crashed, None, Some(err.clone()));
        ctx.bus.publish(
            Event::new(EventKind::NodeCrashed)
                .with_node(self.name.clone())
                .with_reason(err.clone()),
        );
        tracing::error!(node = %self.name, error = %err, "node crashed");

        loop {
            select! {
                biased;
                _ = token.cancelled() => return Step::Stopped,
                _ = self.restart.notified() => {
                    self.restart_children(ctx);
                    return Step::Unbooted;
                }
                req = inbox.recv() => match req {
                    Some(req) => req.fail(BootError::ParentCrashed(err.clone())),
                    None => return Step::Stopped,
                },
            }
        }
    }

    fn restart_children(&self, ctx: &NodeContext) {
        for child in &self.children {
            ctx.bus.publish(
                Event::new(EventKind::RestartRequested)
                    .with_node(child.name.clone())
                    .with_reason(format!("parent {} restarted", self.name)),
            );
            child.request_restart();
        }
    }

    async fn stop_process(&self, proc: &Arc<dyn NodeProcess>) {
        if let Err(err) = proc.stop().await {
            tracing::warn!(node = %self.name, pid = proc.pid(), error = %err, "error stopping process");
        }
    }

    fn set_status(&self, state: NodeState, pid: Option<i32>, error: Option<Arc<str>>) {
        let mut status = self
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *status = NodeStatus { state, pid, error };
    }

    /// Records `path` unless the process that loaded it has been replaced.
    fn record_feature(&self, generation: u64, path: &str) -> bool {
        let mut features = self.lock_features();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        features.insert(path.to_string());
        true
    }

    fn lock_features(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.features
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn enqueue(inbox: &mpsc::Sender<BootRequest>, node: &Arc<str>, req: BootRequest) {
    match inbox.try_send(req) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(req)) => req.fail(BootError::InboxFull(node.clone())),
        Err(mpsc::error::TrySendError::Closed(req)) => req.fail(BootError::NodeStopped(node.clone())),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory processes for exercising node and tree logic.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicI32;

    use async_trait::async_trait;
    use futures::stream;
    use tokio::sync::watch;

    use super::*;
    use crate::error::ProcessError;
    use crate::process::{FileStream, ProcessPhase};
    use crate::transport::Transport;

    /// How a scripted process behaves once spawned.
    #[derive(Clone, Debug)]
    pub enum Script {
        /// Registers, reports `files`, becomes ready.
        Ready(Vec<String>),
        /// Registers, then reports this action failure.
        FailInit(String),
        /// Never registers; the spawn itself fails with this output.
        NoRegister(String),
        /// Registers but never answers its action.
        Unresponsive,
        /// Becomes ready; dependency paths are fed through [`FakeProcess::report`].
        Streaming,
    }

    pub struct FakeProcess {
        pub pid: i32,
        phase: watch::Sender<ProcessPhase>,
        files: Mutex<Option<FileStream>>,
        feed: Mutex<Option<mpsc::UnboundedSender<String>>>,
        peers: Mutex<Vec<(Arc<str>, Transport)>>,
        pub stopped: AtomicBool,
    }

    impl FakeProcess {
        fn new(pid: i32, script: &Script) -> Self {
            let (phase, files) = match script {
                Script::Ready(files) => (ProcessPhase::Ready, files.clone()),
                Script::FailInit(text) => (
                    ProcessPhase::Failed(Arc::new(ProcessError::ActionFailed(text.clone()))),
                    Vec::new(),
                ),
                Script::NoRegister(_) | Script::Unresponsive => (ProcessPhase::Starting, Vec::new()),
                Script::Streaming => (ProcessPhase::Ready, Vec::new()),
            };
            let (files, feed) = if matches!(script, Script::Streaming) {
                let (tx, rx) = mpsc::unbounded_channel();
                (
                    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|p| (p, rx)) }).boxed(),
                    Some(tx),
                )
            } else {
                (stream::iter(files).boxed(), None)
            };
            Self {
                pid,
                phase: watch::channel(phase).0,
                files: Mutex::new(Some(files)),
                feed: Mutex::new(feed),
                peers: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }
        }

        /// Simulates the process dying after it became ready.
        pub fn crash(&self, text: &str) {
            self.phase.send_replace(ProcessPhase::Failed(Arc::new(
                ProcessError::ActionFailed(text.to_string()),
            )));
        }

        /// Reports a dependency path from a [`Script::Streaming`] process.
        pub fn report(&self, path: &str) {
            if let Some(feed) = self.feed.lock().unwrap().as_ref() {
                let _ = feed.send(path.to_string());
            }
        }

        /// Takes the far end of the transport handed out for a boot of `name`.
        pub fn take_peer(&self, name: &str) -> Option<Transport> {
            let mut peers = self.peers.lock().unwrap();
            let idx = peers.iter().position(|(n, _)| n.as_ref() == name)?;
            Some(peers.remove(idx).1)
        }
    }

    #[async_trait]
    impl NodeProcess for FakeProcess {
        fn pid(&self) -> i32 {
            self.pid
        }

        fn boot(&self, req: BootRequest) {
            if self.stopped.load(Ordering::SeqCst) {
                req.fail(BootError::Stopping);
                return;
            }
            match Transport::pair() {
                Ok((ours, theirs)) => {
                    self.peers
                        .lock()
                        .unwrap()
                        .push((req.kind().name().clone(), theirs));
                    req.respond(ours);
                }
                Err(e) => req.fail(BootError::Relay(Arc::from(e.to_string()))),
            }
        }

        async fn ready(&self) -> Result<(), Arc<ProcessError>> {
            let mut rx = self.phase.subscribe();
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

        async fn failed(&self) -> Arc<ProcessError> {
            let mut rx = self.phase.subscribe();
            let phase = rx
                .wait_for(|p| matches!(p, ProcessPhase::Failed(_)))
                .await
                .map(|p| p.clone());
            match phase {
                Ok(ProcessPhase::Failed(err)) => err,
                _ => std::future::pending().await,
            }
        }

        fn take_files(&self) -> Option<FileStream> {
            self.files.lock().unwrap().take()
        }

        async fn stop(&self) -> Result<(), ProcessError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Spawner following per-node scripts; unscripted spawns become ready.
    #[derive(Default)]
    pub struct FakeSpawner {
        scripts: Mutex<HashMap<String, VecDeque<Script>>>,
        spawned: Mutex<Vec<(String, Arc<FakeProcess>)>>,
        next_pid: AtomicI32,
    }

    impl FakeSpawner {
        /// Queues `script` for the next spawn of `node`.
        pub fn script(&self, node: &str, script: Script) {
            self.scripts
                .lock()
                .unwrap()
                .entry(node.to_string())
                .or_default()
                .push_back(script);
        }

        /// Processes spawned for `node`, oldest first.
        pub fn spawned(&self, node: &str) -> Vec<Arc<FakeProcess>> {
            self.spawned
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == node)
                .map(|(_, p)| p.clone())
                .collect()
        }

        fn make(&self, name: &str) -> Result<Arc<dyn NodeProcess>, ProcessError> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(name)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Script::Ready(Vec::new()));
            if let Script::NoRegister(output) = &script {
                return Err(ProcessError::Exited {
                    status: "exit status: 1".into(),
                    output: output.clone(),
                });
            }
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            let proc = Arc::new(FakeProcess::new(pid, &script));
            self.spawned
                .lock()
                .unwrap()
                .push((name.to_string(), proc.clone()));
            Ok(proc)
        }
    }

    #[async_trait]
    impl Spawn for FakeSpawner {
        async fn spawn_root(&self, name: &str, _argv: &[String]) -> Result<Arc<dyn NodeProcess>, ProcessError> {
            self.make(name)
        }

        async fn attach(&self, name: &str, _transport: Transport) -> Result<Arc<dyn NodeProcess>, ProcessError> {
            self.make(name)
        }
    }

    /// Builds nodes from `(name, parent)` pairs listed parents first.
    pub fn build(topology: &[(&str, Option<&str>)]) -> HashMap<String, Arc<Node>> {
        let mut inboxes: HashMap<&str, Inbox> =
            topology.iter().map(|(n, _)| (*n, Inbox::new(16))).collect();
        let mut built: HashMap<String, Arc<Node>> = HashMap::new();
        for (name, parent) in topology.iter().rev() {
            let children = topology
                .iter()
                .filter(|(_, p)| p == &Some(*name))
                .map(|(child, _)| built[*child].clone())
                .collect();
            let link = parent.map(|p| inboxes[p].link(Arc::from(p)));
            let inbox = inboxes.remove(name).unwrap();
            let argv = if parent.is_none() { vec!["ruby".to_string()] } else { Vec::new() };
            let node = Node::new(Arc::from(*name), argv, link, children, Vec::new(), inbox);
            built.insert(name.to_string(), Arc::new(node));
        }
        built
    }

    /// Polls until `node` reaches `state`.
    pub async fn wait_state(node: &Node, state: NodeState) {
        let reached = time::timeout(Duration::from_secs(5), async {
            while node.state() != state {
                time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "{} never reached {state}: {:?}", node.name(), node.status());
    }
}
