//! # Supervisor: wires the tree, file monitor, clients and subscribers.
//!
//! ## Architecture
//! ```text
//! run_until(shutdown):
//!   ClientListener::bind(socket)          (AlreadyRunning is fatal)
//!   Bus ──► forwarder ──► SubscriberSet ──► StatusTracker, user subscribers
//!   FileMonitor
//!     ▲ add(path)  ◄── features channel ◄── nodes (reported dependency paths)
//!     └ listen()   ──► batches ──► ProcessTree::restart_nodes_with_features
//!   ProcessTree::run(NodeContext)         (one task per node)
//!   ClientListener::serve(ClientHandler)  (one task per connection)
//!
//! shutdown:
//!   publish(ShutdownRequested), cancel runtime token
//!   client sessions in flight answer "0", error text, "1"
//!   ProcessTree::stop(grace):
//!     ├─ Ok  ──► publish(AllStoppedWithin)
//!     └─ Err ──► publish(GraceExceeded), RuntimeError::GraceExceeded{stuck}
//!   drain subscribers, remove socket file
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::shutdown::ShutdownSignals;
use crate::client::{ClientHandler, ClientListener};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::monitor::FileMonitor;
use crate::node::{NodeContext, Spawn};
use crate::subscribers::{StatusTracker, SubscriberSet};
use crate::tree::{ProcessTree, TreeSnapshot};

/// Owns the runtime: event delivery, the process tree and the client socket.
pub struct Supervisor {
    cfg: Config,
    bus: Bus,
    subs: Mutex<Option<SubscriberSet>>,
    status: Arc<StatusTracker>,
    tree: Arc<ProcessTree>,
    spawner: Arc<dyn Spawn>,
}

impl Supervisor {
    pub(super) fn new_internal(
        cfg: Config,
        bus: Bus,
        subs: SubscriberSet,
        status: Arc<StatusTracker>,
        tree: Arc<ProcessTree>,
        spawner: Arc<dyn Spawn>,
    ) -> Self {
        Self {
            cfg,
            bus,
            subs: Mutex::new(Some(subs)),
            status,
            tree,
            spawner,
        }
    }

    /// Event bus.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Process tree.
    pub fn tree(&self) -> &Arc<ProcessTree> {
        &self.tree
    }

    /// Node states as seen through events.
    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    /// Current tree view.
    pub fn snapshot(&self) -> TreeSnapshot {
        self.tree.snapshot()
    }

    /// Runs until SIGINT, SIGTERM or SIGQUIT.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        let signals = ShutdownSignals::install().map_err(RuntimeError::Signals)?;
        self.run_until(signals.recv()).await
    }

    /// Runs until `shutdown` completes, then stops the tree within the grace period.
    ///
    /// Subscribers are attached to the first run only.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = ()>,
    {
        let listener = match ClientListener::bind(&self.cfg.socket_path) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, label = err.as_label(), "cannot start supervisor");
                return Err(err);
            }
        };

        let token = CancellationToken::new();
        let monitor = Arc::new(FileMonitor::new(&self.cfg, token.child_token())?);
        let forwarder = self.subscriber_listener();

        let (features_tx, features_rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_features(monitor.clone(), features_rx, token.child_token()));
        tokio::spawn(restart_on_changes(
            monitor.clone(),
            self.tree.clone(),
            token.child_token(),
        ));

        self.tree.run(NodeContext {
            spawner: self.spawner.clone(),
            bus: self.bus.clone(),
            features: Some(features_tx),
        });

        let handler = ClientHandler::new(self.tree.clone(), self.bus.clone());
        {
            let serve = listener.serve(handler, token.child_token());
            tokio::pin!(serve);
            tokio::select! {
                _ = shutdown => {}
                _ = &mut serve => {}
            }
            self.bus.publish(Event::new(EventKind::ShutdownRequested));
            tracing::info!("shutting down");
            token.cancel();
            serve.await;
        }
        drop(listener);

        let res = self.stop_tree().await;
        if let Some((forwarder, subs)) = forwarder {
            let _ = forwarder.await;
            if let Some(subs) = Arc::into_inner(subs) {
                if time::timeout(self.cfg.grace, subs.shutdown()).await.is_err() {
                    tracing::warn!("subscribers did not drain within grace");
                }
            }
        }
        res
    }

    async fn stop_tree(&self) -> Result<(), RuntimeError> {
        let grace = self.cfg.grace;
        match self.tree.stop(grace).await {
            Ok(()) => {
                self.bus.publish(Event::new(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(from_tree) => {
                let mut stuck = self.status.not_stopped().await;
                stuck.extend(from_tree);
                stuck.sort_unstable();
                stuck.dedup();
                self.bus
                    .publish(Event::new(EventKind::GraceExceeded).with_reason(stuck.join(", ")));
                tracing::warn!(?grace, ?stuck, "nodes did not stop within grace");
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }

    /// Forwards bus events to the subscriber set until the final shutdown event.
    fn subscriber_listener(&self) -> Option<(tokio::task::JoinHandle<()>, Arc<SubscriberSet>)> {
        let set = Arc::new(
            self.subs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()?,
        );
        let mut rx = self.bus.subscribe();
        let fwd = Arc::clone(&set);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        fwd.emit(&ev);
                        if matches!(ev.kind, EventKind::AllStoppedWithin | EventKind::GraceExceeded) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Some((handle, set))
    }
}

async fn watch_features(
    monitor: Arc<FileMonitor>,
    mut paths: mpsc::UnboundedReceiver<String>,
    token: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = token.cancelled() => return,
            path = paths.recv() => match path {
                Some(path) => path,
                None => return,
            },
        };
        if let Err(err) = monitor.add(&path) {
            tracing::debug!(path = %path, error = %err, "cannot watch dependency");
        }
    }
}

async fn restart_on_changes(monitor: Arc<FileMonitor>, tree: Arc<ProcessTree>, token: CancellationToken) {
    let mut batches = monitor.listen();
    loop {
        let batch = tokio::select! {
            _ = token.cancelled() => return,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => return,
            },
        };
        tracing::info!(paths = batch.len(), "dependencies changed");
        tree.restart_nodes_with_features(&batch).await;
    }
}
