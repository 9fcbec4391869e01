//! # Debounced fan-out of changed paths.
//!
//! ```text
//! push(path) ──► raw queue ──► pump ──► listener 1
//!                               │  └──► listener 2 ...
//!        idle: wait for first path
//!        then: collect until `window` elapses, emit the set, go idle
//! ```
//!
//! ## Rules
//! - One batch per window; a batch is the sorted, deduplicated set of paths.
//! - Every listener receives every batch. Sends are awaited in registration
//!   order, so a slow listener delays delivery without dropping anything.
//! - Listeners whose receiver was dropped are pruned on the next emit.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// One debounced set of changed paths.
pub type Batch = Vec<String>;

type Listeners = Arc<Mutex<Vec<mpsc::Sender<Batch>>>>;

/// Handle to a debouncing pump. Clones share the pump.
#[derive(Clone)]
pub struct Debouncer {
    raw: mpsc::UnboundedSender<String>,
    listeners: Listeners,
    capacity: usize,
}

impl Debouncer {
    /// Spawns the pump. It stops when `token` is cancelled or every handle is dropped.
    pub fn spawn(window: Duration, capacity: usize, token: CancellationToken) -> Self {
        let (raw, rx) = mpsc::unbounded_channel();
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(pump(window, rx, listeners.clone(), token));
        Self {
            raw,
            listeners,
            capacity: capacity.max(1),
        }
    }

    /// Reports one changed path.
    pub fn push(&self, path: impl Into<String>) {
        let _ = self.raw.send(path.into());
    }

    /// Registers a listener; it receives every batch emitted from now on.
    pub fn listen(&self) -> mpsc::Receiver<Batch> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }
}

async fn pump(
    window: Duration,
    rx: mpsc::UnboundedReceiver<String>,
    listeners: Listeners,
    token: CancellationToken,
) {
    collect(window, rx, &listeners, token).await;
    listeners
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
}

async fn collect(
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<String>,
    listeners: &Listeners,
    token: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = token.cancelled() => return,
            path = rx.recv() => match path {
                Some(path) => path,
                None => return,
            },
        };

        let mut pending = BTreeSet::from([first]);
        let deadline = Instant::now() + window;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = time::sleep_until(deadline) => break,
                path = rx.recv() => match path {
                    Some(path) => {
                        pending.insert(path);
                    }
                    None => break,
                },
            }
        }

        let batch: Batch = pending.into_iter().collect();
        tracing::debug!(paths = batch.len(), "emitting change batch");
        emit(listeners, batch).await;
    }
}

async fn emit(listeners: &Listeners, batch: Batch) {
    let targets: Vec<_> = listeners
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();

    let mut closed = false;
    for tx in &targets {
        if tx.send(batch.clone()).await.is_err() {
            closed = true;
        }
    }
    if closed {
        listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|tx| !tx.is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(300);

    #[tokio::test(start_paused = true)]
    async fn paths_within_window_form_one_batch() {
        let debouncer = Debouncer::spawn(WINDOW, 4, CancellationToken::new());
        let mut rx = debouncer.listen();

        debouncer.push("b");
        time::sleep(Duration::from_millis(100)).await;
        debouncer.push("a");
        debouncer.push("b");

        assert_eq!(rx.recv().await.unwrap(), vec!["a", "b"]);
        let nothing = time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_paths_form_two_batches() {
        let debouncer = Debouncer::spawn(WINDOW, 4, CancellationToken::new());
        let mut rx = debouncer.listen();

        debouncer.push("a");
        time::sleep(Duration::from_millis(500)).await;
        debouncer.push("b");

        assert_eq!(rx.recv().await.unwrap(), vec!["a"]);
        assert_eq!(rx.recv().await.unwrap(), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn every_listener_gets_every_batch() {
        let debouncer = Debouncer::spawn(WINDOW, 1, CancellationToken::new());
        let mut first = debouncer.listen();
        let dropped = debouncer.listen();
        let mut last = debouncer.listen();
        drop(dropped);

        debouncer.push("config/routes.rb");
        assert_eq!(first.recv().await.unwrap(), vec!["config/routes.rb"]);
        assert_eq!(last.recv().await.unwrap(), vec!["config/routes.rb"]);
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(debouncer.listeners.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_listener_delays_but_loses_nothing() {
        let debouncer = Debouncer::spawn(WINDOW, 1, CancellationToken::new());
        let mut slow = debouncer.listen();
        let mut fast = debouncer.listen();

        debouncer.push("a");
        time::sleep(Duration::from_millis(400)).await;
        debouncer.push("b");
        time::sleep(Duration::from_millis(400)).await;

        assert_eq!(fast.recv().await.unwrap(), vec!["a"]);
        assert_eq!(slow.recv().await.unwrap(), vec!["a"]);
        assert_eq!(slow.recv().await.unwrap(), vec!["b"]);
        assert_eq!(fast.recv().await.unwrap(), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_pump() {
        let token = CancellationToken::new();
        let debouncer = Debouncer::spawn(WINDOW, 1, token.clone());
        let mut rx = debouncer.listen();
        token.cancel();
        time::sleep(Duration::from_millis(10)).await;

        debouncer.push("a");
        assert!(rx.recv().await.is_none());
    }
}
