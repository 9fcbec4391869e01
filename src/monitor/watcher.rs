//! # OS file watching feeding the debouncer.
//!
//! [`FileMonitor`] owns a `notify` watcher. Paths are watched one by one as
//! node processes report loading them; write, remove and rename events are
//! pushed into a [`Debouncer`] and reach listeners as batches.
//!
//! A removed or renamed path is forgotten so that the next `add` watches the
//! replacement file (editors often save by renaming over the original).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::event::{EventKind as FsEventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::debounce::{Batch, Debouncer};
use crate::config::Config;

type Watched = Arc<Mutex<HashSet<PathBuf>>>;

/// Watches reported dependency paths and emits debounced change batches.
pub struct FileMonitor {
    watcher: Mutex<RecommendedWatcher>,
    watched: Watched,
    debouncer: Debouncer,
}

impl FileMonitor {
    /// Creates the watcher and its debouncing pump.
    pub fn new(cfg: &Config, token: CancellationToken) -> Result<Self, notify::Error> {
        let debouncer = Debouncer::spawn(cfg.debounce, cfg.subscriber_batch_capacity_clamped(), token);
        let watched: Watched = Arc::new(Mutex::new(HashSet::new()));

        let sink = debouncer.clone();
        let forget = watched.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let replaced = match event.kind {
                    FsEventKind::Modify(ModifyKind::Name(_)) | FsEventKind::Remove(_) => true,
                    FsEventKind::Modify(ModifyKind::Metadata(_)) => return,
                    FsEventKind::Modify(_) => false,
                    _ => return,
                };
                for path in event.paths {
                    if replaced {
                        forget
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .remove(&path);
                    }
                    sink.push(path.to_string_lossy().into_owned());
                }
            }
            Err(err) => tracing::warn!(error = %err, "file watcher error"),
        })?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            watched,
            debouncer,
        })
    }

    /// Starts watching `path`. Watching an already watched path is a no-op.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<(), notify::Error> {
        let path = path.as_ref().to_path_buf();
        if !self.lock_watched().insert(path.clone()) {
            return Ok(());
        }
        let res = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .watch(&path, RecursiveMode::NonRecursive);
        if let Err(err) = res {
            self.lock_watched().remove(&path);
            return Err(err);
        }
        tracing::trace!(path = %path.display(), "watching file");
        Ok(())
    }

    /// Reports a change to `path` without going through the OS.
    pub fn push(&self, path: impl Into<String>) {
        self.debouncer.push(path);
    }

    /// Registers a listener for change batches.
    pub fn listen(&self) -> mpsc::Receiver<Batch> {
        self.debouncer.listen()
    }

    /// Number of paths currently watched.
    pub fn watched(&self) -> usize {
        self.lock_watched().len()
    }

    fn lock_watched(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
