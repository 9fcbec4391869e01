//! # Seams between a node and its OS process.
//!
//! [`NodeProcess`] is a live process as seen by its node; [`Spawn`] is how a
//! node obtains one. [`OsSpawner`] implements both ends with real processes
//! through [`ProcessHandle`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::ProcessError;
use crate::process::{BootRequest, FileStream, ProcessHandle};
use crate::transport::Transport;

/// A live process owned by a node.
#[async_trait]
pub trait NodeProcess: Send + Sync + 'static {
    /// Process id.
    fn pid(&self) -> i32;

    /// Queues a boot request without blocking.
    fn boot(&self, req: BootRequest);

    /// Waits until the process is ready, or returns its initialization failure.
    async fn ready(&self) -> Result<(), Arc<ProcessError>>;

    /// Waits until the process fails.
    async fn failed(&self) -> Arc<ProcessError>;

    /// Takes the dependency-path stream (first call only).
    fn take_files(&self) -> Option<FileStream>;

    /// Stops the process and fails its queued requests. Idempotent.
    async fn stop(&self) -> Result<(), ProcessError>;
}

/// How a node obtains its process.
#[async_trait]
pub trait Spawn: Send + Sync + 'static {
    /// Starts the root node's process from its command line.
    async fn spawn_root(&self, name: &str, argv: &[String]) -> Result<Arc<dyn NodeProcess>, ProcessError>;

    /// Takes over a process a parent forked for node `name`.
    async fn attach(&self, name: &str, transport: Transport) -> Result<Arc<dyn NodeProcess>, ProcessError>;
}

#[async_trait]
impl NodeProcess for ProcessHandle {
    fn pid(&self) -> i32 {
        ProcessHandle::pid(self)
    }

    fn boot(&self, req: BootRequest) {
        ProcessHandle::boot(self, req)
    }

    async fn ready(&self) -> Result<(), Arc<ProcessError>> {
        ProcessHandle::ready(self).await
    }

    async fn failed(&self) -> Arc<ProcessError> {
        ProcessHandle::failed(self).await
    }

    fn take_files(&self) -> Option<FileStream> {
        ProcessHandle::take_files(self)
    }

    async fn stop(&self) -> Result<(), ProcessError> {
        ProcessHandle::stop(self).await
    }
}

/// Spawns real OS processes.
#[derive(Debug, Clone)]
pub struct OsSpawner {
    cfg: Config,
}

impl OsSpawner {
    /// Creates a spawner using the given configuration for every process.
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Spawn for OsSpawner {
    async fn spawn_root(&self, name: &str, argv: &[String]) -> Result<Arc<dyn NodeProcess>, ProcessError> {
        let handle = ProcessHandle::spawn(argv, name, &self.cfg).await?;
        Ok(Arc::new(handle))
    }

    async fn attach(&self, name: &str, transport: Transport) -> Result<Arc<dyn NodeProcess>, ProcessError> {
        let handle = ProcessHandle::attach(transport, name, &self.cfg).await?;
        Ok(Arc::new(handle))
    }
}
