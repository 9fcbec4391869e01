use std::sync::Arc;

use super::supervisor::Supervisor;
use crate::config::Config;
use crate::error::ConfigError;
use crate::events::Bus;
use crate::node::{OsSpawner, Spawn};
use crate::subscribers::{LogWriter, StatusTracker, Subscribe, SubscriberSet};
use crate::tree::TreeBuilder;

/// Builder for constructing a [`Supervisor`].
///
/// ```rust,no_run
/// use forkvisor::{Config, SupervisorBuilder, TreeBuilder};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let tree = TreeBuilder::new("boot", ["ruby", "boot.rb"])
///     .with_node("test", "boot")
///     .with_command("rspec", "test", ["r"]);
/// let sup = SupervisorBuilder::new(Config::from_env())
///     .with_event_log()
///     .build(tree)?;
/// sup.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct SupervisorBuilder {
    cfg: Config,
    subscribers: Vec<Arc<dyn Subscribe>>,
    spawner: Option<Arc<dyn Spawn>>,
}

impl SupervisorBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
            spawner: None,
        }
    }

    /// Sets event subscribers.
    ///
    /// Each subscriber gets a dedicated worker with a bounded queue; a
    /// [`StatusTracker`] is always added.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Adds a [`LogWriter`] so every event is also logged through `tracing`.
    pub fn with_event_log(mut self) -> Self {
        self.subscribers.push(Arc::new(LogWriter::new()));
        self
    }

    /// Replaces the OS process spawner.
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawn>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Validates the tree and initializes the runtime components.
    ///
    /// Must be called within a tokio runtime: subscriber workers start here.
    pub fn build(self, tree: TreeBuilder) -> Result<Supervisor, ConfigError> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let tree = Arc::new(tree.build(&self.cfg, bus.clone())?);

        let status = Arc::new(StatusTracker::new());
        let mut subscribers = self.subscribers;
        subscribers.push(status.clone());
        let subs = SubscriberSet::new(subscribers, bus.clone());

        let spawner = self
            .spawner
            .unwrap_or_else(|| Arc::new(OsSpawner::new(self.cfg.clone())));

        Ok(Supervisor::new_internal(self.cfg, bus, subs, status, tree, spawner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_tree_is_rejected_before_start() {
        let tree = TreeBuilder::new("boot", ["ruby"]).with_node("code", "nowhere");
        let err = SupervisorBuilder::new(Config::default()).build(tree).err().unwrap();
        assert_eq!(err.as_label(), "config_unknown_parent");
    }

    #[test]
    fn event_log_is_added_after_custom_subscribers() {
        let builder = SupervisorBuilder::new(Config::default())
            .with_subscribers(vec![Arc::new(StatusTracker::new()) as Arc<dyn Subscribe>])
            .with_event_log();
        let names: Vec<&str> = builder.subscribers.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[1], "log");
    }

    #[tokio::test]
    async fn status_tracker_is_always_attached() {
        let sup = SupervisorBuilder::new(Config::default())
            .build(TreeBuilder::new("boot", ["ruby"]))
            .unwrap();
        assert_eq!(sup.snapshot().root, "boot");
        assert!(sup.status().snapshot().await.is_empty());
    }
}
