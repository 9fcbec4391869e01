//! # Global runtime configuration.
//!
//! Provides [`Config`], centralized settings for the supervisor runtime.
//!
//! Config is used in two ways:
//! 1. **Supervisor creation**: `SupervisorBuilder::new(config)`
//! 2. **Component defaults**: nodes, process handles and the file monitor read
//!    their capacities and timeouts from the same instance.
//!
//! ## Environment overrides
//! [`Config::from_env`] starts from [`Config::default`] and applies:
//! - `FORKVISOR_SOCK` → `socket_path`
//! - `FORKVISOR_DEBOUNCE_MS` → `debounce`
//! - `FORKVISOR_KILL_TIMEOUT_MS` → `force_kill_timeout`
//! - `FORKVISOR_QUEUE_CAPACITY` → `boot_queue_capacity`
//!
//! ## Sentinel values
//! Capacities of `0` are clamped to `1` by the `*_clamped` accessors.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the rendezvous socket path.
pub const SOCKET_ENV: &str = "FORKVISOR_SOCK";

/// Environment variable through which a spawned process learns its control descriptor.
pub const MASTER_FD_ENV: &str = "FORKVISOR_MASTER_FD";

/// Environment variable naming the node a spawned root process registers as.
pub const IDENTIFIER_ENV: &str = "FORKVISOR_IDENTIFIER";

/// Default rendezvous socket path, relative to the working directory.
pub const DEFAULT_SOCKET_PATH: &str = ".forkvisor.sock";

/// Global configuration for the supervisor runtime.
///
/// ## Field semantics
/// - `socket_path`: rendezvous socket for client connections
/// - `debounce`: window coalescing file-change bursts into one batch
/// - `force_kill_timeout`: how long `Stop` waits after SIGTERM before SIGKILL
/// - `kill_poll_interval`: liveness probe period while waiting
/// - `boot_queue_capacity`: pending boot requests per live process
/// - `node_inbox_capacity`: pending boot requests per node
/// - `subscriber_batch_capacity`: queued change batches per file-monitor listener
/// - `bus_capacity`: event bus ring buffer size
/// - `grace`: maximum wait for the tree to stop on shutdown
/// - `output_tail_bytes`: captured root-process output kept for crash reports
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the local domain socket clients connect to.
    pub socket_path: PathBuf,

    /// Debounce window for file-change notifications.
    pub debounce: Duration,

    /// Time between SIGTERM and SIGKILL when stopping a process.
    pub force_kill_timeout: Duration,

    /// Interval between `kill(pid, 0)` probes while waiting for a process to exit.
    pub kill_poll_interval: Duration,

    /// Capacity of each process handle's boot queue.
    ///
    /// Requests beyond this fail immediately with `BootError::QueueFull`.
    pub boot_queue_capacity: usize,

    /// Capacity of each node's request inbox.
    pub node_inbox_capacity: usize,

    /// Capacity of each file-monitor listener's batch queue.
    pub subscriber_batch_capacity: usize,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,

    /// Maximum time to wait for graceful shutdown.
    pub grace: Duration,

    /// Bytes of root-process stdout/stderr retained for crash reports.
    pub output_tail_bytes: usize,
}

impl Config {
    /// Builds a configuration from defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    ///
    /// Unparsable numeric values are ignored with a warning.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup(SOCKET_ENV).filter(|p| !p.is_empty()) {
            self.socket_path = PathBuf::from(path);
        }
        if let Some(ms) = parse_millis(&lookup, "FORKVISOR_DEBOUNCE_MS") {
            self.debounce = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "FORKVISOR_KILL_TIMEOUT_MS") {
            self.force_kill_timeout = ms;
        }
        if let Some(raw) = lookup("FORKVISOR_QUEUE_CAPACITY") {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.boot_queue_capacity = n,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid FORKVISOR_QUEUE_CAPACITY"),
            }
        }
        self
    }

    /// Boot queue capacity clamped to a minimum of 1.
    #[inline]
    pub fn boot_queue_capacity_clamped(&self) -> usize {
        self.boot_queue_capacity.max(1)
    }

    /// Node inbox capacity clamped to a minimum of 1.
    #[inline]
    pub fn node_inbox_capacity_clamped(&self) -> usize {
        self.node_inbox_capacity.max(1)
    }

    /// Listener batch capacity clamped to a minimum of 1.
    #[inline]
    pub fn subscriber_batch_capacity_clamped(&self) -> usize {
        self.subscriber_batch_capacity.max(1)
    }

    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid duration override");
            None
        }
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `socket_path = .forkvisor.sock`
    /// - `debounce = 300ms`
    /// - `force_kill_timeout = 1s`, `kill_poll_interval = 1ms`
    /// - `boot_queue_capacity = 128`, `node_inbox_capacity = 64`
    /// - `subscriber_batch_capacity = 16`, `bus_capacity = 1024`
    /// - `grace = 10s`, `output_tail_bytes = 32 KiB`
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            debounce: Duration::from_millis(300),
            force_kill_timeout: Duration::from_secs(1),
            kill_poll_interval: Duration::from_millis(1),
            boot_queue_capacity: 128,
            node_inbox_capacity: 64,
            subscriber_batch_capacity: 16,
            bus_capacity: 1024,
            grace: Duration::from_secs(10),
            output_tail_bytes: 32 << 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn overrides_apply() {
        let cfg = Config::default().with_overrides(lookup(&[
            (SOCKET_ENV, "/tmp/other.sock"),
            ("FORKVISOR_DEBOUNCE_MS", "50"),
            ("FORKVISOR_QUEUE_CAPACITY", "3"),
        ]));
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(cfg.debounce, Duration::from_millis(50));
        assert_eq!(cfg.boot_queue_capacity, 3);
        assert_eq!(cfg.force_kill_timeout, Duration::from_secs(1));
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let cfg = Config::default().with_overrides(lookup(&[
            ("FORKVISOR_DEBOUNCE_MS", "soon"),
            ("FORKVISOR_QUEUE_CAPACITY", "-1"),
            (SOCKET_ENV, ""),
        ]));
        assert_eq!(cfg.debounce, Duration::from_millis(300));
        assert_eq!(cfg.boot_queue_capacity, 128);
        assert_eq!(cfg.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn capacities_clamp_to_one() {
        let cfg = Config {
            boot_queue_capacity: 0,
            node_inbox_capacity: 0,
            bus_capacity: 0,
            ..Config::default()
        };
        assert_eq!(cfg.boot_queue_capacity_clamped(), 1);
        assert_eq!(cfg.node_inbox_capacity_clamped(), 1);
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }
}
