//! Log output for binaries.
//!
//! The filter is read from `FORKVISOR_LOG` (same syntax as `RUST_LOG`);
//! without it only `forkvisor` info and above is shown. Output goes to stderr.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "FORKVISOR_LOG";

/// Filter used when `FORKVISOR_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "forkvisor=info";

/// Installs the global `tracing` subscriber. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
