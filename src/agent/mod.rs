//! # Node-side protocol runner.
//!
//! Everything here runs inside the preloaded processes, synchronously and
//! without an async runtime, so that `fork` is safe at every step.
//!
//! ## Lifecycle
//! ```text
//! run(plan)
//!   ├─► master socket from FORKVISOR_MASTER_FD, name from FORKVISOR_IDENTIFIER
//!   └─► loop as node:
//!         socketpair; send one end upstream
//!         "P:<pid>:<parent_pid>:<name>"
//!         feature pipe read end
//!         Plan::action ──► "R:OK" | "R:<error>" (then exit 1)
//!         serve:
//!           "S:<child>" ── fork ──► child loops as node <child>
//!           "C:<cmd>"   ── fork ──► child runs the command runner, exits
//! ```
//!
//! ## Rules
//! - The parent's channel is the upstream of every child it forks; the child
//!   closes it right after announcing its own channel.
//! - A forked child reports only the dependencies its own action loads.
//! - A node exits when its private channel closes.
//! - Nodes ignore `SIGCHLD`; only command runners wait for their child.

mod channel;
mod command;
mod node;
mod plan;

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

pub use channel::Channel;
pub use plan::{FeatureReporter, Plan};

use crate::config::{IDENTIFIER_ENV, MASTER_FD_ENV};
use crate::error::AgentError;
use crate::transport::sys;
use node::Next;

/// Name a root process registers as when `FORKVISOR_IDENTIFIER` is unset.
pub const DEFAULT_ROOT: &str = "boot";

/// Runs the node protocol over the inherited master socket.
///
/// Returns in every process it creates; the value is that process's exit code.
pub fn run<P: Plan>(plan: &mut P) -> Result<i32, AgentError> {
    let raw = std::env::var(MASTER_FD_ENV).ok();
    let fd: RawFd = raw
        .as_deref()
        .and_then(|v| v.trim().parse().ok())
        .filter(|fd| *fd > 2)
        .ok_or(AgentError::MasterFd {
            var: MASTER_FD_ENV,
            value: raw.clone(),
        })?;
    sys::set_cloexec(fd, true).map_err(AgentError::sys("fcntl"))?;
    // SAFETY: the supervisor handed this descriptor to us alone; it was
    // validated by the fcntl call above.
    let master = Channel::new(unsafe { OwnedFd::from_raw_fd(fd) });

    let name = std::env::var(IDENTIFIER_ENV)
        .ok()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_ROOT.to_string());
    tracing::debug!(node = %name, "root process starting");

    let mut next = node::serve(plan, name, 0, master)?;
    loop {
        next = match next {
            Next::Node {
                name,
                parent_pid,
                upstream,
            } => node::serve(plan, name, parent_pid, upstream)?,
            Next::Command { name, upstream } => return command::run(plan, &name, upstream),
            Next::Exit(code) => return Ok(code),
        };
    }
}
