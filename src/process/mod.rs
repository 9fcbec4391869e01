//! # OS processes speaking the node protocol.
//!
//! - [`ProcessHandle`]: a live node process (spawn/attach, readiness, crash
//!   detection, boot queue, escalating stop).
//! - [`BootRequest`] / [`PendingBoot`]: single-response spawn requests.
//! - [`CommandProcess`]: the master's side of a booted command.
//! - [`OutputTail`]: bounded capture of the root process's output.

mod boot;
mod command;
mod handle;
mod kill;
mod output;

pub use boot::{BootKind, BootRequest, BootResult, PendingBoot};
pub use command::CommandProcess;
pub use handle::{FileStream, ProcessHandle, ProcessPhase};
pub use kill::{force_kill, is_alive};
pub use output::OutputTail;
