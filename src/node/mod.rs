//! # Tree vertices: nodes, their commands and their processes.
//!
//! - [`Node`]: lifecycle state machine and boot-request inbox of one vertex.
//! - [`Command`]: routing leaf naming its owning node.
//! - [`NodeProcess`] / [`Spawn`]: the seams between a node and its OS process;
//!   [`OsSpawner`] is the production implementation.
//! - [`NodeState`] / [`NodeStatus`]: observable lifecycle state.

mod command;
#[allow(clippy::module_inception)]
mod node;
mod process;
mod state;

pub use command::Command;
pub use node::{Inbox, Node, NodeContext, ParentLink};
pub use process::{NodeProcess, OsSpawner, Spawn};
pub use state::{NodeState, NodeStatus};

#[cfg(test)]
pub(crate) use node::testing;
