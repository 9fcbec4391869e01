//! # Process tree: topology, command routing and restart propagation.
//!
//! - [`TreeBuilder`]: validates the topology and builds the tree.
//! - [`ProcessTree`]: read-only indices, node task management and
//!   file-change restarts.
//! - [`TreeSnapshot`]: status view for rendering.

mod builder;
#[allow(clippy::module_inception)]
mod tree;

pub use builder::TreeBuilder;
pub use tree::{ProcessTree, TreeSnapshot};
