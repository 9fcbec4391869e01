//! Runtime core: orchestration and lifecycle.
//!
//! The public API from this module is [`Supervisor`] and its
//! [`SupervisorBuilder`], which tie the process tree, the file monitor,
//! the client socket and the subscribers together.
//!
//! Internal modules:
//! - [`supervisor`]: runs the components and drives shutdown within grace;
//! - [`builder`]: validates the tree and assembles the runtime;
//! - [`shutdown`]: OS termination signal handling.

mod builder;
mod shutdown;
mod supervisor;

pub use builder::SupervisorBuilder;
pub use shutdown::ShutdownSignals;
pub use supervisor::Supervisor;
