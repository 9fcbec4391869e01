//! # forkvisor
//!
//! **Forkvisor** is a preloading process supervisor. It boots an application
//! once in a root process, forks a tree of warm child processes from it
//! (each loading more of the application), and runs short-lived commands by
//! forking them from the right node, with the client's terminal handed over.
//! When a file a node loaded changes, that node and everything forked from it
//! are restarted.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!  client ──► rendezvous socket ──► ClientListener ──► ClientHandler
//!                                                         │ boot_command
//!                                                         ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Supervisor                                                       │
//! │  - ProcessTree (nodes, commands, aliases, restart propagation)    │
//! │  - FileMonitor (notify watcher + debouncer)                       │
//! │  - Bus ──► SubscriberSet ──► StatusTracker, LogWriter, custom     │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!   ┌──────────┐       ┌──────────┐       ┌──────────┐
//!   │ Node     │ ◄──── │ Node     │ ◄──── │ Node     │   parent links
//!   │ (boot)   │ boot  │ (code)   │ boot  │ (test)   │   (inbox senders)
//!   └────┬─────┘       └────┬─────┘       └────┬─────┘
//!        ▼                  ▼                  ▼
//!   ProcessHandle      ProcessHandle      ProcessHandle    Transport + fd passing
//!        │                  │                  │
//!   root process ──fork──► child ──fork──► grandchild      (agent::run)
//! ```
//!
//! ### Node lifecycle
//! ```text
//! Unbooted ──spawn/attach──► Booting ──R:OK──► Ready
//!    ▲                          │                │
//!    │                          └──► Crashed ◄───┘  (error, process death)
//!    │                                  │
//!    └─────── restart request ──────────┘
//! any state ──tree stop──► Stopped
//! ```
//!
//! ## Features
//! | Area              | Description                                              | Key types / traits                   |
//! |-------------------|----------------------------------------------------------|--------------------------------------|
//! | **Supervision**   | Run the tree, the client socket and file monitoring.     | [`Supervisor`], [`SupervisorBuilder`]|
//! | **Topology**      | Declare nodes, commands and aliases.                     | [`TreeBuilder`], [`ProcessTree`]     |
//! | **Subscriber API**| Hook into node, command and shutdown events.             | [`Subscribe`], [`StatusTracker`]     |
//! | **Wire protocol** | Frames and descriptor passing, both sides.               | [`transport`], [`agent`]             |
//! | **Errors**        | Typed errors per concern.                                | [`RuntimeError`], [`ClientError`]    |
//! | **Configuration** | Centralized runtime settings with env overrides.         | [`Config`]                           |
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use forkvisor::{Config, LogWriter, Subscribe, SupervisorBuilder, TreeBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     forkvisor::logging::init();
//!
//!     let tree = TreeBuilder::new("boot", ["ruby", "-rforkvisor", "boot.rb"])
//!         .with_node("default_bundle", "boot")
//!         .with_node("test_environment", "default_bundle")
//!         .with_command("console", "default_bundle", ["c"])
//!         .with_command("rspec", "test_environment", Vec::<String>::new());
//!
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!     let sup = SupervisorBuilder::new(Config::from_env())
//!         .with_subscribers(subs)
//!         .build(tree)?;
//!
//!     sup.run().await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod client;
pub mod config;
mod core;
pub mod error;
pub mod events;
pub mod logging;
pub mod monitor;
pub mod node;
pub mod process;
pub mod subscribers;
pub mod transport;
pub mod tree;

// ---- Public re-exports ----

pub use config::Config;
pub use core::{ShutdownSignals, Supervisor, SupervisorBuilder};
pub use error::{AgentError, BootError, ClientError, ConfigError, ProcessError, RuntimeError, TransportError};
pub use events::{Bus, Event, EventKind};
pub use node::{NodeState, NodeStatus};
pub use subscribers::{LogWriter, StatusTracker, Subscribe, SubscriberSet};
pub use transport::Transport;
pub use tree::{ProcessTree, TreeBuilder, TreeSnapshot};
