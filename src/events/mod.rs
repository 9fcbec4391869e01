//! Runtime events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Node` run loops, `ProcessTree` (restart propagation),
//!   the client handler, `Supervisor` (shutdown), `SubscriberSet` workers
//!   (overflow/panic).
//! - **Consumers**: `Supervisor::subscriber_listener()` (fans out to
//!   `SubscriberSet` and updates `StatusTracker`).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
