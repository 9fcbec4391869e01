//! # File monitor: OS change notifications, debounced and fanned out.
//!
//! - [`FileMonitor`]: watches dependency paths reported by node processes.
//! - [`Debouncer`]: coalesces bursts into one [`Batch`] per window and
//!   delivers it to every listener.

mod debounce;
mod watcher;

pub use debounce::{Batch, Debouncer};
pub use watcher::FileMonitor;
