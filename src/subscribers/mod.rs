//! # Event subscribers.
//!
//! ```text
//! Node / Tree / ClientHandler ── publish(Event) ──► Bus ──► SubscriberSet
//!                                                        ┌──────┼──────────┐
//!                                                        ▼      ▼          ▼
//!                                               StatusTracker LogWriter  custom
//! ```
//!
//! - [`Subscribe`]: the trait every consumer implements.
//! - [`SubscriberSet`]: per-subscriber queues and worker tasks.
//! - [`StatusTracker`]: node states for status rendering and shutdown reports.
//! - [`LogWriter`]: renders events through `tracing`.

mod log;
mod set;
mod status;
mod subscribe;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use status::StatusTracker;
pub use subscribe::Subscribe;
