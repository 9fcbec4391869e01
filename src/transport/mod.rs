//! # Control transport and frame codec.
//!
//! - [`frame`]: text frames exchanged with node and command processes and clients.
//! - [`Transport`]: async framed socket with descriptor passing.
//!
//! The raw socket calls in `sys` are shared with the synchronous node-side
//! runner in [`crate::agent`].

pub mod frame;
mod socket;
pub(crate) mod sys;

pub use frame::{Frame, TERMINATOR};
pub use socket::Transport;
