//! # Client side of the supervisor.
//!
//! - [`ClientListener`]: rendezvous socket and accept loop.
//! - [`ClientHandler`]: per-connection handshake that runs one command and
//!   relays its pid and exit status.

mod handler;
mod listener;

pub use handler::ClientHandler;
pub use listener::ClientListener;
