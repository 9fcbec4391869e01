//! # OS termination signals.
//!
//! [`ShutdownSignals`] registers `SIGINT`, `SIGTERM` and `SIGQUIT` up front so
//! a failure to install handlers surfaces before anything is started.
//! `SIGPIPE` is left alone: a client disappearing mid-handshake is reported
//! as a transport error on that connection only.

use std::io;

use tokio::signal::unix::{Signal, SignalKind, signal};

/// Installed termination signal listeners.
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
    sigquit: Signal,
}

impl ShutdownSignals {
    /// Registers the listeners. Must be called within a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Completes when any termination signal arrives.
    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.sigint.recv()  => tracing::debug!("received SIGINT"),
            _ = self.sigterm.recv() => tracing::debug!("received SIGTERM"),
            _ = self.sigquit.recv() => tracing::debug!("received SIGQUIT"),
        }
    }
}
