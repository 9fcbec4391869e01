//! # Rendezvous socket for client connections.
//!
//! [`ClientListener::bind`] claims the socket path. A path that still accepts
//! connections belongs to another running instance; a path nobody listens on
//! is a leftover from a previous run and is replaced.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::handler::ClientHandler;
use crate::error::RuntimeError;
use crate::transport::Transport;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How long handshakes in flight get to report their failure after cancellation.
const SESSION_DRAIN: Duration = Duration::from_secs(2);

/// Listening rendezvous socket. The socket file is removed on drop.
#[derive(Debug)]
pub struct ClientListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ClientListener {
    /// Binds `path`. Must be called within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref().to_path_buf();
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                    return Err(RuntimeError::AlreadyRunning { path });
                }
                tracing::debug!(path = %path.display(), "replacing stale socket");
                std::fs::remove_file(&path).map_err(|source| RuntimeError::Listener {
                    path: path.clone(),
                    source,
                })?;
                UnixListener::bind(&path).map_err(|source| RuntimeError::Listener {
                    path: path.clone(),
                    source,
                })?
            }
            Err(source) => return Err(RuntimeError::Listener { path, source }),
        };
        tracing::info!(path = %path.display(), "listening for clients");
        Ok(Self { listener, path })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `token` is cancelled, one handler task each.
    ///
    /// On cancellation, handshakes in flight answer their client with a failure
    /// and are awaited; any still running after a short drain are aborted.
    pub async fn serve(&self, handler: ClientHandler, token: CancellationToken) {
        let handler = handler.with_shutdown(token.clone());
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => match Transport::from_unix_stream(stream) {
                        Ok(client) => {
                            let handler = handler.clone();
                            sessions.spawn(async move {
                                let _ = handler.handle(client).await;
                            });
                        }
                        Err(err) => tracing::warn!(error = %err, "cannot set up client connection"),
                    },
                    Err(err) => {
                        tracing::error!(error = %err, "unable to accept client connection");
                        time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
        let drained = time::timeout(SESSION_DRAIN, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(sessions = sessions.len(), "aborting client sessions still running");
            sessions.shutdown().await;
        }
    }
}

impl Drop for ClientListener {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "cannot remove socket");
            }
        }
    }
}
