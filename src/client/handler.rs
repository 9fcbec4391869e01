//! # Client handshake.
//!
//! One pass per connection:
//! ```text
//! client                         handler                        command process
//!   T:<argc>:<pid>:<command> ──►
//!   argc × <arg>             ──►
//!   tty fd                   ──►
//!                                resolve command, boot on its node
//!                                "<pid>:<argc>", args, tty  ──►
//!                                                           ◄── P:<cmd_pid>:<runner>:
//!   <cmd_pid>                ◄──
//!                                                           ◄── <exit status>
//!   <exit status>            ◄──
//! ```
//!
//! ## Rules
//! - A failing step skips every later step. Frames already sent stay sent.
//! - On failure the client gets pid `0` if no pid was sent yet, the error
//!   text on its terminal, and exit status `1`.
//! - Every connection ends with exactly one exit status frame, including
//!   connections still in flight when the supervisor shuts down.

use std::io::Write;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, TransportError};
use crate::events::{Bus, Event, EventKind};
use crate::transport::{Frame, Transport};
use crate::tree::ProcessTree;

/// Exit status reported when the handshake fails.
const FAILED_EXIT_STATUS: &str = "1";

/// Pid reported when no command process was started.
const NO_PID: &str = "0";

#[derive(Default)]
struct Session {
    command: Option<Arc<str>>,
    tty: Option<OwnedFd>,
    pid_sent: bool,
    exit_sent: bool,
}

/// Drives the handshake for client connections against one tree.
#[derive(Clone)]
pub struct ClientHandler {
    tree: Arc<ProcessTree>,
    bus: Bus,
    shutdown: CancellationToken,
}

impl ClientHandler {
    /// Creates a handler routing commands through `tree`.
    pub fn new(tree: Arc<ProcessTree>, bus: Bus) -> Self {
        Self {
            tree,
            bus,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ends handshakes in flight with [`ClientError::ShuttingDown`] once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Runs the handshake on one connection.
    ///
    /// The client always receives an exit status, even when an error is returned.
    pub async fn handle(&self, client: Transport) -> Result<(), ClientError> {
        let mut session = Session::default();
        let res = tokio::select! {
            res = self.serve(&client, &mut session) => res,
            _ = self.shutdown.cancelled() => Err(ClientError::ShuttingDown),
        };
        if let Err(err) = &res {
            tracing::warn!(
                command = session.command.as_deref().unwrap_or(""),
                error = %err,
                label = err.as_label(),
                "client request failed"
            );
            let mut ev = Event::new(EventKind::ClientFailed).with_reason(err.to_string());
            if let Some(command) = &session.command {
                ev = ev.with_command(command.clone());
            }
            self.bus.publish(ev);
            self.report_failure(&client, &mut session, err).await;
        }
        res
    }

    async fn serve(&self, client: &Transport, session: &mut Session) -> Result<(), ClientError> {
        let request = client.read_message().await?;
        let (arg_count, client_pid, name) = match Frame::parse_expecting(&request, "T")
            .map_err(TransportError::from)?
        {
            Frame::ClientRequest {
                arg_count,
                pid,
                command,
            } => (arg_count, pid, command),
            _ => unreachable!("parse_expecting checked the tag"),
        };
        session.command = Some(Arc::from(name.as_str()));

        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            args.push(client.read_message().await?);
        }
        let tty = session.tty.insert(client.read_fd().await?);

        let (command, process) = self.tree.boot_command(&name).await?;
        session.command = Some(command.name().clone());
        tracing::debug!(command = %command.name(), node = %command.node(), client_pid, "command booted");

        process.start(client_pid, &args, tty.as_fd()).await?;
        let pid = process.pid().await?;
        client.write_message(&pid.to_string()).await?;
        session.pid_sent = true;
        self.bus.publish(
            Event::new(EventKind::CommandBooted)
                .with_node(command.node().clone())
                .with_command(command.name().clone())
                .with_pid(pid),
        );

        let status = process.wait().await?;
        client.write_message(&status).await?;
        session.exit_sent = true;
        self.bus.publish(
            Event::new(EventKind::CommandFinished)
                .with_command(command.name().clone())
                .with_pid(pid)
                .with_reason(status),
        );
        Ok(())
    }

    async fn report_failure(&self, client: &Transport, session: &mut Session, err: &ClientError) {
        if !session.pid_sent {
            if client.write_message(NO_PID).await.is_err() {
                return;
            }
            session.pid_sent = true;
        }
        if let Some(tty) = session.tty.take() {
            let text = format!("{err}\n");
            let written = tokio::task::spawn_blocking(move || {
                std::fs::File::from(tty).write_all(text.as_bytes())
            })
            .await;
            match written {
                Ok(Err(e)) => tracing::debug!(error = %ClientError::Terminal(e), "cannot report failure to client"),
                Err(e) => tracing::debug!(error = %e, "terminal writer panicked"),
                Ok(Ok(())) => {}
            }
        }
        if !session.exit_sent {
            let _ = client.write_message(FAILED_EXIT_STATUS).await;
            session.exit_sent = true;
        }
    }
}
