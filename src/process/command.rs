//! # CommandProcess: the master's side of a booted command.
//!
//! ```text
//! start(client_pid, args, tty) ──► "<client_pid>:<argc>", argc × "<arg>", tty fd
//! pid()                        ◄── "P:<command_pid>:<runner_pid>:<name>"
//! wait()                       ◄── "<exit status>" (relayed verbatim)
//! ```

use std::os::fd::BorrowedFd;

use crate::error::TransportError;
use crate::transport::Transport;
use crate::transport::frame::{encode_client_handoff, parse_registration};

/// A command process booted from a node, awaiting its client hand-off.
#[derive(Debug)]
pub struct CommandProcess {
    transport: Transport,
}

impl CommandProcess {
    /// Wraps the control transport returned by a command boot.
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Hands the client's pid, arguments and terminal to the command process.
    pub async fn start(
        &self,
        client_pid: i32,
        args: &[String],
        tty: BorrowedFd<'_>,
    ) -> Result<(), TransportError> {
        let _exchange = self.transport.lock_exchange().await;
        self.transport
            .write_message(&encode_client_handoff(client_pid, args.len()))
            .await?;
        for arg in args {
            self.transport.write_message(arg).await?;
        }
        self.transport.write_fd(tty).await
    }

    /// Reads the pid of the process actually running the command.
    pub async fn pid(&self) -> Result<i32, TransportError> {
        let msg = self.transport.read_message().await?;
        let (pid, _, _) = parse_registration(&msg)?;
        Ok(pid)
    }

    /// Reads the command's exit status frame.
    pub async fn wait(&self) -> Result<String, TransportError> {
        self.transport.read_message().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[tokio::test]
    async fn handoff_then_pid_and_status() {
        let (ours, theirs) = Transport::pair().unwrap();
        let cmd = CommandProcess::new(ours);
        let tty = tempfile::tempfile().unwrap();

        cmd.start(4242, &["db:migrate".into(), "".into()], tty.as_fd())
            .await
            .unwrap();
        assert_eq!(theirs.read_message().await.unwrap(), "4242:2");
        assert_eq!(theirs.read_message().await.unwrap(), "db:migrate");
        assert_eq!(theirs.read_message().await.unwrap(), "");
        theirs.read_fd().await.unwrap();

        theirs.write_message("P:5000:4999:rake").await.unwrap();
        theirs.write_message("0").await.unwrap();
        assert_eq!(cmd.pid().await.unwrap(), 5000);
        assert_eq!(cmd.wait().await.unwrap(), "0");
    }

    #[tokio::test]
    async fn closed_command_reports_error() {
        let (ours, theirs) = Transport::pair().unwrap();
        let cmd = CommandProcess::new(ours);
        drop(theirs);
        assert!(matches!(cmd.pid().await, Err(TransportError::Closed)));
    }
}
