//! Command runner: the process forked on `C:<name>`.
//!
//! ```text
//! runner                               supervisor
//!   ├─ fd(private channel) ──────────►
//!   │  ◄──────────────────────────────  "<client_pid>:<argc>", argc × arg, tty fd
//!   ├─ fork ─► command (stdio = tty, Plan::command, exit code)
//!   ├─ "P:<command_pid>:<runner_pid>:<name>" ──►
//!   └─ "<exit code>" ─────────────────►  after the command exits
//! ```
//!
//! The command is killed if the client process disappears first.

use std::io::Write;
use std::os::fd::{AsFd, AsRawFd};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, dup2, fork, getpid, setsid};

use super::channel::Channel;
use super::plan::Plan;
use crate::error::{AgentError, TransportError};
use crate::transport::Frame;
use crate::transport::frame::parse_client_handoff;

/// Interval between client liveness checks while the command runs.
const CLIENT_POLL: Duration = Duration::from_millis(100);

/// Serves one command hand-off; returns the runner's own exit code.
pub(super) fn run<P: Plan>(plan: &mut P, name: &str, upstream: Channel) -> Result<i32, AgentError> {
    let _ = setsid();
    // SAFETY: restores the default disposition so the command can be waited for.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) }.map_err(AgentError::sys("signal"))?;

    let (mut local, remote) = Channel::pair()?;
    upstream.write_fd(remote.as_fd())?;
    drop(remote);
    drop(upstream);

    let handoff = local.read_message()?;
    let (client_pid, argc) = parse_client_handoff(&handoff).map_err(TransportError::from)?;
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(local.read_message()?);
    }
    let tty = local.read_fd()?;

    let runner_pid = getpid().as_raw();
    // SAFETY: the runner is single-threaded.
    match unsafe { fork() }.map_err(AgentError::sys("fork"))? {
        ForkResult::Child => {
            drop(local);
            for stdio in 0..=2 {
                if dup2(tty.as_raw_fd(), stdio).is_err() {
                    std::process::exit(1);
                }
            }
            drop(tty);
            let code = plan.command(name, &args);
            let _ = std::io::stdout().flush();
            let _ = std::io::stderr().flush();
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            drop(tty);
            local.write_message(
                &Frame::Registration {
                    pid: child.as_raw(),
                    parent_pid: runner_pid,
                    identifier: name.to_string(),
                }
                .encode(),
            )?;
            let code = wait_for(child, client_pid)?;
            tracing::debug!(command = %name, pid = child.as_raw(), code, "command finished");
            local.write_message(&code.to_string())?;
            Ok(0)
        }
    }
}

/// Waits for the command, killing it if the client goes away.
///
/// Commands ended by a signal report `128 + signal`.
fn wait_for(child: Pid, client_pid: i32) -> Result<i32, AgentError> {
    let mut killed = false;
    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(AgentError::Sys { call: "waitpid", source }),
        }
        if !killed && client_gone(client_pid) {
            tracing::debug!(client_pid, pid = child.as_raw(), "client went away; killing command");
            let _ = kill(child, Signal::SIGKILL);
            killed = true;
        }
        thread::sleep(CLIENT_POLL);
    }
}

fn client_gone(client_pid: i32) -> bool {
    client_pid > 0 && kill(Pid::from_raw(client_pid), None) == Err(Errno::ESRCH)
}
