use std::fs::File;
use std::os::fd::AsFd;

use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{ForkResult, fork, getpid, pipe};

use super::channel::Channel;
use super::plan::{FeatureReporter, Plan};
use crate::error::{AgentError, TransportError};
use crate::transport::Frame;
use crate::transport::frame::ACTION_OK;
use crate::transport::sys;

/// What the current process turns into after serving a request.
pub(super) enum Next {
    /// A forked child that must boot node `name`.
    Node {
        name: String,
        parent_pid: i32,
        upstream: Channel,
    },
    /// A forked child that must run command `name`.
    Command { name: String, upstream: Channel },
    /// The process is done.
    Exit(i32),
}

/// Runs node `name` until its control socket closes or it forks a child.
///
/// `upstream` is the socket the new private channel is announced on: the
/// supervisor's master socket for the root, the parent's channel otherwise.
pub(super) fn serve<P: Plan>(
    plan: &mut P,
    name: String,
    parent_pid: i32,
    upstream: Channel,
) -> Result<Next, AgentError> {
    // SAFETY: no handler is installed; children are reaped by the kernel so a
    // stopped node never lingers as a zombie.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }.map_err(AgentError::sys("signal"))?;

    let (mut local, remote) = Channel::pair()?;
    upstream.write_fd(remote.as_fd())?;
    drop(remote);
    drop(upstream);

    let pid = getpid().as_raw();
    local.write_message(
        &Frame::Registration {
            pid,
            parent_pid,
            identifier: name.clone(),
        }
        .encode(),
    )?;

    let (pipe_r, pipe_w) = pipe().map_err(AgentError::sys("pipe"))?;
    for fd in [&pipe_r, &pipe_w] {
        sys::set_cloexec(sys::raw(fd), true).map_err(AgentError::sys("fcntl"))?;
    }
    local.write_fd(pipe_r.as_fd())?;
    drop(pipe_r);

    let mut features = FeatureReporter::new(File::from(pipe_w));
    if let Err(text) = plan.action(&name, &mut features) {
        tracing::debug!(node = %name, error = %text, "action failed");
        let text = match text.replace('\0', " ") {
            t if t == ACTION_OK => format!("action failed: {t}"),
            t => t,
        };
        local.write_message(&Frame::ActionResponse(text).encode())?;
        // Stay up until the supervisor stops us so the response is read
        // before the feature pipe closes.
        while local.read_message().is_ok() {}
        return Ok(Next::Exit(1));
    }
    local.write_message(&Frame::ActionResponse(ACTION_OK.to_string()).encode())?;
    tracing::debug!(node = %name, pid, "node ready");

    loop {
        let msg = match local.read_message() {
            Ok(msg) => msg,
            Err(TransportError::Closed) => return Ok(Next::Exit(0)),
            Err(e) => return Err(e.into()),
        };
        let (child, is_node) = match Frame::parse(&msg) {
            Ok(Frame::SpawnNode(child)) => (child, true),
            Ok(Frame::SpawnCommand(child)) => (child, false),
            Ok(other) => {
                tracing::warn!(node = %name, frame = %other.encode(), "ignoring unexpected frame");
                continue;
            }
            Err(e) => return Err(TransportError::from(e).into()),
        };

        // SAFETY: node processes are single-threaded; the child only continues
        // this same synchronous loop or runs the command.
        match unsafe { fork() }.map_err(AgentError::sys("fork"))? {
            ForkResult::Parent { child: forked } => {
                tracing::debug!(node = %name, pid = forked.as_raw(), request = %msg, "forked");
            }
            ForkResult::Child => {
                return Ok(if is_node {
                    Next::Node {
                        name: child,
                        parent_pid: pid,
                        upstream: local,
                    }
                } else {
                    Next::Command {
                        name: child,
                        upstream: local,
                    }
                });
            }
        }
    }
}
