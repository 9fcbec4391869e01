//! Escalating termination of processes that may not be our children.
//!
//! Forked nodes are grandchildren of the supervisor, so `wait` is unavailable;
//! liveness is probed with signal 0 until the process is gone or the timeout
//! elapses, then SIGKILL follows.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::time;

use crate::error::ProcessError;

/// Sends SIGTERM, waits up to `timeout` for `pid` to vanish, then sends SIGKILL.
///
/// A process that is already gone is not an error.
pub async fn force_kill(pid: i32, timeout: Duration, poll: Duration) -> Result<(), ProcessError> {
    let target = Pid::from_raw(pid);
    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(()),
        Err(source) => return Err(ProcessError::Signal { pid, source }),
    }

    let gone = async {
        while kill(target, None).is_ok() {
            time::sleep(poll).await;
        }
    };

    if time::timeout(timeout, gone).await.is_err() {
        tracing::debug!(pid, "process ignored SIGTERM; sending SIGKILL");
        match kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => return Err(ProcessError::Signal { pid, source }),
        }
    }
    Ok(())
}

/// Returns `true` if `pid` can still be signalled.
pub fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}
