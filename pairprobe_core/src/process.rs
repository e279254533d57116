//! Process-group plumbing shared by the device session and the controller executor.

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of signalling a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Delivered,
    /// No process in the group exists any more.
    Gone,
}

/// Puts the spawned child at the head of a fresh process group, so its pgid equals its pid.
pub fn isolate_group(cmd: &mut Command) -> &mut Command {
    cmd.process_group(0)
}

pub fn pgid_of(child: &Child) -> i32 {
    // Pids fit in pid_t on every unix we target.
    child.id() as i32
}

pub fn signal_group(pgid: i32, signal: Signal) -> Result<GroupSignal, Errno> {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => Ok(GroupSignal::Delivered),
        Err(Errno::ESRCH) => Ok(GroupSignal::Gone),
        Err(e) => Err(e),
    }
}

/// Probes with the null signal. A group we may not signal still counts as present.
pub fn group_exists(pgid: i32) -> bool {
    !matches!(killpg(Pid::from_raw(pgid), None), Err(Errno::ESRCH))
}

/// Polls `try_wait` until the child exits or `timeout` elapses.
///
/// Returns `Ok(None)` on timeout; the child is left running for the caller to deal with.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start_time = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start_time.elapsed() >= timeout {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL.min(timeout.saturating_sub(start_time.elapsed())));
    }
}
