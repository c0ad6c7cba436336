//! Cross-user process liveness and termination signals.
//!
//! Sessions may run under a different OS user than the manager, so a
//! permission error from the existence probe means the process is there and
//! merely not ours. Only `ESRCH` proves a process is gone.

use std::io;

/// Result of probing a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The probe was denied (`EPERM`). The process exists under another user.
    Inaccessible,
    Dead,
}

impl Liveness {
    pub fn is_alive(self) -> bool {
        !matches!(self, Liveness::Dead)
    }
}

/// The host's process table as seen by the lifecycle core.
pub trait ProcessTable: Send + Sync {
    fn probe(&self, pid: i32) -> Liveness;

    /// Ask `pid` to shut down gracefully (`SIGTERM`).
    fn terminate(&self, pid: i32) -> io::Result<()>;
}

/// [`ProcessTable`] backed by `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProcesses;

impl ProcessTable for HostProcesses {
    fn probe(&self, pid: i32) -> Liveness {
        probe_pid(pid)
    }

    fn terminate(&self, pid: i32) -> io::Result<()> {
        send_signal(pid, libc::SIGTERM)
    }
}

pub fn probe_pid(pid: i32) -> Liveness {
    if pid <= 0 {
        return Liveness::Dead;
    }
    // SAFETY: signal 0 performs the existence/permission check only and
    // delivers nothing. errno is read immediately after the call.
    let res = unsafe { libc::kill(pid, 0) };
    if res == 0 {
        return Liveness::Alive;
    }
    classify_probe_error(&io::Error::last_os_error())
}

fn classify_probe_error(err: &io::Error) -> Liveness {
    match err.raw_os_error() {
        Some(code) if code == libc::ESRCH => Liveness::Dead,
        // EPERM, and anything else we cannot interpret, leaves the process in
        // place: only a definitive "no such process" removes a record.
        _ => Liveness::Inaccessible,
    }
}

fn send_signal(pid: i32, signal: i32) -> io::Result<()> {
    // Never let a corrupt record turn into kill(0) or kill(-1).
    if pid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        ));
    }
    // SAFETY: plain integer arguments, no pointers involved.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
