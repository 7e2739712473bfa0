//! Process helpers for isolation stages: PID files, wait statuses and exits.

use std::path::Path;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use stevedore_shared::errors::{ChildStatus, StevedoreError, StevedoreResult};

/// Read the init PID the OCI runtime wrote to the bundle after `create`.
pub fn read_pid_file(path: &Path) -> StevedoreResult<u32> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        StevedoreError::Storage(format!("Failed to read PID file {}: {}", path.display(), e))
    })?;

    content.trim().parse::<u32>().map_err(|e| {
        StevedoreError::Internal(format!(
            "Invalid PID in {}: {:?}: {}",
            path.display(),
            content.trim(),
            e
        ))
    })
}

/// Human-readable signal name ("SIGTERM"), falling back to the number.
pub fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {}", signal),
    }
}

/// Convert a nix [`WaitStatus`] into a [`ChildStatus`]; `None` for
/// stop/continue notifications that do not end the process.
pub fn child_status_from_wait(status: WaitStatus) -> Option<ChildStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ChildStatus::Exited(code)),
        WaitStatus::Signaled(_, sig, _) => Some(ChildStatus::Signaled(sig as i32)),
        _ => None,
    }
}

/// Convert a std [`ExitStatus`](std::process::ExitStatus) into a [`ChildStatus`].
pub fn child_status_from_std(status: std::process::ExitStatus) -> ChildStatus {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => ChildStatus::Exited(code),
        (None, Some(sig)) => ChildStatus::Signaled(sig),
        (None, None) => ChildStatus::Exited(1),
    }
}

/// Exit the current process the way a stage does when its child finished:
/// same code on a normal exit, 1 after printing the signal name otherwise.
pub fn exit_like(status: ChildStatus) -> ! {
    match status {
        ChildStatus::Exited(code) => std::process::exit(code),
        ChildStatus::Signaled(sig) => {
            eprintln!("{}", signal_name(sig));
            std::process::exit(1)
        }
    }
}

/// Arrange for the calling process to receive SIGKILL when its parent dies.
///
/// Safe to call between `fork` and `exec`.
pub fn set_parent_death_signal() -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
