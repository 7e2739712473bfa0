//! User-mode networking through slirp4netns for rootless runs.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::run::network::{NetworkHook, Teardown};
use crate::run::spec::NetworkAttachment;
use crate::util::find_binary;

/// Descriptor slirp4netns writes its readiness byte to.
const READY_FD: i32 = 3;
const READ_TIMEOUT_MS: u16 = 1000;
const READY_DEADLINE: Duration = Duration::from_secs(30);
const MTU: u32 = 65520;

fn slirp_args(pid: u32) -> Vec<String> {
    vec![
        "--configure".into(),
        format!("--mtu={}", MTU),
        "--disable-host-loopback".into(),
        format!("--ready-fd={}", READY_FD),
        pid.to_string(),
        "tap0".into(),
    ]
}

fn exited(child: &mut Child) -> Option<String> {
    match child.try_wait() {
        Ok(Some(status)) => Some(status.to_string()),
        Ok(None) => None,
        Err(e) => Some(format!("wait failed: {}", e)),
    }
}

fn stop(mut child: Child) -> StevedoreResult<()> {
    if let Ok(None) = child.try_wait() {
        let _ = child.kill();
    }
    child
        .wait()
        .map(|_| ())
        .map_err(|e| StevedoreError::io("Failed to reap slirp4netns", e))
}

/// Wait for the readiness byte, one bounded read at a time.
fn wait_ready(child: &mut Child, ready: OwnedFd) -> StevedoreResult<()> {
    let deadline = Instant::now() + READY_DEADLINE;
    let mut file = File::from(ready);
    loop {
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        let n = match poll(&mut fds, PollTimeout::from(READ_TIMEOUT_MS)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(StevedoreError::SlirpFailed(format!("poll on ready pipe: {}", e))),
        };
        if n == 0 {
            if let Some(status) = exited(child) {
                return Err(StevedoreError::SlirpFailed(format!("exited before ready: {}", status)));
            }
            if Instant::now() > deadline {
                return Err(StevedoreError::SlirpFailed("timed out waiting for readiness".into()));
            }
            continue;
        }
        let mut byte = [0u8; 1];
        match file.read(&mut byte) {
            Ok(1) => return Ok(()),
            Ok(_) => {
                let status = exited(child).unwrap_or_else(|| "closed its ready pipe".into());
                return Err(StevedoreError::SlirpFailed(format!("not ready: {}", status)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StevedoreError::SlirpFailed(format!("read ready pipe: {}", e))),
        }
    }
}

/// Start slirp4netns for the namespace of `pid` and wait until the tap
/// device is configured. The teardown kills and reaps it.
pub fn start(binary: &str, pid: u32) -> StevedoreResult<Teardown> {
    let path = find_binary(binary)?;
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| StevedoreError::Resource(format!("pipe for slirp4netns: {}", e)))?;
    let write_raw = write_end.as_raw_fd();

    let mut command = Command::new(&path);
    command
        .args(slirp_args(pid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    // dup2 clears close-on-exec on the copy.
    unsafe {
        command.pre_exec(move || {
            let rc = if write_raw == READY_FD {
                libc::fcntl(READY_FD, libc::F_SETFD, 0)
            } else {
                libc::dup2(write_raw, READY_FD)
            };
            if rc < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut child = command
        .spawn()
        .map_err(|e| StevedoreError::io(format!("Failed to start {}", path.display()), e))?;
    drop(write_end);

    if let Err(e) = wait_ready(&mut child, read_end) {
        let _ = stop(child);
        return Err(e);
    }
    tracing::info!(pid, slirp_pid = child.id(), "slirp4netns ready");
    Ok(Box::new(move || stop(child)))
}

/// Network hook for rootless runs.
#[derive(Clone, Debug)]
pub struct SlirpNetwork {
    binary: String,
}

impl SlirpNetwork {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl NetworkHook for SlirpNetwork {
    fn setup(&self, _container_id: &str, pid: u32, attachments: &[NetworkAttachment]) -> StevedoreResult<Teardown> {
        if attachments.iter().any(|a| !a.network.is_empty()) {
            tracing::warn!("Named networks are not available to rootless runs; using slirp4netns");
        }
        start(&self.binary, pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_slirp(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("slirp4netns");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_args() {
        assert_eq!(
            slirp_args(42),
            vec!["--configure", "--mtu=65520", "--disable-host-loopback", "--ready-fd=3", "42", "tap0"]
        );
    }

    #[test]
    fn test_ready_then_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_slirp(dir.path(), "printf 1 >&3\nexec sleep 60");
        let teardown = start(&bin, 1).unwrap();
        teardown().unwrap();
    }

    #[test]
    fn test_exit_before_ready_fails() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_slirp(dir.path(), "exit 3");
        let err = start(&bin, 1).err().unwrap();
        assert!(matches!(err, StevedoreError::SlirpFailed(_)));
    }
}
