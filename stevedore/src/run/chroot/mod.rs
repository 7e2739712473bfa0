//! Chroot isolation: three re-executions of this binary.
//!
//! 1. The grandparent raises rlimits, starts the parent in a new user
//!    namespace, writes its ID maps and forwards signals.
//! 2. The parent unshares the remaining namespaces, builds the mount tree,
//!    starts the child and relays its stdio.
//! 3. The child mounts `/proc`, masks paths, runs hooks, chroots, drops
//!    privileges, loads seccomp filters and execs the command.
//!
//! Each stage receives a [`StagePayload`] as JSON on file descriptor 3 and
//! exits the way its own child did.

mod binds;
mod child;
mod grandparent;
mod parent;
mod relay;

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};

use nix::fcntl::OFlag;
use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};
use stevedore_shared::constants::env as env_vars;
use stevedore_shared::errors::{ChildStatus, StevedoreError, StevedoreResult};
use thiserror::Error;

use crate::reexec::{self, Registration};
use crate::run::RunStdio;
use crate::util::fs::atomic_write_json;
use crate::util::process::child_status_from_std;

pub const STAGE1_NAME: &str = "stevedore-chroot-grandparent";
pub const STAGE2_NAME: &str = "stevedore-chroot-parent";
pub const STAGE3_NAME: &str = "stevedore-chroot-child";

/// Descriptor each stage reads its payload from.
pub(crate) const PAYLOAD_FD: i32 = 3;

/// Exit code for a stage that failed before the command ran.
pub const STAGE_FAILURE: i32 = 125;
/// The command exists but could not be executed.
pub const EXEC_FAILURE: i32 = 126;
/// The command was not found.
pub const EXEC_NOT_FOUND: i32 = 127;

inventory::submit! { Registration { name: STAGE1_NAME, entry: grandparent::main } }
inventory::submit! { Registration { name: STAGE2_NAME, entry: parent::main } }
inventory::submit! { Registration { name: STAGE3_NAME, entry: child::main } }

/// What every stage needs to know.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagePayload {
    pub spec: Spec,
    pub bundle: PathBuf,
    pub container_id: String,
    pub newuidmap: String,
    pub newgidmap: String,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("reading stage payload: {0}")]
    Payload(String),

    #[error("{what}: {source}")]
    Sys {
        what: String,
        #[source]
        source: nix::Error,
    },

    #[error("{what}: {source}")]
    Io {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("hook {path}: {reason}")]
    Hook { path: String, reason: String },

    #[error("{0}")]
    Setup(String),
}

impl StageError {
    pub(crate) fn sys(what: impl Into<String>, source: nix::Error) -> Self {
        StageError::Sys { what: what.into(), source }
    }

    pub(crate) fn io(what: impl Into<String>, source: std::io::Error) -> Self {
        StageError::Io { what: what.into(), source }
    }
}

impl From<StageError> for StevedoreError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Sys { what, source } => {
                StevedoreError::io(what, std::io::Error::from_raw_os_error(source as i32))
            }
            StageError::Io { what, source } => StevedoreError::io(what, source),
            StageError::Payload(m) => StevedoreError::Serialization(m),
            other => StevedoreError::Internal(other.to_string()),
        }
    }
}

pub(crate) type StageResult<T> = Result<T, StageError>;

/// Stage entries log to stderr only when asked to, so the command's own
/// stderr stays clean.
fn init_stage_logging() {
    if std::env::var_os(env_vars::DEBUG_STAGES).is_some() {
        let filter = tracing_subscriber::EnvFilter::new("debug");
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

/// Common wrapper for stage entry points.
fn stage_main(name: &str, body: fn() -> StageResult<i32>) -> i32 {
    init_stage_logging();
    match body() {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(stage = name, error = %e, "Stage failed");
            eprintln!("{}: {}", name, e);
            STAGE_FAILURE
        }
    }
}

/// Read this stage's payload from [`PAYLOAD_FD`] until EOF.
pub(crate) fn read_payload() -> StageResult<StagePayload> {
    // SAFETY: the previous stage placed the payload pipe at PAYLOAD_FD and
    // nothing else in this process owns it.
    let mut file = unsafe { File::from_raw_fd(PAYLOAD_FD) };
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| StageError::io("reading payload pipe", e))?;
    serde_json::from_slice(&data).map_err(|e| StageError::Payload(e.to_string()))
}

/// Arrange for `command` to find a pipe at [`PAYLOAD_FD`]; returns the
/// write end, to be filled once the process exists.
pub(crate) fn payload_pipe(command: &mut Command) -> StageResult<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) =
        nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| StageError::sys("payload pipe", e))?;
    let raw = read_end.as_raw_fd();
    // SAFETY: dup2 and fcntl are async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            let rc = if raw == PAYLOAD_FD {
                libc::fcntl(PAYLOAD_FD, libc::F_SETFD, 0)
            } else {
                libc::dup2(raw, PAYLOAD_FD)
            };
            if rc < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok((read_end, write_end))
}

/// Write the payload and close the pipe; the reader sees EOF.
pub(crate) fn send_payload(write_end: OwnedFd, payload: &StagePayload) -> StageResult<()> {
    let data = serde_json::to_vec(payload).map_err(|e| StageError::Payload(e.to_string()))?;
    let mut file = File::from(write_end);
    file.write_all(&data)
        .map_err(|e| StageError::io("writing payload pipe", e))
}

/// Spawn the next stage and hand it `payload`.
pub(crate) fn spawn_stage(mut command: Command, payload: &StagePayload) -> StageResult<Child> {
    let (read_end, write_end) = payload_pipe(&mut command)?;
    let child = command
        .spawn()
        .map_err(|e| StageError::io("starting next stage", e))?;
    drop(read_end);
    send_payload(write_end, payload)?;
    Ok(child)
}

/// Forward SIGHUP, SIGINT and SIGTERM to `pid` from a background thread.
/// Signals arriving after `pid` has been reaped go nowhere.
pub(crate) fn forward_signals(pid: u32) -> StageResult<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    let mut signals = signal_hook::iterator::Signals::new([SIGHUP, SIGINT, SIGTERM])
        .map_err(|e| StageError::io("installing signal handlers", e))?;
    std::thread::spawn(move || {
        for signal in signals.forever() {
            tracing::debug!(signal, pid, "Forwarding signal");
            unsafe {
                libc::kill(pid as libc::pid_t, signal);
            }
        }
    });
    Ok(())
}

/// Run `payload.spec` with chroot isolation and return how the command
/// finished.
pub fn run(payload: &StagePayload, stdio: RunStdio) -> StevedoreResult<ChildStatus> {
    std::fs::create_dir_all(&payload.bundle)
        .map_err(|e| StevedoreError::io(format!("Failed to create {}", payload.bundle.display()), e))?;
    atomic_write_json(&payload.bundle.join(crate::run::oci::CONFIG_FILE), &payload.spec)?;

    let (stdin, stdout, stderr) = stdio.into_stdio();
    let mut command = reexec::command(STAGE1_NAME);
    command.stdin(stdin).stdout(stdout).stderr(stderr);
    let mut child = spawn_stage(command, payload)?;
    tracing::debug!(pid = child.id(), id = %payload.container_id, "Started chroot grandparent");

    let status = child
        .wait()
        .map_err(|e| StevedoreError::io("Failed to wait for chroot grandparent", e))?;
    Ok(child_status_from_std(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_maps_errno() {
        let err: StevedoreError = StageError::sys("mount /proc", nix::Error::EPERM).into();
        assert!(matches!(err, StevedoreError::Permission(_)));
        let err: StevedoreError = StageError::Setup("bad".into()).into();
        assert!(matches!(err, StevedoreError::Internal(_)));
    }

    #[test]
    fn test_payload_pipe_round_trip() {
        let payload = StagePayload {
            spec: Spec::default(),
            bundle: PathBuf::from("/run/bundle"),
            container_id: "abc".into(),
            newuidmap: "newuidmap".into(),
            newgidmap: "newgidmap".into(),
        };
        let mut command = Command::new("cat");
        command.arg("/proc/self/fd/3").stdout(std::process::Stdio::piped());
        let child = spawn_stage(command, &payload).unwrap();
        let output = child.wait_with_output().unwrap();
        let echoed: StagePayload = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(echoed.container_id, "abc");
        assert_eq!(echoed.bundle, PathBuf::from("/run/bundle"));
    }
}
