//! Runs delegated to an external OCI runtime (runc, crun).
//!
//! The runtime creates the container from the bundle, this process adopts
//! the container's init as a child subreaper, attaches networks, starts it
//! and reaps it.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use oci_spec::runtime::Spec;
use stevedore_shared::errors::{ChildStatus, StevedoreError, StevedoreResult};

use crate::cleanup::CleanupStack;
use crate::run::RunStdio;
use crate::run::network::NetworkHook;
use crate::run::spec::NetworkAttachment;
use crate::util::find_binary;
use crate::util::fs::atomic_write_json;
use crate::util::process::{child_status_from_wait, read_pid_file};

pub const CONFIG_FILE: &str = "config.json";
const PID_FILE: &str = "pid";
const LOG_FILE: &str = "runtime.log";

/// One delegated run.
pub struct OciRun<'a> {
    pub runtime: &'a str,
    /// Global flags placed before the subcommand.
    pub runtime_args: &'a [String],
    pub bundle: &'a Path,
    pub container_id: &'a str,
    pub no_pivot: bool,
    pub no_new_keyring: bool,
    pub network: Option<(&'a dyn NetworkHook, &'a [NetworkAttachment])>,
}

impl std::fmt::Debug for OciRun<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciRun")
            .field("runtime", &self.runtime)
            .field("bundle", &self.bundle)
            .field("container_id", &self.container_id)
            .finish_non_exhaustive()
    }
}

/// Keeps this process the reaper for orphaned descendants while alive.
struct SubreaperGuard {
    previous: libc::c_int,
}

impl SubreaperGuard {
    fn set() -> StevedoreResult<Self> {
        let mut previous: libc::c_int = 0;
        unsafe {
            libc::prctl(libc::PR_GET_CHILD_SUBREAPER, &mut previous as *mut libc::c_int);
            if libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong) != 0 {
                return Err(StevedoreError::io(
                    "Failed to become a child subreaper",
                    std::io::Error::last_os_error(),
                ));
            }
        }
        Ok(Self { previous })
    }
}

impl Drop for SubreaperGuard {
    fn drop(&mut self) {
        unsafe {
            libc::prctl(libc::PR_SET_CHILD_SUBREAPER, self.previous as libc::c_ulong);
        }
    }
}

impl OciRun<'_> {
    fn command(&self, binary: &Path) -> Command {
        let mut command = Command::new(binary);
        command
            .arg("--log")
            .arg(self.bundle.join(LOG_FILE))
            .args(self.runtime_args);
        command
    }

    fn create_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--bundle".to_string(),
            self.bundle.to_string_lossy().into_owned(),
            "--pid-file".to_string(),
            self.bundle.join(PID_FILE).to_string_lossy().into_owned(),
        ];
        if self.no_pivot {
            args.push("--no-pivot".into());
        }
        if self.no_new_keyring {
            args.push("--no-new-keyring".into());
        }
        args.push(self.container_id.to_string());
        args
    }

    fn runtime_error(&self, status: std::process::ExitStatus, stderr: &[u8]) -> StevedoreError {
        let log = std::fs::read_to_string(self.bundle.join(LOG_FILE)).unwrap_or_default();
        let detail = if log.trim().is_empty() {
            String::from_utf8_lossy(stderr).trim().to_string()
        } else {
            log.trim().to_string()
        };
        StevedoreError::Runtime {
            runtime: self.runtime.to_string(),
            exit_code: status.code().unwrap_or(-1),
            stderr: detail,
        }
    }

    /// Write `spec` into the bundle and run it to completion.
    pub fn run(&self, spec: &Spec, stdio: RunStdio) -> StevedoreResult<ChildStatus> {
        let binary = find_binary(self.runtime)?;
        std::fs::create_dir_all(self.bundle)
            .map_err(|e| StevedoreError::io(format!("Failed to create {}", self.bundle.display()), e))?;
        atomic_write_json(&self.bundle.join(CONFIG_FILE), spec)?;
        let _reaper = SubreaperGuard::set()?;
        let mut cleanup = CleanupStack::new();

        let (stdin, stdout, stderr) = stdio.into_stdio();
        tracing::debug!(runtime = %binary.display(), id = self.container_id, "Creating container");
        let create = self
            .command(&binary)
            .args(self.create_args())
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .map_err(|e| StevedoreError::io(format!("Failed to run {}", binary.display()), e))?;
        if !create.success() {
            return Err(self.runtime_error(create, &[]));
        }

        let delete_binary: PathBuf = binary.clone();
        let log = self.bundle.join(LOG_FILE);
        let runtime_args = self.runtime_args.to_vec();
        let id = self.container_id.to_string();
        cleanup.push("runtime delete", move || {
            let output = Command::new(&delete_binary)
                .arg("--log")
                .arg(&log)
                .args(&runtime_args)
                .args(["delete", "--force", &id])
                .stdin(Stdio::null())
                .output()
                .map_err(|e| StevedoreError::io("Failed to run runtime delete", e))?;
            if !output.status.success() {
                return Err(StevedoreError::Runtime {
                    runtime: delete_binary.display().to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            Ok(())
        });

        let pid = read_pid_file(&self.bundle.join(PID_FILE))?;
        if let Some((hook, attachments)) = self.network {
            let teardown = hook.setup(self.container_id, pid, attachments)?;
            cleanup.push("network teardown", teardown);
        }

        let start = self
            .command(&binary)
            .args(["start", self.container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| StevedoreError::io(format!("Failed to run {}", binary.display()), e))?;
        if !start.status.success() {
            return Err(self.runtime_error(start.status, &start.stderr));
        }

        let status = wait_for(pid)?;
        tracing::debug!(id = self.container_id, %status, "Container exited");
        let errors = cleanup.run();
        if !errors.is_empty() {
            tracing::warn!(count = errors.len(), "Runtime cleanup reported errors");
        }
        Ok(status)
    }
}

/// Reap `pid`, which must be a child or an adopted orphan.
pub fn wait_for(pid: u32) -> StevedoreResult<ChildStatus> {
    let pid = Pid::from_raw(pid as i32);
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(status) = child_status_from_wait(status) {
                    return Ok(status);
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(StevedoreError::Internal(format!("waitpid {}: {}", pid, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn run_for(bundle: &Path) -> OciRun<'_> {
        OciRun {
            runtime: "runc",
            runtime_args: &[],
            bundle,
            container_id: "abc",
            no_pivot: true,
            no_new_keyring: false,
            network: None,
        }
    }

    #[test]
    fn test_create_args() {
        let bundle = Path::new("/run/b");
        let args = run_for(bundle).create_args();
        assert_eq!(
            args,
            vec!["create", "--bundle", "/run/b", "--pid-file", "/run/b/pid", "--no-pivot", "abc"]
        );
    }

    #[test]
    fn test_create_failure_reports_log() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("fake-runtime");
        // Writes to the --log file given as $2 and fails.
        std::fs::write(&runtime, "#!/bin/sh\necho 'rootfs missing' > \"$2\"\nexit 5\n").unwrap();
        std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();

        let bundle = dir.path().join("bundle");
        let runtime_path = runtime.to_string_lossy().into_owned();
        let mut run = run_for(&bundle);
        run.runtime = &runtime_path;
        let err = run.run(&Spec::default(), RunStdio::default()).unwrap_err();
        match err {
            StevedoreError::Runtime { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 5);
                assert_eq!(stderr, "rootfs missing");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(bundle.join(CONFIG_FILE).is_file());
    }

    #[test]
    fn test_wait_for_child() {
        let child = Command::new("sh").args(["-c", "exit 4"]).spawn().unwrap();
        assert_eq!(wait_for(child.id()).unwrap(), ChildStatus::Exited(4));
    }
}
