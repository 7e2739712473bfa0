//! Third stage: finish the mount tree from inside the PID namespace, run
//! hooks, confine the process and exec the command.

use std::collections::HashSet;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

use caps::{CapSet, Capability as Cap};
use nix::unistd::{Gid, Uid};
use oci_spec::runtime::{Capabilities, Hook, Process, Spec};

use super::{
    EXEC_FAILURE, EXEC_NOT_FOUND, STAGE3_NAME, StageError, StagePayload, StageResult, binds,
};
use crate::run::spec::{rlimits, seccomp};
use crate::util::process::set_parent_death_signal;

const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
const HOOK_POLL: Duration = Duration::from_millis(10);

pub(super) fn main() -> i32 {
    super::stage_main(STAGE3_NAME, run)
}

/// OCI state document handed to hooks on stdin.
fn hook_state(payload: &StagePayload) -> serde_json::Value {
    serde_json::json!({
        "ociVersion": payload.spec.version(),
        "id": payload.container_id,
        "status": "created",
        "pid": std::process::id(),
        "bundle": payload.bundle,
        "annotations": payload.spec.annotations().clone().unwrap_or_default(),
    })
}

fn run_hook(hook: &Hook, state: &[u8]) -> StageResult<()> {
    let path = hook.path().display().to_string();
    let hook_error = |reason: String| StageError::Hook {
        path: path.clone(),
        reason,
    };

    let mut command = Command::new(hook.path());
    if let Some((arg0, rest)) = hook.args().as_deref().and_then(|a| a.split_first()) {
        command.arg0(arg0).args(rest);
    }
    command.env_clear();
    for entry in hook.env().iter().flatten() {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }
    let mut child = command
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| hook_error(e.to_string()))?;
    if let Some(mut stdin) = child.stdin.take() {
        // A hook that ignores its input may close stdin early.
        let _ = stdin.write_all(state);
    }

    let deadline = hook
        .timeout()
        .filter(|t| *t > 0)
        .map(|t| Instant::now() + Duration::from_secs(t as u64));
    loop {
        match child.try_wait().map_err(|e| hook_error(e.to_string()))? {
            Some(status) if status.success() => return Ok(()),
            Some(status) => return Err(hook_error(format!("exited with {}", status))),
            None => {}
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(hook_error("timed out".into()));
        }
        std::thread::sleep(HOOK_POLL);
    }
}

/// Prestart hooks, then createRuntime hooks, each with the state on stdin.
fn run_hooks(payload: &StagePayload) -> StageResult<()> {
    let Some(hooks) = payload.spec.hooks() else { return Ok(()) };
    #[allow(deprecated)]
    let prestart = hooks.prestart().clone().unwrap_or_default();
    let create_runtime = hooks.create_runtime().clone().unwrap_or_default();
    if prestart.is_empty() && create_runtime.is_empty() {
        return Ok(());
    }
    let state = serde_json::to_vec(&hook_state(payload)).map_err(|e| StageError::Payload(e.to_string()))?;
    for hook in prestart.iter().chain(create_runtime.iter()) {
        tracing::debug!(hook = %hook.path().display(), "Running hook");
        run_hook(hook, &state)?;
    }
    Ok(())
}

fn to_caps(set: &Option<Capabilities>) -> HashSet<Cap> {
    let mut out = HashSet::new();
    for cap in set.iter().flatten() {
        let name = serde_json::to_value(cap)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        match Cap::from_str(&name) {
            Ok(c) => {
                out.insert(c);
            }
            Err(_) => tracing::debug!(capability = %name, "Capability unknown to this kernel interface"),
        }
    }
    out
}

fn caps_error(what: &str, e: caps::errors::CapsError) -> StageError {
    StageError::Setup(format!("{}: {}", what, e))
}

/// Switch to the command's user and install its capability sets.
fn drop_privileges(process: &Process) -> StageResult<()> {
    let user = process.user();
    let caps = process.capabilities().as_ref();
    let bounding = caps.map(|c| to_caps(c.bounding())).unwrap_or_default();

    if caps.is_some() {
        for cap in caps::all() {
            if !bounding.contains(&cap) {
                caps::drop(None, CapSet::Bounding, cap).map_err(|e| caps_error("drop bounding capability", e))?;
            }
        }
    }

    unsafe {
        libc::prctl(libc::PR_SET_KEEPCAPS, 1 as libc::c_ulong);
    }
    let groups: Vec<Gid> = user
        .additional_gids()
        .iter()
        .flatten()
        .map(|g| Gid::from_raw(*g))
        .collect();
    match nix::unistd::setgroups(&groups) {
        Ok(()) => {}
        // setgroups is denied in namespaces mapped without newgidmap.
        Err(nix::errno::Errno::EPERM) if groups.is_empty() => {}
        Err(e) => return Err(StageError::sys("setgroups", e)),
    }
    let gid = Gid::from_raw(user.gid());
    let uid = Uid::from_raw(user.uid());
    nix::unistd::setresgid(gid, gid, gid).map_err(|e| StageError::sys("setgid", e))?;
    nix::unistd::setresuid(uid, uid, uid).map_err(|e| StageError::sys("setuid", e))?;
    unsafe {
        libc::prctl(libc::PR_SET_KEEPCAPS, 0 as libc::c_ulong);
    }

    if let Some(c) = caps {
        caps::set(None, CapSet::Effective, &to_caps(c.effective())).map_err(|e| caps_error("effective set", e))?;
        caps::set(None, CapSet::Permitted, &to_caps(c.permitted())).map_err(|e| caps_error("permitted set", e))?;
        caps::set(None, CapSet::Inheritable, &to_caps(c.inheritable()))
            .map_err(|e| caps_error("inheritable set", e))?;
        caps::set(None, CapSet::Ambient, &to_caps(c.ambient())).map_err(|e| caps_error("ambient set", e))?;
    }
    Ok(())
}

fn set_exec_label(label: &str) {
    if label.is_empty() {
        return;
    }
    if let Err(e) = std::fs::write("/proc/thread-self/attr/exec", label) {
        tracing::warn!(label, error = %e, "Failed to set process label");
    }
}

fn load_seccomp(spec: &Spec) -> StageResult<()> {
    let Some(profile) = spec.linux().as_ref().and_then(|l| l.seccomp().as_ref()) else {
        return Ok(());
    };
    let programs = seccomp::bpf::compile(profile).map_err(|e| StageError::Setup(e.to_string()))?;
    for program in &programs {
        seccompiler::apply_filter(program).map_err(|e| StageError::Setup(format!("load seccomp filter: {}", e)))?;
    }
    Ok(())
}

fn mark_inherited_cloexec() {
    unsafe {
        libc::syscall(libc::SYS_close_range, 3 as libc::c_uint, libc::c_uint::MAX, CLOSE_RANGE_CLOEXEC);
    }
}

fn exec(process: &Process) -> i32 {
    let args = process.args().clone().unwrap_or_default();
    let Some((program, rest)) = args.split_first() else {
        eprintln!("{}: no command given", STAGE3_NAME);
        return EXEC_FAILURE;
    };
    let mut command = Command::new(program);
    command.args(rest).env_clear();
    for entry in process.env().iter().flatten() {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }
    let err = command.exec();
    eprintln!("{}: {}: {}", STAGE3_NAME, program, err);
    if err.kind() == std::io::ErrorKind::NotFound {
        EXEC_NOT_FOUND
    } else {
        EXEC_FAILURE
    }
}

fn run() -> StageResult<i32> {
    let _ = set_parent_death_signal();
    let payload = super::read_payload()?;
    let spec = &payload.spec;
    let process = spec
        .process()
        .as_ref()
        .ok_or_else(|| StageError::Setup("spec has no process".into()))?;
    let root = super::parent::rootfs(spec)?;

    let mounts = spec.mounts().clone().unwrap_or_default();
    binds::mount_proc(&root, &mounts)?;
    if let Some(linux) = spec.linux() {
        binds::mask_paths(&root, linux.masked_paths().as_deref().unwrap_or_default())?;
        binds::readonly_paths(&root, linux.readonly_paths().as_deref().unwrap_or_default())?;
    }
    run_hooks(&payload)?;

    nix::unistd::chroot(&root).map_err(|e| StageError::sys(format!("chroot {}", root.display()), e))?;
    nix::unistd::chdir("/").map_err(|e| StageError::sys("chdir /", e))?;
    if let Some(limits) = process.rlimits() {
        rlimits::apply_limits(limits)
            .map_err(|(typ, e)| StageError::sys(format!("set {:?}", typ), e))?;
    }
    let cwd: &Path = process.cwd();
    nix::unistd::chdir(cwd).map_err(|e| StageError::sys(format!("chdir {}", cwd.display()), e))?;

    drop_privileges(process)?;
    if process.no_new_privileges().unwrap_or(false) {
        unsafe {
            libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0);
        }
    }
    set_exec_label(process.selinux_label().as_deref().unwrap_or(""));
    load_seccomp(spec)?;
    mark_inherited_cloexec();
    Ok(exec(process))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{Capability, HookBuilder};
    use std::os::unix::fs::PermissionsExt;

    fn payload() -> StagePayload {
        StagePayload {
            spec: Spec::default(),
            bundle: "/run/bundle".into(),
            container_id: "ctr".into(),
            newuidmap: "newuidmap".into(),
            newgidmap: "newgidmap".into(),
        }
    }

    #[test]
    fn test_hook_state_fields() {
        let state = hook_state(&payload());
        assert_eq!(state["id"], "ctr");
        assert_eq!(state["status"], "created");
        assert_eq!(state["bundle"], "/run/bundle");
        assert!(state["pid"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_hook_receives_state_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("state.json");
        let script = dir.path().join("hook");
        std::fs::write(&script, format!("#!/bin/sh\ncat > {}\n", out.display())).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let hook = HookBuilder::default().path(&script).build().unwrap();
        run_hook(&hook, br#"{"id":"ctr"}"#).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), r#"{"id":"ctr"}"#);
    }

    #[test]
    fn test_hook_failure_and_timeout() {
        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()])
            .build()
            .unwrap();
        assert!(matches!(run_hook(&hook, b"{}"), Err(StageError::Hook { .. })));

        let hook = HookBuilder::default()
            .path("/bin/sh")
            .args(vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()])
            .timeout(1i64)
            .build()
            .unwrap();
        let started = Instant::now();
        assert!(run_hook(&hook, b"{}").is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_capability_conversion() {
        let set: Capabilities = [Capability::Chown, Capability::NetRaw].into_iter().collect();
        let converted = to_caps(&Some(set));
        assert!(converted.contains(&Cap::CAP_CHOWN));
        assert!(converted.contains(&Cap::CAP_NET_RAW));
        assert_eq!(converted.len(), 2);
    }
}
