//! First stage: raise limits, start the parent in its own user namespace
//! and map its IDs from outside.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::fcntl::OFlag;
use oci_spec::runtime::{LinuxIdMapping, LinuxNamespaceType, Spec};

use super::{STAGE1_NAME, STAGE2_NAME, StageError, StagePayload, StageResult};
use crate::reexec;
use crate::run::spec::rlimits;
use crate::util::process::{child_status_from_std, exit_like};

pub(super) fn main() -> i32 {
    super::stage_main(STAGE1_NAME, run)
}

/// Whether the spec asks for a new user namespace.
fn wants_user_namespace(spec: &Spec) -> StageResult<bool> {
    let Some(linux) = spec.linux() else { return Ok(false) };
    for ns in linux.namespaces().iter().flatten() {
        if ns.typ() == LinuxNamespaceType::User {
            if ns.path().is_some() {
                return Err(StageError::Setup(
                    "joining an existing user namespace is not supported with chroot isolation".into(),
                ));
            }
            return Ok(true);
        }
    }
    Ok(false)
}

fn format_map(maps: &[LinuxIdMapping]) -> String {
    maps.iter()
        .map(|m| format!("{} {} {}\n", m.container_id(), m.host_id(), m.size()))
        .collect()
}

fn map_args(pid: u32, maps: &[LinuxIdMapping]) -> Vec<String> {
    let mut args = vec![pid.to_string()];
    for m in maps {
        args.extend([m.container_id().to_string(), m.host_id().to_string(), m.size().to_string()]);
    }
    args
}

/// Our own ID mapped onto container root, the one map an unprivileged
/// process may write without help.
fn is_self_map(maps: &[LinuxIdMapping], own: u32) -> bool {
    matches!(maps, [m] if m.host_id() == own && m.size() == 1)
}

fn write_file(path: String, content: &str) -> StageResult<()> {
    std::fs::write(&path, content).map_err(|e| StageError::io(format!("write {}", path), e))
}

fn run_helper(binary: &str, args: &[String]) -> StageResult<()> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .map_err(|e| StageError::io(format!("run {}", binary), e))?;
    if !output.status.success() {
        return Err(StageError::Setup(format!(
            "{} failed: {}",
            binary,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Write uid/gid maps for `pid`, directly when privileged and through
/// newuidmap/newgidmap otherwise.
fn write_id_maps(pid: u32, payload: &StagePayload) -> StageResult<()> {
    let linux = payload.spec.linux().as_ref();
    let uid_maps = linux.and_then(|l| l.uid_mappings().clone()).unwrap_or_default();
    let gid_maps = linux.and_then(|l| l.gid_mappings().clone()).unwrap_or_default();
    if uid_maps.is_empty() || gid_maps.is_empty() {
        return Err(StageError::Setup("user namespace requested without ID mappings".into()));
    }

    if nix::unistd::geteuid().is_root() {
        write_file(format!("/proc/{}/uid_map", pid), &format_map(&uid_maps))?;
        return write_file(format!("/proc/{}/gid_map", pid), &format_map(&gid_maps));
    }

    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    match crate::util::find_binary(&payload.newuidmap) {
        Ok(path) => run_helper(&path.to_string_lossy(), &map_args(pid, &uid_maps))?,
        Err(_) if is_self_map(&uid_maps, uid) => {
            write_file(format!("/proc/{}/uid_map", pid), &format_map(&uid_maps))?
        }
        Err(e) => return Err(StageError::Setup(e.to_string())),
    }
    match crate::util::find_binary(&payload.newgidmap) {
        Ok(path) => run_helper(&path.to_string_lossy(), &map_args(pid, &gid_maps)),
        Err(_) if is_self_map(&gid_maps, gid) => {
            write_file(format!("/proc/{}/setgroups", pid), "deny")?;
            write_file(format!("/proc/{}/gid_map", pid), &format_map(&gid_maps))
        }
        Err(e) => Err(StageError::Setup(e.to_string())),
    }
}

/// Pipes between the new process, which unshares its user namespace in
/// `pre_exec` and waits, and a helper thread here that maps it.
struct MapSync {
    /// Child writes its pid here after unsharing.
    ready_read: OwnedFd,
    ready_write: OwnedFd,
    /// Child waits for one byte here before becoming root.
    go_read: OwnedFd,
    go_write: OwnedFd,
}

impl MapSync {
    fn new() -> StageResult<Self> {
        let (ready_read, ready_write) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| StageError::sys("sync pipe", e))?;
        let (go_read, go_write) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| StageError::sys("sync pipe", e))?;
        Ok(Self {
            ready_read,
            ready_write,
            go_read,
            go_write,
        })
    }

    /// Only async-signal-safe calls run between fork and exec.
    fn install(&self, command: &mut Command) {
        let ready = self.ready_write.as_raw_fd();
        let go = self.go_read.as_raw_fd();
        let ours = [self.ready_read.as_raw_fd(), self.go_write.as_raw_fd()];
        unsafe {
            command.pre_exec(move || {
                // Our copy of the release pipe's write end would keep the
                // read below from ever seeing EOF.
                for fd in ours {
                    libc::close(fd);
                }
                if libc::unshare(libc::CLONE_NEWUSER) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let pid = libc::getpid().to_ne_bytes();
                if libc::write(ready, pid.as_ptr().cast(), pid.len()) != pid.len() as isize {
                    return Err(std::io::Error::last_os_error());
                }
                let mut byte = 0u8;
                if libc::read(go, (&mut byte as *mut u8).cast(), 1) != 1 {
                    return Err(std::io::Error::from_raw_os_error(libc::EPERM));
                }
                if libc::setresgid(0, 0, 0) != 0 || libc::setresuid(0, 0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
}

fn spawn_parent(payload: &StagePayload) -> StageResult<std::process::Child> {
    let mut command = reexec::command(STAGE2_NAME);
    if !wants_user_namespace(&payload.spec)? {
        return super::spawn_stage(command, payload);
    }

    let sync = MapSync::new()?;
    sync.install(&mut command);
    let MapSync {
        ready_read,
        ready_write,
        go_read,
        go_write,
    } = sync;

    let mapper_payload = payload.clone();
    let mapper = std::thread::spawn(move || -> StageResult<()> {
        let mut ready = std::fs::File::from(ready_read);
        let mut buf = [0u8; 4];
        ready
            .read_exact(&mut buf)
            .map_err(|e| StageError::io("waiting for user namespace", e))?;
        let pid = i32::from_ne_bytes(buf) as u32;
        write_id_maps(pid, &mapper_payload)?;
        std::fs::File::from(go_write)
            .write_all(&[1])
            .map_err(|e| StageError::io("releasing parent stage", e))
    });

    let spawned = super::spawn_stage(command, payload);
    // The child holds its own copies now; closing ours lets the mapper see
    // EOF if the child never got as far as unsharing.
    drop(ready_write);
    drop(go_read);
    let mapped = mapper
        .join()
        .map_err(|_| StageError::Setup("ID mapping thread panicked".into()))?;
    let child = spawned?;
    mapped?;
    Ok(child)
}

fn run() -> StageResult<i32> {
    let payload = super::read_payload()?;
    if let Some(limits) = payload.spec.process().as_ref().and_then(|p| p.rlimits().as_ref()) {
        rlimits::raise_limits(limits);
    }

    let mut child = spawn_parent(&payload)?;
    super::forward_signals(child.id())?;
    let status = child.wait().map_err(|e| StageError::io("waiting for parent stage", e))?;
    exit_like(child_status_from_std(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::LinuxIdMappingBuilder;

    fn map(c: u32, h: u32, s: u32) -> LinuxIdMapping {
        LinuxIdMappingBuilder::default()
            .container_id(c)
            .host_id(h)
            .size(s)
            .build()
            .unwrap()
    }

    #[test]
    fn test_map_formats() {
        let maps = vec![map(0, 1000, 1), map(1, 100000, 65536)];
        assert_eq!(format_map(&maps), "0 1000 1\n1 100000 65536\n");
        assert_eq!(map_args(42, &maps), vec!["42", "0", "1000", "1", "1", "100000", "65536"]);
    }

    #[test]
    fn test_self_map() {
        assert!(is_self_map(&[map(0, 1000, 1)], 1000));
        assert!(!is_self_map(&[map(0, 1000, 1)], 1001));
        assert!(!is_self_map(&[map(0, 1000, 1), map(1, 100000, 10)], 1000));
    }

    fn spec_with(ns: oci_spec::runtime::LinuxNamespace) -> Spec {
        let linux = oci_spec::runtime::LinuxBuilder::default()
            .namespaces(vec![ns])
            .build()
            .unwrap();
        oci_spec::runtime::SpecBuilder::default().linux(linux).build().unwrap()
    }

    #[test]
    fn test_user_namespace_request() {
        use oci_spec::runtime::LinuxNamespaceBuilder;
        let fresh = LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::User)
            .build()
            .unwrap();
        assert!(wants_user_namespace(&spec_with(fresh)).unwrap());

        let joined = LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::User)
            .path("/proc/1/ns/user")
            .build()
            .unwrap();
        assert!(wants_user_namespace(&spec_with(joined)).is_err());

        let pid_only = LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Pid)
            .build()
            .unwrap();
        assert!(!wants_user_namespace(&spec_with(pid_only)).unwrap());
    }
}
