//! Second stage: new namespaces, the mount tree, and the stdio relay for
//! the child stage.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, setns, unshare};
use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use oci_spec::runtime::{LinuxNamespaceType, Spec};

use super::binds::{self, UndoLog};
use super::relay::{self, Relay};
use super::{STAGE2_NAME, STAGE3_NAME, StageError, StageResult};
use crate::reexec;
use crate::util::process::{child_status_from_std, exit_like, set_parent_death_signal};

pub(super) fn main() -> i32 {
    super::stage_main(STAGE2_NAME, run)
}

fn clone_flag(typ: LinuxNamespaceType) -> Option<CloneFlags> {
    Some(match typ {
        LinuxNamespaceType::Mount => CloneFlags::CLONE_NEWNS,
        LinuxNamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
        LinuxNamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
        LinuxNamespaceType::Pid => CloneFlags::CLONE_NEWPID,
        LinuxNamespaceType::Network => CloneFlags::CLONE_NEWNET,
        LinuxNamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        // The grandparent already created the user namespace.
        _ => return None,
    })
}

/// Namespaces to create, and existing ones to join by path.
pub(super) fn namespace_plan(spec: &Spec) -> (CloneFlags, Vec<(CloneFlags, PathBuf)>) {
    let mut create = CloneFlags::empty();
    let mut join = Vec::new();
    let namespaces = spec.linux().as_ref().and_then(|l| l.namespaces().clone()).unwrap_or_default();
    for ns in namespaces {
        let Some(flag) = clone_flag(ns.typ()) else { continue };
        match ns.path() {
            Some(path) => join.push((flag, path.clone())),
            None => create |= flag,
        }
    }
    // The mount tree is always private to the run.
    create |= CloneFlags::CLONE_NEWNS;
    (create, join)
}

fn enter_namespaces(spec: &Spec) -> StageResult<CloneFlags> {
    let (create, join) = namespace_plan(spec);
    for (flag, path) in join {
        let file = File::open(&path).map_err(|e| StageError::io(format!("open {}", path.display()), e))?;
        setns(file.as_fd(), flag).map_err(|e| StageError::sys(format!("join {}", path.display()), e))?;
    }
    unshare(create).map_err(|e| StageError::sys("unshare namespaces", e))?;
    mount(None::<&str>, "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)
        .map_err(|e| StageError::sys("make mounts private", e))?;
    Ok(create)
}

/// Bring up `lo` in a fresh network namespace.
fn loopback_up() -> std::io::Result<()> {
    unsafe {
        let sock = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if sock < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let sock = OwnedFd::from_raw_fd(sock);
        let mut req: libc::ifreq = std::mem::zeroed();
        for (dst, src) in req.ifr_name.iter_mut().zip(b"lo\0") {
            *dst = *src as libc::c_char;
        }
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &req) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Puts the caller's terminal back the way it was.
struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    fn enable() -> Option<Self> {
        let stdin = std::io::stdin();
        let original = tcgetattr(stdin.as_fd()).ok()?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw).ok()?;
        Some(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = tcsetattr(std::io::stdin().as_fd(), SetArg::TCSANOW, &self.original);
    }
}

/// Child-side descriptors plus the relays that serve them.
struct StdioPlan {
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
    relays: Vec<Relay>,
    terminal: bool,
    /// Parent-side ends the relays read from or write to.
    _held: Vec<OwnedFd>,
}

fn chown_to_root(fd: &OwnedFd) {
    if let Err(e) = nix::unistd::fchown(fd.as_fd(), Some(0.into()), Some(0.into())) {
        tracing::debug!(error = %e, "Could not hand stdio to container root");
    }
}

fn dup(fd: &OwnedFd) -> StageResult<OwnedFd> {
    fd.try_clone().map_err(|e| StageError::io("duplicate descriptor", e))
}

fn terminal_stdio() -> StageResult<StdioPlan> {
    let (rows, cols) = crate::util::get_terminal_size();
    let size = nix::pty::Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = nix::pty::openpty(Some(&size), None).map_err(|e| StageError::sys("open terminal", e))?;
    chown_to_root(&pty.slave);
    let master = pty.master.as_raw_fd();
    let relays = vec![
        Relay::new("stdin", libc::STDIN_FILENO, master).optional(),
        Relay::new("terminal", master, libc::STDOUT_FILENO),
    ];
    Ok(StdioPlan {
        stdin: dup(&pty.slave)?,
        stdout: dup(&pty.slave)?,
        stderr: pty.slave,
        relays,
        terminal: true,
        _held: vec![pty.master],
    })
}

fn pipe() -> StageResult<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(|e| StageError::sys("stdio pipe", e))
}

fn pipe_stdio() -> StageResult<StdioPlan> {
    let (stdin_r, stdin_w) = pipe()?;
    let (stdout_r, stdout_w) = pipe()?;
    let (stderr_r, stderr_w) = pipe()?;
    for fd in [&stdin_r, &stdout_w, &stderr_w] {
        chown_to_root(fd);
    }
    let relays = vec![
        Relay::new("stdin", libc::STDIN_FILENO, stdin_w.as_raw_fd())
            .owning_sink(stdin_w)
            .optional(),
        Relay::new("stdout", stdout_r.as_raw_fd(), libc::STDOUT_FILENO),
        Relay::new("stderr", stderr_r.as_raw_fd(), libc::STDERR_FILENO),
    ];
    Ok(StdioPlan {
        stdin: stdin_r,
        stdout: stdout_w,
        stderr: stderr_w,
        relays,
        terminal: false,
        _held: vec![stdout_r, stderr_r],
    })
}

pub(super) fn rootfs(spec: &Spec) -> StageResult<PathBuf> {
    let root = spec
        .root()
        .as_ref()
        .ok_or_else(|| StageError::Setup("spec has no root".into()))?;
    let path = root.path();
    if !path.is_absolute() {
        return Err(StageError::Setup(format!("rootfs {} is not absolute", path.display())));
    }
    Ok(path.to_path_buf())
}

fn setup(spec: &Spec, root: &Path, log: &mut UndoLog) -> StageResult<()> {
    let created = enter_namespaces(spec)?;
    if created.contains(CloneFlags::CLONE_NEWUTS) {
        if let Some(hostname) = spec.hostname().as_deref().filter(|h| !h.is_empty()) {
            nix::unistd::sethostname(hostname).map_err(|e| StageError::sys("set hostname", e))?;
        }
    }
    if created.contains(CloneFlags::CLONE_NEWNET) {
        if let Err(e) = loopback_up() {
            tracing::warn!(error = %e, "Failed to bring up loopback");
        }
    }
    let mounts = spec.mounts().clone().unwrap_or_default();
    binds::mount_all(root, &mounts, log)
}

fn run() -> StageResult<i32> {
    let payload = super::read_payload()?;
    let root = rootfs(&payload.spec)?;
    let mut log = UndoLog::default();
    if let Err(e) = setup(&payload.spec, &root, &mut log) {
        log.unwind();
        return Err(e);
    }

    let terminal = payload.spec.process().as_ref().is_some_and(|p| p.terminal().unwrap_or(false));
    let plan = if terminal { terminal_stdio() } else { pipe_stdio() };
    let plan = match plan {
        Ok(plan) => plan,
        Err(e) => {
            log.unwind();
            return Err(e);
        }
    };
    let StdioPlan {
        stdin,
        stdout,
        stderr,
        mut relays,
        terminal,
        _held,
    } = plan;

    let mut command = reexec::command(STAGE3_NAME);
    command
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    unsafe {
        command.pre_exec(move || {
            set_parent_death_signal()?;
            if terminal {
                if libc::setsid() < 0 || libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    let mut child = match super::spawn_stage(command, &payload) {
        Ok(child) => child,
        Err(e) => {
            log.unwind();
            return Err(e);
        }
    };
    super::forward_signals(child.id())?;

    let raw_mode = if terminal && nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false) {
        RawModeGuard::enable()
    } else {
        None
    };
    if let Err(e) = relay::pump(&mut relays) {
        tracing::warn!(error = %e, "Stdio relay failed");
    }
    let status = child.wait().map_err(|e| StageError::io("waiting for child stage", e));
    drop(raw_mode);
    drop(relays);
    drop(_held);

    let errors = log.unwind();
    if !errors.is_empty() {
        tracing::warn!(count = errors.len(), "Mount cleanup reported errors");
    }
    exit_like(child_status_from_std(status?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{LinuxBuilder, LinuxNamespaceBuilder, SpecBuilder};

    #[test]
    fn test_namespace_plan() {
        let ns = |typ, path: Option<&str>| {
            let mut b = LinuxNamespaceBuilder::default().typ(typ);
            if let Some(p) = path {
                b = b.path(p);
            }
            b.build().unwrap()
        };
        let linux = LinuxBuilder::default()
            .namespaces(vec![
                ns(LinuxNamespaceType::User, None),
                ns(LinuxNamespaceType::Pid, None),
                ns(LinuxNamespaceType::Uts, None),
                ns(LinuxNamespaceType::Network, Some("/run/netns/build")),
            ])
            .build()
            .unwrap();
        let spec = SpecBuilder::default().linux(linux).build().unwrap();

        let (create, join) = namespace_plan(&spec);
        assert_eq!(
            create,
            CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWNS
        );
        assert_eq!(join, vec![(CloneFlags::CLONE_NEWNET, PathBuf::from("/run/netns/build"))]);
    }

    #[test]
    fn test_pipe_stdio_relays() {
        let plan = pipe_stdio().unwrap();
        assert!(!plan.terminal);
        assert_eq!(plan.relays.len(), 3);
    }
}
