//! Builds the command's mount tree inside the rootfs and records what it
//! changed on disk so the parent can put it back afterwards.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, symlink};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::statvfs::{FsFlags, statvfs};
use oci_spec::runtime::Mount;

use super::{StageError, StageResult};
use crate::util::fs::secure_join;

/// Mount flags and filesystem data from an OCI option list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MountOptions {
    pub flags: MsFlags,
    pub clear: MsFlags,
    pub propagation: MsFlags,
    pub bind: bool,
    pub recursive: bool,
    pub data: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            flags: MsFlags::empty(),
            clear: MsFlags::empty(),
            propagation: MsFlags::empty(),
            bind: false,
            recursive: false,
            data: Vec::new(),
        }
    }
}

impl MountOptions {
    fn data(&self) -> Option<String> {
        (!self.data.is_empty()).then(|| self.data.join(","))
    }

    /// Flags that need a remount to take effect on a bind mount.
    fn remount_flags(&self) -> MsFlags {
        self.flags
            & (MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_NOATIME
                | MsFlags::MS_NODIRATIME
                | MsFlags::MS_RELATIME
                | MsFlags::MS_STRICTATIME)
    }
}

pub(crate) fn parse_options(options: &[String]) -> MountOptions {
    let mut out = MountOptions::default();
    for option in options {
        let (set, clear, propagation) = match option.as_str() {
            "ro" => (MsFlags::MS_RDONLY, MsFlags::empty(), MsFlags::empty()),
            "rw" => (MsFlags::empty(), MsFlags::MS_RDONLY, MsFlags::empty()),
            "nosuid" => (MsFlags::MS_NOSUID, MsFlags::empty(), MsFlags::empty()),
            "suid" => (MsFlags::empty(), MsFlags::MS_NOSUID, MsFlags::empty()),
            "nodev" => (MsFlags::MS_NODEV, MsFlags::empty(), MsFlags::empty()),
            "dev" => (MsFlags::empty(), MsFlags::MS_NODEV, MsFlags::empty()),
            "noexec" => (MsFlags::MS_NOEXEC, MsFlags::empty(), MsFlags::empty()),
            "exec" => (MsFlags::empty(), MsFlags::MS_NOEXEC, MsFlags::empty()),
            "sync" => (MsFlags::MS_SYNCHRONOUS, MsFlags::empty(), MsFlags::empty()),
            "async" => (MsFlags::empty(), MsFlags::MS_SYNCHRONOUS, MsFlags::empty()),
            "dirsync" => (MsFlags::MS_DIRSYNC, MsFlags::empty(), MsFlags::empty()),
            "noatime" => (MsFlags::MS_NOATIME, MsFlags::empty(), MsFlags::empty()),
            "atime" => (MsFlags::empty(), MsFlags::MS_NOATIME, MsFlags::empty()),
            "nodiratime" => (MsFlags::MS_NODIRATIME, MsFlags::empty(), MsFlags::empty()),
            "diratime" => (MsFlags::empty(), MsFlags::MS_NODIRATIME, MsFlags::empty()),
            "relatime" => (MsFlags::MS_RELATIME, MsFlags::empty(), MsFlags::empty()),
            "norelatime" => (MsFlags::empty(), MsFlags::MS_RELATIME, MsFlags::empty()),
            "strictatime" => (MsFlags::MS_STRICTATIME, MsFlags::empty(), MsFlags::empty()),
            "private" => (MsFlags::empty(), MsFlags::empty(), MsFlags::MS_PRIVATE),
            "rprivate" => (MsFlags::empty(), MsFlags::empty(), MsFlags::MS_PRIVATE | MsFlags::MS_REC),
            "shared" => (MsFlags::empty(), MsFlags::empty(), MsFlags::MS_SHARED),
            "rshared" => (MsFlags::empty(), MsFlags::empty(), MsFlags::MS_SHARED | MsFlags::MS_REC),
            "slave" => (MsFlags::empty(), MsFlags::empty(), MsFlags::MS_SLAVE),
            "rslave" => (MsFlags::empty(), MsFlags::empty(), MsFlags::MS_SLAVE | MsFlags::MS_REC),
            "unbindable" => (MsFlags::empty(), MsFlags::empty(), MsFlags::MS_UNBINDABLE),
            "runbindable" => (MsFlags::empty(), MsFlags::empty(), MsFlags::MS_UNBINDABLE | MsFlags::MS_REC),
            "bind" => {
                out.bind = true;
                continue;
            }
            "rbind" => {
                out.bind = true;
                out.recursive = true;
                continue;
            }
            // SELinux relabel requests were handled when the mount was planned.
            "z" | "Z" => continue,
            other => {
                out.data.push(other.to_string());
                continue;
            }
        };
        out.flags = (out.flags | set) - clear;
        out.clear = (out.clear | clear) - set;
        out.propagation |= propagation;
    }
    out
}

/// Flags the kernel will not let a user namespace clear on a remount.
fn locked_flags(path: &Path) -> MsFlags {
    let Ok(stat) = statvfs(path) else {
        return MsFlags::empty();
    };
    let fs = stat.flags();
    let mut flags = MsFlags::empty();
    for (f, m) in [
        (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if fs.contains(f) {
            flags |= m;
        }
    }
    flags
}

#[derive(Debug, PartialEq, Eq)]
enum Undo {
    Unmount(PathBuf),
    Remove(PathBuf),
    Restore { aside: PathBuf, original: PathBuf },
}

/// Filesystem changes to reverse, newest first.
#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    entries: Vec<Undo>,
}

impl UndoLog {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn unmount(&mut self, path: &Path) {
        self.entries.push(Undo::Unmount(path.to_path_buf()));
    }

    fn remove(&mut self, path: &Path) {
        self.entries.push(Undo::Remove(path.to_path_buf()));
    }

    /// Reverse everything. Unmounts are lazy so busy mounts still detach.
    pub(crate) fn unwind(mut self) -> Vec<StageError> {
        let mut errors = Vec::new();
        while let Some(entry) = self.entries.pop() {
            let result = match &entry {
                Undo::Unmount(path) => match umount2(path.as_path(), MntFlags::MNT_DETACH) {
                    Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
                    Err(e) => Err(StageError::sys(format!("unmount {}", path.display()), e)),
                },
                Undo::Remove(path) => {
                    let removed = match fs::symlink_metadata(path) {
                        Ok(meta) if meta.is_dir() => fs::remove_dir(path),
                        Ok(_) => fs::remove_file(path),
                        Err(e) => Err(e),
                    };
                    match removed {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(StageError::io(format!("remove {}", path.display()), e)),
                    }
                }
                Undo::Restore { aside, original } => fs::rename(aside, original)
                    .map_err(|e| StageError::io(format!("restore {}", original.display()), e)),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to undo mount setup");
                errors.push(e);
            }
        }
        errors
    }
}

fn setup_error(e: impl std::fmt::Display) -> StageError {
    StageError::Setup(e.to_string())
}

fn create_placeholder(path: &Path, dir: bool) -> StageResult<()> {
    let result = if dir {
        fs::DirBuilder::new().mode(0o755).create(path)
    } else {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)
            .map(|_| ())
    };
    result.map_err(|e| StageError::io(format!("create {}", path.display()), e))
}

/// Resolve `destination` inside `rootfs` and make sure something of the
/// right kind exists there. A file standing where a directory is needed
/// (or the reverse) is renamed aside and restored later.
pub(crate) fn ensure_target(rootfs: &Path, destination: &Path, dir: bool, log: &mut UndoLog) -> StageResult<PathBuf> {
    let target = secure_join(rootfs, destination).map_err(setup_error)?;

    let mut missing = Vec::new();
    let mut cursor = target.parent();
    while let Some(p) = cursor {
        if p == rootfs || fs::symlink_metadata(p).is_ok() {
            break;
        }
        missing.push(p.to_path_buf());
        cursor = p.parent();
    }
    for p in missing.into_iter().rev() {
        create_placeholder(&p, true)?;
        log.remove(&p);
    }

    match fs::symlink_metadata(&target) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_placeholder(&target, dir)?;
            log.remove(&target);
        }
        Err(e) => return Err(StageError::io(format!("inspect {}", target.display()), e)),
        Ok(meta) if meta.is_dir() == dir && !meta.file_type().is_symlink() => {}
        Ok(_) => {
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let aside = target.with_file_name(format!(".{}.stevedore-{}", name, crate::util::random_id()));
            fs::rename(&target, &aside).map_err(|e| StageError::io(format!("move aside {}", target.display()), e))?;
            log.entries.push(Undo::Restore {
                aside,
                original: target.clone(),
            });
            create_placeholder(&target, dir)?;
            log.remove(&target);
        }
    }
    Ok(target)
}

fn bind(source: &Path, target: &Path, opts: &MountOptions) -> StageResult<()> {
    let mut flags = MsFlags::MS_BIND;
    if opts.recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>)
        .map_err(|e| StageError::sys(format!("bind {} to {}", source.display(), target.display()), e))?;

    let wanted = opts.remount_flags();
    if !wanted.is_empty() {
        let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | wanted | locked_flags(source);
        if let Err(e) = mount(None::<&str>, target, None::<&str>, flags, None::<&str>) {
            if wanted.contains(MsFlags::MS_RDONLY) {
                return Err(StageError::sys(format!("remount {} read-only", target.display()), e));
            }
            tracing::warn!(target = %target.display(), error = %e, "Failed to apply bind mount flags");
        }
    }
    Ok(())
}

fn propagate(target: &Path, opts: &MountOptions) -> StageResult<()> {
    if opts.propagation.is_empty() {
        return Ok(());
    }
    mount(None::<&str>, target, None::<&str>, opts.propagation, None::<&str>)
        .map_err(|e| StageError::sys(format!("set propagation on {}", target.display()), e))
}

/// Devices bound from the host into a fresh `/dev`.
const DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

fn populate_dev(dev: &Path) -> StageResult<()> {
    for name in DEVICES {
        let host = Path::new("/dev").join(name);
        if !host.exists() {
            continue;
        }
        let node = dev.join(name);
        if !node.exists() {
            create_placeholder(&node, false)?;
        }
        mount(Some(&host), &node, None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .map_err(|e| StageError::sys(format!("bind {}", host.display()), e))?;
    }
    for (link, to) in [
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
        ("ptmx", "pts/ptmx"),
        ("core", "/proc/kcore"),
    ] {
        let path = dev.join(link);
        if fs::symlink_metadata(&path).is_err() {
            symlink(to, &path).map_err(|e| StageError::io(format!("link {}", path.display()), e))?;
        }
    }
    Ok(())
}

/// Host path to bind when a filesystem type cannot be mounted fresh.
fn host_fallback(typ: &str) -> Option<&'static str> {
    match typ {
        "sysfs" => Some("/sys"),
        "cgroup" | "cgroup2" => Some("/sys/fs/cgroup"),
        "proc" => Some("/proc"),
        "devpts" => Some("/dev/pts"),
        _ => None,
    }
}

fn mount_filesystem(m: &Mount, target: &Path, opts: &MountOptions) -> StageResult<()> {
    let typ = m.typ().as_deref().unwrap_or("none");
    let source = m
        .source()
        .as_ref()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| typ.to_string());
    let data = opts.data();
    match mount(Some(source.as_str()), target, Some(typ), opts.flags, data.as_deref()) {
        Ok(()) => Ok(()),
        Err(e @ (Errno::EPERM | Errno::EINVAL | Errno::EACCES)) => {
            let Some(host) = host_fallback(typ) else {
                if typ == "mqueue" {
                    tracing::warn!(target = %target.display(), error = %e, "Skipping mqueue mount");
                    return Ok(());
                }
                return Err(StageError::sys(format!("mount {} on {}", typ, target.display()), e));
            };
            tracing::debug!(typ, host, error = %e, "Binding host filesystem instead");
            let fallback = MountOptions {
                bind: true,
                recursive: true,
                flags: opts.flags | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                ..MountOptions::default()
            };
            bind(Path::new(host), target, &fallback)
        }
        Err(e) => Err(StageError::sys(format!("mount {} on {}", typ, target.display()), e)),
    }
}

fn depth(m: &Mount) -> usize {
    m.destination().components().count()
}

/// Mount everything except `proc`, whose target is only prepared because
/// it must be mounted from inside the new PID namespace.
pub(crate) fn mount_all(rootfs: &Path, mounts: &[Mount], log: &mut UndoLog) -> StageResult<()> {
    let mut ordered: Vec<&Mount> = mounts.iter().collect();
    ordered.sort_by_key(|m| depth(m));

    for m in ordered {
        let opts = parse_options(m.options().as_deref().unwrap_or_default());
        let typ = m.typ().as_deref().unwrap_or("");
        let is_bind = opts.bind || typ == "bind";

        if is_bind {
            let source = m
                .source()
                .as_ref()
                .ok_or_else(|| StageError::Setup(format!("bind mount {} has no source", m.destination().display())))?;
            let is_dir = fs::metadata(source)
                .map_err(|e| StageError::io(format!("bind source {}", source.display()), e))?
                .is_dir();
            let target = ensure_target(rootfs, m.destination(), is_dir, log)?;
            let opts = MountOptions { bind: true, ..opts };
            bind(source, &target, &opts)?;
            log.unmount(&target);
            propagate(&target, &opts)?;
            continue;
        }

        let target = ensure_target(rootfs, m.destination(), true, log)?;
        if typ == "proc" {
            continue;
        }
        mount_filesystem(m, &target, &opts)?;
        log.unmount(&target);
        propagate(&target, &opts)?;
        if m.destination() == Path::new("/dev") {
            populate_dev(&target)?;
        }
    }
    Ok(())
}

/// Mount `proc` filesystems; run from inside the new PID namespace.
pub(crate) fn mount_proc(rootfs: &Path, mounts: &[Mount]) -> StageResult<()> {
    for m in mounts.iter().filter(|m| m.typ().as_deref() == Some("proc")) {
        let target = secure_join(rootfs, m.destination()).map_err(setup_error)?;
        let opts = parse_options(m.options().as_deref().unwrap_or_default());
        mount_filesystem(m, &target, &opts)?;
    }
    Ok(())
}

/// Hide `paths` inside `rootfs`: directories under an empty read-only
/// tmpfs, everything else under `/dev/null`. Missing paths are skipped.
pub(crate) fn mask_paths(rootfs: &Path, paths: &[String]) -> StageResult<()> {
    for path in paths {
        let target = secure_join(rootfs, Path::new(path)).map_err(setup_error)?;
        let Ok(meta) = fs::metadata(&target) else { continue };
        let result = if meta.is_dir() {
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::MS_RDONLY,
                Some("size=0"),
            )
        } else {
            mount(Some("/dev/null"), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        };
        match result {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(e) => return Err(StageError::sys(format!("mask {}", path), e)),
        }
    }
    Ok(())
}

/// Make `paths` inside `rootfs` read-only. Missing paths are skipped.
pub(crate) fn readonly_paths(rootfs: &Path, paths: &[String]) -> StageResult<()> {
    let opts = MountOptions {
        bind: true,
        recursive: true,
        flags: MsFlags::MS_RDONLY,
        ..MountOptions::default()
    };
    for path in paths {
        let target = secure_join(rootfs, Path::new(path)).map_err(setup_error)?;
        if fs::symlink_metadata(&target).is_err() {
            continue;
        }
        match bind(&target, &target, &opts) {
            Ok(()) => {}
            Err(StageError::Sys { source: Errno::ENOENT, .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(list: &[&str]) -> MountOptions {
        parse_options(&list.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_parse_options() {
        let o = opts(&["rbind", "ro", "nosuid", "rprivate", "mode=755", "size=64m"]);
        assert!(o.bind && o.recursive);
        assert!(o.flags.contains(MsFlags::MS_RDONLY | MsFlags::MS_NOSUID));
        assert_eq!(o.propagation, MsFlags::MS_PRIVATE | MsFlags::MS_REC);
        assert_eq!(o.data(), Some("mode=755,size=64m".to_string()));

        let o = opts(&["ro", "rw", "Z"]);
        assert!(!o.flags.contains(MsFlags::MS_RDONLY));
        assert!(o.clear.contains(MsFlags::MS_RDONLY));
        assert!(o.data.is_empty());
    }

    #[test]
    fn test_ensure_target_creates_and_unwinds() {
        let root = tempfile::tempdir().unwrap();
        let mut log = UndoLog::default();
        let target = ensure_target(root.path(), Path::new("/run/secrets/token"), false, &mut log).unwrap();
        assert!(target.is_file());
        assert_eq!(log.len(), 3);

        assert!(log.unwind().is_empty());
        assert!(!root.path().join("run").exists());
    }

    #[test]
    fn test_ensure_target_moves_mismatch_aside() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/conf"), "original").unwrap();

        let mut log = UndoLog::default();
        let target = ensure_target(root.path(), Path::new("/etc/conf"), true, &mut log).unwrap();
        assert!(target.is_dir());
        assert!(log.unwind().is_empty());
        assert_eq!(fs::read_to_string(root.path().join("etc/conf")).unwrap(), "original");
        assert_eq!(fs::read_dir(root.path().join("etc")).unwrap().count(), 1);
    }

    #[test]
    fn test_ensure_target_keeps_matching() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("tmp")).unwrap();
        let mut log = UndoLog::default();
        ensure_target(root.path(), Path::new("/tmp"), true, &mut log).unwrap();
        assert_eq!(log.len(), 0);
    }
}
