//! Streaming tar applier.
//!
//! Unpacks a layer (or an `add`ed archive) into a directory:
//! - OCI whiteouts (`.wh.<name>`, `.wh..wh..opq`) delete lower content inline
//! - hard links whose target appears later in the stream are deferred
//! - directory permissions and times are applied deepest-first at the end
//! - ownership is translated through the container's ID mappings, or
//!   forced to a fixed pair for `add --chown`

use std::collections::HashSet;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::{FileTime, set_file_times, set_symlink_file_times};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tar::{Archive, Entry, EntryType};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::archive::compression::decompressed_reader;
use crate::idtools::IdMappings;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Options controlling how entries land on disk.
#[derive(Clone, Debug, Default)]
pub struct ApplyOptions {
    /// Container-to-host ID translation for entry ownership.
    pub id_mappings: IdMappings,
    /// Force every entry to this container (uid, gid).
    pub chown: Option<(u32, u32)>,
    /// Force every file's permission bits.
    pub chmod: Option<u32>,
    /// Skip whiteout interpretation (plain archives passed to `add`).
    pub ignore_whiteouts: bool,
}

/// Summary of an apply run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub entries: u64,
    pub bytes: u64,
}

/// Apply a possibly compressed tar stream into `dest`.
pub fn apply_layer<R: Read>(
    reader: R,
    dest: &Path,
    options: &ApplyOptions,
) -> StevedoreResult<ApplyStats> {
    let (compression, reader) = decompressed_reader(reader)?;
    trace!(compression = compression.as_str(), dest = %dest.display(), "Applying tar stream");
    Applier::new(dest, options)?.apply(reader)
}

/// Apply a tar file from disk into `dest`.
pub fn apply_layer_file(
    tarball: &Path,
    dest: &Path,
    options: &ApplyOptions,
) -> StevedoreResult<ApplyStats> {
    let file = fs::File::open(tarball).map_err(|e| {
        StevedoreError::Storage(format!(
            "Failed to open layer tarball {}: {}",
            tarball.display(),
            e
        ))
    })?;
    apply_layer(file, dest, options)
}

struct PendingDir {
    path: PathBuf,
    mode: u32,
    mtime: u64,
}

struct PendingHardlink {
    link: PathBuf,
    /// Normalized path of the target, relative to the root.
    target: PathBuf,
    mode: u32,
    mtime: u64,
    owner: (u32, u32),
}

struct Applier<'a> {
    dest: PathBuf,
    options: &'a ApplyOptions,
    privileged: bool,
    unpacked: HashSet<PathBuf>,
    pending_dirs: Vec<PendingDir>,
    pending_links: Vec<PendingHardlink>,
    stats: ApplyStats,
}

impl<'a> Applier<'a> {
    fn new(dest: &Path, options: &'a ApplyOptions) -> StevedoreResult<Self> {
        fs::create_dir_all(dest).map_err(|e| {
            StevedoreError::Storage(format!(
                "Failed to create destination directory {}: {}",
                dest.display(),
                e
            ))
        })?;
        Ok(Self {
            dest: dest.to_path_buf(),
            options,
            privileged: nix::unistd::geteuid().is_root(),
            unpacked: HashSet::new(),
            pending_dirs: Vec::new(),
            pending_links: Vec::new(),
            stats: ApplyStats::default(),
        })
    }

    fn apply<R: Read>(mut self, reader: R) -> StevedoreResult<ApplyStats> {
        let mut archive = Archive::new(reader);
        let entries = archive
            .entries()
            .map_err(|e| StevedoreError::Storage(format!("Tar read entries error: {}", e)))?;

        for entry in entries {
            let mut entry =
                entry.map_err(|e| StevedoreError::Storage(format!("Tar read entry error: {}", e)))?;
            self.unpack_entry(&mut entry)?;
        }

        self.finish_hardlinks()?;
        self.finish_dirs()?;
        Ok(self.stats)
    }

    fn unpack_entry<R: Read>(&mut self, entry: &mut Entry<R>) -> StevedoreResult<()> {
        let raw_path = entry
            .path()
            .map_err(|e| StevedoreError::Storage(format!("Tar parse header path error: {}", e)))?
            .into_owned();
        let Some(relative) = normalize_entry_path(&raw_path) else {
            debug!(path = %raw_path.display(), "Skipping path outside root");
            return Ok(());
        };
        if relative.as_os_str().is_empty() {
            return Ok(());
        }

        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = self
            .options
            .chmod
            .filter(|_| entry_type != EntryType::Directory)
            .unwrap_or_else(|| header.mode().unwrap_or(0o755));
        let mtime = header.mtime().unwrap_or(0);
        let owner = self.entry_owner(
            header.uid().unwrap_or(0) as u32,
            header.gid().unwrap_or(0) as u32,
        )?;
        let device = (
            header.device_major().ok().flatten().unwrap_or(0),
            header.device_minor().ok().flatten().unwrap_or(0),
        );
        let Resolved { path, parent_is_dir } = resolve_in_root(&self.dest, &relative)?;

        if entry_type == EntryType::XGlobalHeader || entry_type == EntryType::XHeader {
            return Ok(());
        }
        if !self.options.ignore_whiteouts && self.handle_whiteout(&path, parent_is_dir, entry_type)? {
            return Ok(());
        }

        self.stats.entries += 1;
        self.stats.bytes = self
            .stats
            .bytes
            .saturating_add(header.size().unwrap_or(0));

        ensure_parent_dirs(&path, &self.dest)?;
        remove_existing(&path, entry_type)?;
        let xattrs = read_xattrs(entry)?;

        match entry_type {
            EntryType::Directory => {
                if !path.is_dir() {
                    fs::create_dir(&path).map_err(|e| {
                        StevedoreError::Storage(format!(
                            "Failed to create dir {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                }
                self.set_owner(&path, owner)?;
                apply_xattrs(&path, &xattrs, entry_type, self.privileged)?;
                self.pending_dirs.push(PendingDir {
                    path: path.clone(),
                    mode,
                    mtime,
                });
                self.unpacked.insert(path);
                return Ok(());
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                write_regular_file(entry, &path, mode)?
            }
            EntryType::Link => {
                let target_name = entry
                    .link_name()
                    .map_err(|e| {
                        StevedoreError::Storage(format!("Tar read link name error: {}", e))
                    })?
                    .map(|p| p.into_owned())
                    .ok_or_else(|| {
                        StevedoreError::Storage(format!(
                            "Hardlink without target: {}",
                            raw_path.display()
                        ))
                    })?;
                let target = normalize_entry_path(&target_name).ok_or_else(|| {
                    StevedoreError::Image(format!(
                        "Hardlink target escapes root: {}",
                        target_name.display()
                    ))
                })?;
                let resolved = resolve_in_root(&self.dest, &target)?;
                if !resolved.exists() {
                    trace!(link = %path.display(), target = %resolved.path.display(), "Deferring hardlink");
                    self.pending_links.push(PendingHardlink {
                        link: path.clone(),
                        target,
                        mode,
                        mtime,
                        owner,
                    });
                    self.unpacked.insert(path);
                    return Ok(());
                }
                make_hardlink(&path, &resolved.path)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| {
                        StevedoreError::Storage(format!("Tar read link name error: {}", e))
                    })?
                    .map(|p| p.into_owned())
                    .ok_or_else(|| {
                        StevedoreError::Storage(format!(
                            "Symlink without target: {}",
                            raw_path.display()
                        ))
                    })?;
                std::os::unix::fs::symlink(&target, &path).map_err(|e| {
                    StevedoreError::Storage(format!(
                        "Failed to create symlink {} -> {}: {}",
                        path.display(),
                        target.display(),
                        e
                    ))
                })?;
            }
            EntryType::Block | EntryType::Char => {
                if !self.privileged {
                    trace!(path = %path.display(), "Skipping device node (requires root)");
                    return Ok(());
                }
                make_device(&path, entry_type, mode, device.0, device.1)?;
            }
            EntryType::Fifo => make_fifo(&path, mode)?,
            other => {
                return Err(StevedoreError::Image(format!(
                    "Unhandled tar entry type {:?} for {}",
                    other,
                    raw_path.display()
                )));
            }
        }

        self.set_owner(&path, owner)?;
        apply_xattrs(&path, &xattrs, entry_type, self.privileged)?;
        set_mode_and_times(&path, entry_type, mode, mtime)?;
        self.unpacked.insert(path);
        Ok(())
    }

    /// Host (uid, gid) for an entry.
    fn entry_owner(&self, uid: u32, gid: u32) -> StevedoreResult<(u32, u32)> {
        let (uid, gid) = self.options.chown.unwrap_or((uid, gid));
        self.options.id_mappings.to_host(uid, gid)
    }

    fn set_owner(&self, path: &Path, (uid, gid): (u32, u32)) -> StevedoreResult<()> {
        match std::os::unix::fs::lchown(path, Some(uid), Some(gid)) {
            Ok(()) => Ok(()),
            // Rootless without a user namespace: ownership cannot be represented.
            Err(e) if !self.privileged && e.raw_os_error() == Some(libc::EPERM) => {
                trace!(path = %path.display(), uid, gid, "Ignoring chown failure (rootless)");
                Ok(())
            }
            Err(e) => Err(StevedoreError::Storage(format!(
                "Failed to chown {} to {}:{}: {}",
                path.display(),
                uid,
                gid,
                e
            ))),
        }
    }

    fn handle_whiteout(
        &mut self,
        path: &Path,
        parent_is_dir: bool,
        entry_type: EntryType,
    ) -> StevedoreResult<bool> {
        if entry_type != EntryType::Regular {
            return Ok(false);
        }
        let Some(base) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(false);
        };
        let parent = path
            .parent()
            .ok_or_else(|| StevedoreError::Image("Whiteout without parent directory".into()))?;

        if base == OPAQUE_WHITEOUT {
            if parent_is_dir && parent.is_dir() {
                for child in WalkDir::new(parent).min_depth(1).contents_first(true) {
                    let Ok(child) = child else { continue };
                    if self.unpacked.contains(child.path()) {
                        continue;
                    }
                    if self
                        .unpacked
                        .iter()
                        .any(|p| p.starts_with(child.path()) && p != child.path())
                    {
                        continue;
                    }
                    let _ = remove_any(child.path());
                    debug!(path = %child.path().display(), "Opaque whiteout removed");
                }
            }
            return Ok(true);
        }

        if let Some(name) = base.strip_prefix(WHITEOUT_PREFIX) {
            let target = parent.join(name);
            if parent_is_dir && target.symlink_metadata().is_ok() {
                let _ = remove_any(&target);
                debug!(path = %target.display(), "Whiteout removed");
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn finish_hardlinks(&mut self) -> StevedoreResult<()> {
        for pending in std::mem::take(&mut self.pending_links) {
            let target = resolve_in_root(&self.dest, &pending.target)?;
            if !target.exists() {
                // Target was removed by a whiteout later in the stream.
                trace!(link = %pending.link.display(), "Dropping hardlink to missing target");
                continue;
            }
            make_hardlink(&pending.link, &target.path)?;
            self.set_owner(&pending.link, pending.owner)?;
            set_mode_and_times(&pending.link, EntryType::Link, pending.mode, pending.mtime)?;
        }
        Ok(())
    }

    fn finish_dirs(&mut self) -> StevedoreResult<()> {
        // Deepest first, so a restrictive parent does not block its children.
        let mut dirs = std::mem::take(&mut self.pending_dirs);
        dirs.sort_unstable_by(|a, b| b.path.cmp(&a.path));
        for dir in dirs {
            if dir.path.is_dir() {
                set_mode_and_times(&dir.path, EntryType::Directory, dir.mode, dir.mtime)?;
            }
        }
        Ok(())
    }
}

/// Normalize a tar path to a relative path that cannot escape the root.
pub fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    Some(components.into_iter().collect())
}

const MAX_SYMLINK_HOPS: usize = 40;

/// Where an entry lands under the root.
struct Resolved {
    path: PathBuf,
    /// Every parent component is a real directory inside the root. When
    /// false, the parent chain must be rebuilt by [`ensure_parent_dirs`]
    /// before `path` is touched.
    parent_is_dir: bool,
}

impl Resolved {
    fn exists(&self) -> bool {
        self.parent_is_dir && fs::symlink_metadata(&self.path).is_ok()
    }
}

/// Map a normalized entry path to its location under `root`, following
/// symlinks in the parent components the way a chroot would.
///
/// Absolute link targets restart at `root` and `..` stops at `root`, so the
/// result never leaves it. A link that does not lead to a directory is left
/// in place for [`ensure_parent_dirs`] to replace. The last component is
/// never followed.
fn resolve_in_root(root: &Path, relative: &Path) -> StevedoreResult<Resolved> {
    let Some(name) = relative.file_name() else {
        return Ok(Resolved {
            path: root.to_path_buf(),
            parent_is_dir: true,
        });
    };
    let mut resolved = root.to_path_buf();
    let mut hops = 0;
    let mut literal = false;
    for comp in relative.parent().into_iter().flat_map(Path::components) {
        let Component::Normal(part) = comp else {
            continue;
        };
        let candidate = resolved.join(part);
        if literal {
            resolved = candidate;
            continue;
        }
        match fs::symlink_metadata(&candidate) {
            Ok(m) if m.is_dir() => resolved = candidate,
            Ok(m) if m.file_type().is_symlink() => {
                match follow_link(root, &resolved, &candidate, &mut hops)? {
                    Some(dir) => resolved = dir,
                    None => {
                        resolved = candidate;
                        literal = true;
                    }
                }
            }
            _ => {
                resolved = candidate;
                literal = true;
            }
        }
    }
    Ok(Resolved {
        path: resolved.join(name),
        parent_is_dir: !literal,
    })
}

/// Resolve the symlink at `link` (which lives in `dir`) to a directory
/// under `root`, or `None` if it does not lead to one.
fn follow_link(
    root: &Path,
    dir: &Path,
    link: &Path,
    hops: &mut usize,
) -> StevedoreResult<Option<PathBuf>> {
    *hops += 1;
    if *hops > MAX_SYMLINK_HOPS {
        return Err(StevedoreError::Image(format!(
            "Too many levels of symbolic links at {}",
            link.display()
        )));
    }
    let target = fs::read_link(link)
        .map_err(|e| StevedoreError::io(format!("Failed to read link {}", link.display()), e))?;

    let mut current = dir.to_path_buf();
    for comp in target.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => current = root.to_path_buf(),
            Component::CurDir => {}
            Component::ParentDir => {
                if current != root {
                    current.pop();
                }
            }
            Component::Normal(part) => {
                let candidate = current.join(part);
                match fs::symlink_metadata(&candidate) {
                    Ok(m) if m.is_dir() => current = candidate,
                    Ok(m) if m.file_type().is_symlink() => {
                        match follow_link(root, &current, &candidate, hops)? {
                            Some(next) => current = next,
                            None => return Ok(None),
                        }
                    }
                    _ => return Ok(None),
                }
            }
        }
    }
    Ok(Some(current))
}

/// Make sure every ancestor of `path` below `root` is a real directory,
/// replacing files and symlinks in the way. Nothing is followed, so
/// `path` should come from `resolve_in_root`.
pub fn ensure_parent_dirs(path: &Path, root: &Path) -> StevedoreResult<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let relative = parent.strip_prefix(root).map_err(|_| {
        StevedoreError::Image(format!(
            "{} is outside {}",
            path.display(),
            root.display()
        ))
    })?;

    let mut current = root.to_path_buf();
    for comp in relative.components() {
        current.push(comp);
        match fs::symlink_metadata(&current) {
            Ok(m) if m.is_dir() => continue,
            Ok(_) => {
                trace!(path = %current.display(), "Removing non-directory obstacle");
                remove_any(&current).map_err(|e| {
                    StevedoreError::Storage(format!(
                        "Failed to remove obstacle {}: {}",
                        current.display(),
                        e
                    ))
                })?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StevedoreError::Storage(format!(
                    "Failed to stat {}: {}",
                    current.display(),
                    e
                )));
            }
        }
        fs::create_dir(&current).map_err(|e| {
            StevedoreError::Storage(format!(
                "Failed to create parent directory {}: {}",
                current.display(),
                e
            ))
        })?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_existing(path: &Path, entry_type: EntryType) -> StevedoreResult<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() && entry_type == EntryType::Directory => Ok(()),
        Ok(_) => remove_any(path).map_err(|e| {
            StevedoreError::Storage(format!(
                "Failed to remove existing path {}: {}",
                path.display(),
                e
            ))
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StevedoreError::Storage(format!(
            "Failed to stat {}: {}",
            path.display(),
            e
        ))),
    }
}

fn read_xattrs<R: Read>(entry: &mut Entry<R>) -> StevedoreResult<Vec<(String, Vec<u8>)>> {
    let mut xattrs = Vec::new();
    let extensions = match entry.pax_extensions() {
        Ok(Some(exts)) => exts,
        Ok(None) => return Ok(xattrs),
        Err(e) => return Err(StevedoreError::Image(format!("PAX parse error: {}", e))),
    };
    for ext in extensions {
        let ext = ext.map_err(|e| StevedoreError::Image(format!("PAX entry error: {}", e)))?;
        let Ok(key) = ext.key() else { continue };
        if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
            xattrs.push((name.to_string(), ext.value_bytes().to_vec()));
        }
    }
    Ok(xattrs)
}

fn write_regular_file<R: Read>(entry: &mut Entry<R>, path: &Path, mode: u32) -> StevedoreResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode & 0o777)
        .open(path)
        .map_err(|e| StevedoreError::io(format!("Failed to create file {}", path.display()), e))?;
    io::copy(entry, &mut file)
        .map_err(|e| StevedoreError::io(format!("Failed to write {}", path.display()), e))?;
    Ok(())
}

fn make_hardlink(link: &Path, target: &Path) -> StevedoreResult<()> {
    fs::hard_link(target, link).map_err(|e| {
        StevedoreError::Storage(format!(
            "Failed to create hardlink {} -> {}: {}",
            link.display(),
            target.display(),
            e
        ))
    })
}

fn make_device(path: &Path, entry_type: EntryType, mode: u32, major: u32, minor: u32) -> StevedoreResult<()> {
    use nix::sys::stat::{Mode, SFlag, makedev, mknod};
    let kind = if entry_type == EntryType::Block {
        SFlag::S_IFBLK
    } else {
        SFlag::S_IFCHR
    };
    mknod(
        path,
        kind,
        Mode::from_bits_truncate(mode & 0o7777),
        makedev(major as u64, minor as u64),
    )
    .map_err(|e| StevedoreError::Storage(format!("Failed to create device {}: {}", path.display(), e)))
}

fn make_fifo(path: &Path, mode: u32) -> StevedoreResult<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(mode & 0o7777))
        .map_err(|e| StevedoreError::Storage(format!("Failed to create fifo {}: {}", path.display(), e)))
}

fn apply_xattrs(
    path: &Path,
    xattrs: &[(String, Vec<u8>)],
    entry_type: EntryType,
    privileged: bool,
) -> StevedoreResult<()> {
    for (key, value) in xattrs {
        if key.starts_with("trusted.") || (!privileged && key.starts_with("security.")) {
            trace!(key = %key, path = %path.display(), "Skipping privileged xattr");
            continue;
        }
        match xattr::set(path, key, value) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => {
                warn!(key = %key, path = %path.display(), "Ignoring unsupported xattr");
            }
            Err(e)
                if e.raw_os_error() == Some(libc::EPERM)
                    && !matches!(entry_type, EntryType::Regular | EntryType::Directory) =>
            {
                warn!(key = %key, path = %path.display(), "Ignoring xattr refused on special file");
            }
            Err(e) => {
                return Err(StevedoreError::Storage(format!(
                    "Failed to set xattr {} on {}: {}",
                    key,
                    path.display(),
                    e
                )));
            }
        }
    }
    Ok(())
}

fn set_mode_and_times(path: &Path, entry_type: EntryType, mode: u32, mtime: u64) -> StevedoreResult<()> {
    if entry_type != EntryType::Symlink {
        fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)).map_err(|e| {
            StevedoreError::Storage(format!(
                "Failed to set permissions {:o} on {}: {}",
                mode,
                path.display(),
                e
            ))
        })?;
    }
    let time = FileTime::from_system_time(clamp_time(mtime));
    let result = match entry_type {
        EntryType::Symlink => set_symlink_file_times(path, time, time),
        EntryType::Link => Ok(()),
        _ => set_file_times(path, time, time),
    };
    result.map_err(|e| {
        StevedoreError::Storage(format!("Failed to set times on {}: {}", path.display(), e))
    })
}

/// Out-of-range tar timestamps collapse to the epoch.
fn clamp_time(secs: u64) -> SystemTime {
    if secs > i64::MAX as u64 / 1_000_000_000 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs(secs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    pub(crate) enum TestEntry<'a> {
        Dir(&'a str),
        File(&'a str, &'a [u8]),
        Hardlink(&'a str, &'a str),
        Symlink(&'a str, &'a str),
    }

    pub(crate) fn build_tar(entries: &[TestEntry]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for entry in entries {
            let mut header = tar::Header::new_gnu();
            match entry {
                TestEntry::Dir(path) => {
                    header.set_path(path).unwrap();
                    header.set_mode(0o755);
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::File(path, content) => {
                    header.set_path(path).unwrap();
                    header.set_mode(0o644);
                    header.set_size(content.len() as u64);
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                }
                TestEntry::Hardlink(path, target) => {
                    header.set_path(path).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_mode(0o644);
                    header.set_entry_type(EntryType::Link);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::Symlink(path, target) => {
                    header.set_path(path).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    fn apply(data: &[u8], dest: &Path) -> ApplyStats {
        apply_layer(data, dest, &ApplyOptions::default()).unwrap()
    }

    #[test]
    fn test_apply_files_dirs_and_symlinks() {
        let dest = TempDir::new().unwrap();
        let data = build_tar(&[
            TestEntry::Dir("etc"),
            TestEntry::File("etc/os-release", b"ID=test\n"),
            TestEntry::Symlink("etc/link", "os-release"),
        ]);
        let stats = apply(&data, dest.path());
        assert_eq!(stats.entries, 3);
        assert_eq!(
            fs::read(dest.path().join("etc/os-release")).unwrap(),
            b"ID=test\n"
        );
        assert_eq!(
            fs::read_link(dest.path().join("etc/link")).unwrap(),
            Path::new("os-release")
        );
    }

    #[test]
    fn test_deferred_hardlink_target_appears_later() {
        let dest = TempDir::new().unwrap();
        let data = build_tar(&[
            TestEntry::Hardlink("link-to-target", "target.txt"),
            TestEntry::File("target.txt", b"target content"),
        ]);
        apply(&data, dest.path());
        let link = dest.path().join("link-to-target");
        let target = dest.path().join("target.txt");
        assert_eq!(fs::read(&link).unwrap(), b"target content");
        assert_eq!(
            fs::metadata(&link).unwrap().ino(),
            fs::metadata(&target).unwrap().ino()
        );
    }

    #[test]
    fn test_deferred_hardlink_dropped_when_target_whited_out() {
        let dest = TempDir::new().unwrap();
        let data = build_tar(&[
            TestEntry::Hardlink("link", "gone.txt"),
            TestEntry::File(".wh.gone.txt", b""),
        ]);
        apply(&data, dest.path());
        assert!(!dest.path().join("link").exists());
    }

    #[test]
    fn test_whiteout_removes_lower_file() {
        let dest = TempDir::new().unwrap();
        apply(
            &build_tar(&[TestEntry::Dir("a"), TestEntry::File("a/old", b"x")]),
            dest.path(),
        );
        apply(&build_tar(&[TestEntry::File("a/.wh.old", b"")]), dest.path());
        assert!(!dest.path().join("a/old").exists());
        assert!(!dest.path().join("a/.wh.old").exists());
    }

    #[test]
    fn test_opaque_whiteout_keeps_same_layer_entries() {
        let dest = TempDir::new().unwrap();
        apply(
            &build_tar(&[TestEntry::Dir("d"), TestEntry::File("d/lower", b"x")]),
            dest.path(),
        );
        apply(
            &build_tar(&[
                TestEntry::Dir("d"),
                TestEntry::File("d/upper", b"y"),
                TestEntry::File("d/.wh..wh..opq", b""),
            ]),
            dest.path(),
        );
        assert!(!dest.path().join("d/lower").exists());
        assert!(dest.path().join("d/upper").exists());
    }

    #[test]
    fn test_ignore_whiteouts_keeps_marker_files() {
        let dest = TempDir::new().unwrap();
        let options = ApplyOptions {
            ignore_whiteouts: true,
            ..Default::default()
        };
        apply_layer(
            &build_tar(&[TestEntry::File(".wh.keep", b"")])[..],
            dest.path(),
            &options,
        )
        .unwrap();
        assert!(dest.path().join(".wh.keep").exists());
    }

    #[test]
    fn test_parent_file_replaced_by_directory() {
        let dest = TempDir::new().unwrap();
        apply(&build_tar(&[TestEntry::File("a", b"file")]), dest.path());
        apply(&build_tar(&[TestEntry::File("a/b/c", b"nested")]), dest.path());
        assert_eq!(fs::read(dest.path().join("a/b/c")).unwrap(), b"nested");
    }

    #[test]
    fn test_symlink_to_directory_preserved_as_parent() {
        let dest = TempDir::new().unwrap();
        apply(
            &build_tar(&[TestEntry::Dir("real"), TestEntry::Symlink("alias", "real")]),
            dest.path(),
        );
        apply(&build_tar(&[TestEntry::File("alias/f", b"z")]), dest.path());
        assert!(
            fs::symlink_metadata(dest.path().join("alias"))
                .unwrap()
                .file_type()
                .is_symlink()
        );
        assert_eq!(fs::read(dest.path().join("real/f")).unwrap(), b"z");
    }

    /// A tar holding one regular file whose stored name is written as-is.
    fn raw_name_tar(name: &str, content: &[u8]) -> Vec<u8> {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, content).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_path_traversal_is_contained() {
        let dest = TempDir::new().unwrap();
        let inner = dest.path().join("root");
        for name in ["../../escape", "sub/../../escape", "../escape"] {
            let stats = apply(&raw_name_tar(name, b"no"), &inner);
            assert_eq!(stats.entries, 0, "{name}");
        }
        assert!(!dest.path().join("escape").exists());
        assert!(fs::read_dir(&inner).unwrap().next().is_none());

        apply(&raw_name_tar("a/../kept", b"yes"), &inner);
        assert_eq!(fs::read(inner.join("kept")).unwrap(), b"yes");
    }

    #[test]
    fn test_absolute_symlink_parent_stays_in_root() {
        let outside = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let target = outside.path().to_str().unwrap();
        apply(
            &build_tar(&[TestEntry::Symlink("alias", target), TestEntry::File("alias/pwn", b"x")]),
            dest.path(),
        );
        assert!(!outside.path().join("pwn").exists());
        assert_eq!(fs::read(dest.path().join("alias/pwn")).unwrap(), b"x");
        assert!(fs::symlink_metadata(dest.path().join("alias")).unwrap().is_dir());
    }

    #[test]
    fn test_absolute_symlink_resolves_against_root() {
        let dest = TempDir::new().unwrap();
        apply(
            &build_tar(&[
                TestEntry::Dir("data"),
                TestEntry::Symlink("alias", "/data"),
                TestEntry::File("alias/f", b"in"),
            ]),
            dest.path(),
        );
        assert_eq!(fs::read(dest.path().join("data/f")).unwrap(), b"in");
        assert!(
            fs::symlink_metadata(dest.path().join("alias"))
                .unwrap()
                .file_type()
                .is_symlink()
        );
    }

    #[test]
    fn test_relative_symlink_climb_stops_at_root() {
        let dest = TempDir::new().unwrap();
        let inner = dest.path().join("root");
        apply(
            &build_tar(&[
                TestEntry::Dir("deep"),
                TestEntry::Symlink("deep/up", "../../../.."),
                TestEntry::File("deep/up/top", b"t"),
            ]),
            &inner,
        );
        assert!(!dest.path().join("top").exists());
        assert_eq!(fs::read(inner.join("top")).unwrap(), b"t");
    }

    #[test]
    fn test_symlink_loop_is_rejected() {
        let dest = TempDir::new().unwrap();
        let data = build_tar(&[TestEntry::Symlink("loop", "loop"), TestEntry::File("loop/x", b"x")]);
        let err = apply_layer(&data[..], dest.path(), &ApplyOptions::default()).unwrap_err();
        assert!(err.to_string().contains("symbolic links"), "{err}");
    }

    #[test]
    fn test_hardlink_through_escaping_symlink_stays_in_root() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), b"host").unwrap();
        let dest = TempDir::new().unwrap();
        let target = outside.path().to_str().unwrap();
        let result = apply_layer(
            &build_tar(&[
                TestEntry::Symlink("alias", target),
                TestEntry::Hardlink("copy", "alias/secret"),
            ])[..],
            dest.path(),
            &ApplyOptions::default(),
        );
        assert!(result.is_ok());
        assert!(fs::symlink_metadata(dest.path().join("copy")).is_err());
        assert_eq!(fs::metadata(outside.path().join("secret")).unwrap().nlink(), 1);
    }

    #[test]
    fn test_whiteout_through_escaping_symlink_is_ignored() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), b"host").unwrap();
        let dest = TempDir::new().unwrap();
        let target = outside.path().to_str().unwrap();
        apply(
            &build_tar(&[
                TestEntry::Symlink("alias", target),
                TestEntry::File("alias/.wh.secret", b""),
                TestEntry::File("alias/.wh..wh..opq", b""),
            ]),
            dest.path(),
        );
        assert_eq!(fs::read(outside.path().join("secret")).unwrap(), b"host");
    }

    #[test]
    fn test_gzip_stream_detected() {
        let dest = TempDir::new().unwrap();
        let data = build_tar(&[TestEntry::File("gz", b"compressed")]);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&data).unwrap();
        let gz = encoder.finish().unwrap();
        apply(&gz, dest.path());
        assert_eq!(fs::read(dest.path().join("gz")).unwrap(), b"compressed");
    }

    #[test]
    fn test_chmod_override() {
        let dest = TempDir::new().unwrap();
        let options = ApplyOptions {
            chmod: Some(0o600),
            ..Default::default()
        };
        apply_layer(
            &build_tar(&[TestEntry::File("secret", b"s")])[..],
            dest.path(),
            &options,
        )
        .unwrap();
        let mode = fs::metadata(dest.path().join("secret")).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(
            normalize_entry_path(Path::new("./a/../b")).unwrap(),
            PathBuf::from("b")
        );
        assert!(normalize_entry_path(Path::new("../x")).is_none());
        assert_eq!(
            normalize_entry_path(Path::new("/abs/path")).unwrap(),
            PathBuf::from("abs/path")
        );
    }
}
