//! Filesystem change detection and layer export.
//!
//! `changes` compares an upper tree against an optional lower tree by
//! metadata (type, mode, ownership, size, mtime, link target, device).
//! `write_layer` turns a change list into a tar stream with whiteouts for
//! deletions and hard-link entries for files sharing an inode.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, Metadata};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tar::{EntryType, Header, HeaderMode};
use walkdir::WalkDir;

use crate::archive::apply::WHITEOUT_PREFIX;
use crate::idtools::IdMappings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Change {
    /// Path relative to the tree root.
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Compute changes that turn `lower` (or an empty tree) into `upper`.
/// The result is sorted by path.
pub fn changes(lower: Option<&Path>, upper: &Path) -> StevedoreResult<Vec<Change>> {
    let mut result = BTreeMap::new();

    for entry in WalkDir::new(upper)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            StevedoreError::Storage(format!("Failed to walk {}: {}", upper.display(), e))
        })?;
        let rel = relative(upper, entry.path())?;
        let upper_meta = symlink_meta(entry.path())?;

        let kind = match lower.map(|l| l.join(&rel)) {
            Some(lower_path) => match fs::symlink_metadata(&lower_path) {
                Ok(lower_meta) => {
                    if same_entry(&lower_path, &lower_meta, entry.path(), &upper_meta)? {
                        continue;
                    }
                    ChangeKind::Modify
                }
                Err(e) if is_missing(&e) => ChangeKind::Add,
                Err(e) => {
                    return Err(StevedoreError::io(
                        format!("Failed to stat {}", lower_path.display()),
                        e,
                    ));
                }
            },
            None => ChangeKind::Add,
        };
        result.insert(rel.clone(), Change { path: rel, kind });
    }

    if let Some(lower) = lower {
        let mut walker = WalkDir::new(lower)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| {
                StevedoreError::Storage(format!("Failed to walk {}: {}", lower.display(), e))
            })?;
            let rel = relative(lower, entry.path())?;
            match fs::symlink_metadata(upper.join(&rel)) {
                Ok(_) => {}
                Err(e) if is_missing(&e) => {
                    // One whiteout covers a whole deleted directory.
                    if entry.file_type().is_dir() {
                        walker.skip_current_dir();
                    }
                    result.insert(
                        rel.clone(),
                        Change {
                            path: rel,
                            kind: ChangeKind::Delete,
                        },
                    );
                }
                Err(e) => {
                    return Err(StevedoreError::io(
                        format!("Failed to stat {}", upper.join(&rel).display()),
                        e,
                    ));
                }
            }
        }
    }

    Ok(result.into_values().collect())
}

fn is_missing(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR)
}

fn relative(root: &Path, path: &Path) -> StevedoreResult<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|e| StevedoreError::Internal(format!("{} not under {}: {}", path.display(), root.display(), e)))
}

fn symlink_meta(path: &Path) -> StevedoreResult<Metadata> {
    fs::symlink_metadata(path)
        .map_err(|e| StevedoreError::io(format!("Failed to stat {}", path.display()), e))
}

fn same_entry(
    lower_path: &Path,
    lower: &Metadata,
    upper_path: &Path,
    upper: &Metadata,
) -> StevedoreResult<bool> {
    if lower.mode() != upper.mode() || lower.uid() != upper.uid() || lower.gid() != upper.gid() {
        return Ok(false);
    }
    let ft = upper.file_type();
    if ft.is_dir() {
        // Directory mtimes change with their children; only attributes count.
        return Ok(true);
    }
    if lower.size() != upper.size()
        || lower.mtime() != upper.mtime()
        || lower.mtime_nsec() != upper.mtime_nsec()
        || lower.rdev() != upper.rdev()
    {
        return Ok(false);
    }
    if ft.is_symlink() {
        let a = fs::read_link(lower_path)
            .map_err(|e| StevedoreError::io(format!("Failed to read link {}", lower_path.display()), e))?;
        let b = fs::read_link(upper_path)
            .map_err(|e| StevedoreError::io(format!("Failed to read link {}", upper_path.display()), e))?;
        return Ok(a == b);
    }
    Ok(true)
}

/// Write `changes` from `upper` as a tar stream into `writer`.
///
/// Ownership is translated from host IDs to container IDs through
/// `mappings`. Returns the writer after the archive trailer is written.
pub fn write_layer<W: Write>(
    upper: &Path,
    changes: &[Change],
    mappings: &IdMappings,
    writer: W,
) -> StevedoreResult<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    let mut inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for change in changes {
        if change.kind == ChangeKind::Delete {
            append_whiteout(&mut builder, &change.path)?;
            continue;
        }

        let full = upper.join(&change.path);
        let meta = symlink_meta(&full)?;
        let ft = meta.file_type();

        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&meta, HeaderMode::Complete);
        let (uid, gid) = mappings
            .to_container(meta.uid(), meta.gid())
            .unwrap_or((meta.uid(), meta.gid()));
        header.set_uid(uid as u64);
        header.set_gid(gid as u64);

        let result = if ft.is_file() && meta.nlink() > 1 {
            let key = (meta.dev(), meta.ino());
            if let Some(first) = inodes.get(&key) {
                header.set_entry_type(EntryType::Link);
                header.set_size(0);
                builder.append_link(&mut header, &change.path, first)
            } else {
                inodes.insert(key, change.path.clone());
                append_file(&mut builder, &mut header, &change.path, &full)
            }
        } else if ft.is_file() {
            append_file(&mut builder, &mut header, &change.path, &full)
        } else if ft.is_symlink() {
            let target = fs::read_link(&full)
                .map_err(|e| StevedoreError::io(format!("Failed to read link {}", full.display()), e))?;
            header.set_size(0);
            builder.append_link(&mut header, &change.path, &target)
        } else {
            header.set_size(0);
            builder.append_data(&mut header, &change.path, io::empty())
        };
        result.map_err(|e| {
            StevedoreError::io(format!("Failed to add {} to layer", change.path.display()), e)
        })?;
    }

    builder
        .into_inner()
        .map_err(|e| StevedoreError::io("Failed to finish layer archive", e))
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    header: &mut Header,
    path: &Path,
    full: &Path,
) -> io::Result<()> {
    let file = fs::File::open(full)?;
    builder.append_data(header, path, file)
}

fn append_whiteout<W: Write>(builder: &mut tar::Builder<W>, path: &Path) -> StevedoreResult<()> {
    let name = path
        .file_name()
        .ok_or_else(|| StevedoreError::Internal(format!("Cannot whiteout {}", path.display())))?;
    let whiteout = path.with_file_name(format!("{}{}", WHITEOUT_PREFIX, name.to_string_lossy()));
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(0);
    header.set_mtime(0);
    builder
        .append_data(&mut header, &whiteout, io::empty())
        .map_err(|e| StevedoreError::io(format!("Failed to add whiteout {}", whiteout.display()), e))
}

/// Pack an entire directory as a layer.
pub fn tar_directory<W: Write>(dir: &Path, mappings: &IdMappings, writer: W) -> StevedoreResult<W> {
    let all = changes(None, dir)?;
    write_layer(dir, &all, mappings, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::apply::{ApplyOptions, apply_layer};
    use tempfile::TempDir;

    fn entry_names(data: &[u8]) -> Vec<(String, EntryType, u64)> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().trim_end_matches('/').to_string(),
                    e.header().entry_type(),
                    e.header().size().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_single_file_from_empty_tree() {
        let upper = TempDir::new().unwrap();
        fs::write(upper.path().join("a"), vec![0u8; 1234]).unwrap();

        let all = changes(None, upper.path()).unwrap();
        assert_eq!(all.len(), 1);
        let data = write_layer(upper.path(), &all, &IdMappings::default(), Vec::new()).unwrap();
        let names = entry_names(&data);
        assert_eq!(names, vec![("a".to_string(), EntryType::Regular, 1234)]);
    }

    #[test]
    fn test_changes_detect_add_modify_delete() {
        let lower = TempDir::new().unwrap();
        let upper = TempDir::new().unwrap();
        for root in [lower.path(), upper.path()] {
            fs::create_dir_all(root.join("keep")).unwrap();
            fs::write(root.join("keep/same"), b"same").unwrap();
        }
        // Same mtime on both copies so the file reads as unchanged.
        let mtime = filetime::FileTime::from_unix_time(1_700_000_000, 0);
        filetime::set_file_mtime(lower.path().join("keep/same"), mtime).unwrap();
        filetime::set_file_mtime(upper.path().join("keep/same"), mtime).unwrap();

        fs::write(lower.path().join("changed"), b"old").unwrap();
        fs::write(upper.path().join("changed"), b"new contents").unwrap();
        fs::create_dir_all(lower.path().join("gone/deep")).unwrap();
        fs::write(lower.path().join("gone/deep/file"), b"x").unwrap();
        fs::write(upper.path().join("added"), b"+").unwrap();

        let result = changes(Some(lower.path()), upper.path()).unwrap();
        let find = |p: &str| result.iter().find(|c| c.path == Path::new(p)).map(|c| c.kind);
        assert_eq!(find("added"), Some(ChangeKind::Add));
        assert_eq!(find("changed"), Some(ChangeKind::Modify));
        assert_eq!(find("gone"), Some(ChangeKind::Delete));
        assert_eq!(find("gone/deep"), None);
        assert_eq!(find("keep/same"), None);
    }

    #[test]
    fn test_deleted_entries_become_whiteouts() {
        let lower = TempDir::new().unwrap();
        let upper = TempDir::new().unwrap();
        fs::create_dir(lower.path().join("etc")).unwrap();
        fs::create_dir(upper.path().join("etc")).unwrap();
        fs::write(lower.path().join("etc/motd"), b"hi").unwrap();

        let result = changes(Some(lower.path()), upper.path()).unwrap();
        let data = write_layer(upper.path(), &result, &IdMappings::default(), Vec::new()).unwrap();
        let names: Vec<String> = entry_names(&data).into_iter().map(|(n, _, _)| n).collect();
        assert!(names.contains(&"etc/.wh.motd".to_string()));

        // Applying the diff on top of lower reproduces upper.
        let applied = TempDir::new().unwrap();
        crate::util::fs::copy_tree(lower.path(), applied.path()).unwrap();
        apply_layer(&data[..], applied.path(), &ApplyOptions::default()).unwrap();
        assert!(!applied.path().join("etc/motd").exists());
    }

    #[test]
    fn test_hardlinks_emitted_once() {
        let upper = TempDir::new().unwrap();
        fs::write(upper.path().join("first"), b"shared").unwrap();
        fs::hard_link(upper.path().join("first"), upper.path().join("second")).unwrap();

        let all = changes(None, upper.path()).unwrap();
        let data = write_layer(upper.path(), &all, &IdMappings::default(), Vec::new()).unwrap();
        let names = entry_names(&data);
        assert_eq!(names[0], ("first".to_string(), EntryType::Regular, 6));
        assert_eq!(names[1].1, EntryType::Link);
    }

    #[test]
    fn test_symlinks_preserved() {
        let upper = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/etc/passwd", upper.path().join("pw")).unwrap();
        let data = tar_directory(upper.path(), &IdMappings::default(), Vec::new()).unwrap();
        let mut archive = tar::Archive::new(&data[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().entry_type(), EntryType::Symlink);
        assert_eq!(
            entry.link_name().unwrap().unwrap().as_ref(),
            Path::new("/etc/passwd")
        );
    }

    #[test]
    fn test_output_is_deterministic() {
        let upper = TempDir::new().unwrap();
        fs::create_dir(upper.path().join("d")).unwrap();
        fs::write(upper.path().join("d/b"), b"b").unwrap();
        fs::write(upper.path().join("d/a"), b"a").unwrap();
        let first = tar_directory(upper.path(), &IdMappings::default(), Vec::new()).unwrap();
        let second = tar_directory(upper.path(), &IdMappings::default(), Vec::new()).unwrap();
        assert_eq!(first, second);
    }
}
