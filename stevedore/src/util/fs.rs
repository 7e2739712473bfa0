//! Filesystem helpers: atomic writes, tree copies and rootfs path
//! resolution.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use stevedore_shared::errors::{StevedoreError, StevedoreResult};

/// Atomically replace `path` with `data` (write to a sibling temp file,
/// fsync, rename).
pub fn atomic_write(path: &Path, data: &[u8]) -> StevedoreResult<()> {
    let parent = path.parent().ok_or_else(|| {
        StevedoreError::Internal(format!("Path has no parent: {}", path.display()))
    })?;
    fs::create_dir_all(parent)
        .map_err(|e| StevedoreError::io(format!("Failed to create {}", parent.display()), e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(
        ".{}.{}.tmp",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            tracing::warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp file");
        }
        return Err(StevedoreError::io(
            format!("Failed to write {}", path.display()),
            e,
        ));
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> StevedoreResult<()> {
    let data = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &data)
}

/// Read and deserialize a JSON file.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StevedoreResult<T> {
    let data = fs::read(path)
        .map_err(|e| StevedoreError::io(format!("Failed to read {}", path.display()), e))?;
    serde_json::from_slice(&data).map_err(|e| {
        StevedoreError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Recursively copy the contents of `src` into `dst`, preserving modes,
/// ownership (when permitted) and symlinks. Regular files are reflinked
/// where the filesystem supports it.
pub fn copy_tree(src: &Path, dst: &Path) -> StevedoreResult<()> {
    fs::create_dir_all(dst)
        .map_err(|e| StevedoreError::io(format!("Failed to create {}", dst.display()), e))?;

    for entry in walkdir::WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry
            .map_err(|e| StevedoreError::Storage(format!("Failed to walk {}: {}", src.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StevedoreError::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata().map_err(|e| {
            StevedoreError::io(format!("Failed to stat {}", entry.path().display()), e)
        })?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| {
                StevedoreError::io(format!("Failed to create {}", target.display()), e)
            })?;
            fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode() & 0o7777))
                .map_err(|e| {
                    StevedoreError::io(format!("Failed to chmod {}", target.display()), e)
                })?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| {
                StevedoreError::io(format!("Failed to read link {}", entry.path().display()), e)
            })?;
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StevedoreError::io(
                        format!("Failed to replace {}", target.display()),
                        e,
                    ));
                }
            }
            std::os::unix::fs::symlink(&link, &target).map_err(|e| {
                StevedoreError::io(format!("Failed to create symlink {}", target.display()), e)
            })?;
        } else if file_type.is_file() {
            reflink_copy::reflink_or_copy(entry.path(), &target).map_err(|e| {
                StevedoreError::io(
                    format!(
                        "Failed to copy {} to {}",
                        entry.path().display(),
                        target.display()
                    ),
                    e,
                )
            })?;
            fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode() & 0o7777))
                .map_err(|e| {
                    StevedoreError::io(format!("Failed to chmod {}", target.display()), e)
                })?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file during copy");
            continue;
        }

        // Ownership is best-effort: rootless callers cannot chown.
        let _ = std::os::unix::fs::lchown(&target, Some(meta.uid()), Some(meta.gid()));
    }
    Ok(())
}

/// Remove a file, symlink or empty directory if it exists.
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

const MAX_SYMLINK_HOPS: usize = 40;

/// Join `path` onto `root` the way a process chrooted into `root` would
/// see it: symlinks are followed but can never leave `root`, and `..`
/// stops at `root`. Missing trailing components are kept as given.
pub fn secure_join(root: &Path, path: &Path) -> StevedoreResult<PathBuf> {
    let mut pending: Vec<std::ffi::OsString> = path
        .components()
        .rev()
        .filter_map(|c| match c {
            Component::Normal(n) => Some(n.to_os_string()),
            Component::ParentDir => Some("..".into()),
            _ => None,
        })
        .collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(next) = pending.pop() {
        if next == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&next);
        let meta = match fs::symlink_metadata(root.join(&candidate)) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                resolved = candidate;
                continue;
            }
            Err(e) => {
                return Err(StevedoreError::io(
                    format!("Failed to stat {}", root.join(&candidate).display()),
                    e,
                ));
            }
        };
        if !meta.file_type().is_symlink() {
            resolved = candidate;
            continue;
        }
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(StevedoreError::InvalidArgument(format!(
                "too many levels of symbolic links resolving {}",
                path.display()
            )));
        }
        let link = fs::read_link(root.join(&candidate)).map_err(|e| {
            StevedoreError::io(format!("Failed to read link {}", root.join(&candidate).display()), e)
        })?;
        if link.is_absolute() {
            resolved = PathBuf::new();
        }
        for comp in link.components().rev() {
            match comp {
                Component::Normal(n) => pending.push(n.to_os_string()),
                Component::ParentDir => pending.push("..".into()),
                _ => {}
            }
        }
    }
    Ok(root.join(resolved))
}

/// Whether a directory is empty (or missing).
pub fn dir_is_empty(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_copy_tree_preserves_structure() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("a/b/file"), b"data").unwrap();
        fs::set_permissions(
            src.path().join("a/b/file"),
            fs::Permissions::from_mode(0o750),
        )
        .unwrap();
        std::os::unix::fs::symlink("b/file", src.path().join("a/link")).unwrap();

        copy_tree(src.path(), dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("a/b/file")).unwrap(), b"data");
        let mode = fs::metadata(dst.path().join("a/b/file")).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o750);
        assert_eq!(
            fs::read_link(dst.path().join("a/link")).unwrap(),
            Path::new("b/file")
        );
    }

    #[test]
    fn test_secure_join_contains_symlinks() {
        let root = TempDir::new().unwrap();
        let r = root.path();
        fs::create_dir_all(r.join("run")).unwrap();
        std::os::unix::fs::symlink("/run", r.join("var_run")).unwrap();
        std::os::unix::fs::symlink("../../../../etc", r.join("escape")).unwrap();
        std::os::unix::fs::symlink("loop", r.join("loop")).unwrap();

        assert_eq!(secure_join(r, Path::new("/var_run/x")).unwrap(), r.join("run/x"));
        assert_eq!(secure_join(r, Path::new("/escape/passwd")).unwrap(), r.join("etc/passwd"));
        assert_eq!(secure_join(r, Path::new("/../../a")).unwrap(), r.join("a"));
        assert!(secure_join(r, Path::new("/loop/x")).is_err());
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        remove_if_exists(&file).unwrap();
        remove_if_exists(&file).unwrap();
        assert!(!file.exists());
    }
}
