//! Persistent build caches for `--mount=type=cache`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::idtools::IdMappings;
use crate::run::mount_spec::{CacheMount, CacheSharing};
use crate::system::FileLock;
use crate::util::digest::sha256_digest;

/// A cache directory ready to bind, plus what keeps it exclusive.
#[derive(Debug)]
pub struct PreparedCache {
    pub source: PathBuf,
    /// Held for the whole run with `sharing=locked`.
    pub lock: Option<FileLock>,
    /// Throwaway copy made for `sharing=private`; removed at cleanup.
    pub scratch: Option<PathBuf>,
}

/// Directory name for a cache id. Ids are free-form, often absolute paths.
pub fn cache_key(id: &str) -> String {
    let digest = sha256_digest(id.as_bytes());
    digest["sha256:".len()..]
        .chars()
        .take(32)
        .collect()
}

fn create_owned(dir: &Path, mount: &CacheMount, mappings: &IdMappings) -> StevedoreResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| StevedoreError::io(format!("Failed to create cache {}", dir.display()), e))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mount.mode))
        .map_err(|e| StevedoreError::io(format!("Failed to chmod {}", dir.display()), e))?;
    let (uid, gid) = mappings.to_host(mount.uid, mount.gid)?;
    if let Err(e) = std::os::unix::fs::chown(dir, Some(uid), Some(gid)) {
        tracing::warn!(dir = %dir.display(), uid, gid, error = %e, "Failed to chown cache directory");
    }
    Ok(())
}

/// Find or create the cache for `mount`.
///
/// `cache_root` holds the persistent caches, `locks_dir` their lock files and
/// `run_dir` per-run private copies.
pub fn prepare(
    mount: &CacheMount,
    cache_root: &Path,
    locks_dir: &Path,
    run_dir: &Path,
    mappings: &IdMappings,
) -> StevedoreResult<PreparedCache> {
    let key = cache_key(&mount.id);
    let dir = cache_root.join(&key);

    match mount.sharing {
        CacheSharing::Shared => {
            create_owned(&dir, mount, mappings)?;
            Ok(PreparedCache { source: dir, lock: None, scratch: None })
        }
        CacheSharing::Locked => {
            std::fs::create_dir_all(locks_dir).map_err(|e| {
                StevedoreError::io(format!("Failed to create {}", locks_dir.display()), e)
            })?;
            let lock = FileLock::acquire(&locks_dir.join(format!("cache-{}.lock", key)))?;
            create_owned(&dir, mount, mappings)?;
            tracing::debug!(id = %mount.id, "Locked cache");
            Ok(PreparedCache { source: dir, lock: Some(lock), scratch: None })
        }
        CacheSharing::Private => {
            let scratch = run_dir.join(format!("cache-{}", key));
            match std::fs::remove_dir_all(&scratch) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StevedoreError::io(format!("Failed to clear {}", scratch.display()), e)),
            }
            create_owned(&scratch, mount, mappings)?;
            Ok(PreparedCache {
                source: scratch.clone(),
                lock: None,
                scratch: Some(scratch),
            })
        }
    }
}
