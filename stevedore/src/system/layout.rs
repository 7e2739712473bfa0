//! On-disk layout of the local store.
//!
//! ```text
//! <root>/
//!   storage.lock
//!   layers/<id>.tar          uncompressed layer diff
//!   layers/<id>.json         layer record
//!   images/<id>/image.json   image record
//!   images/<id>/<key>        big-data items (manifest, config, ...)
//!   containers/<id>/container.json
//!   containers/<id>/rootfs/
//!   containers/<id>/userdata/   state file, scratch, volumes
//!   cache/<id>/              --mount=type=cache directories
//!   tmp/                     staging area
//! <runroot>/
//!   containers/<id>/         run dir: bundles, secrets, sockets
//!   locks/                   cache mount lock files
//! ```

use std::path::{Path, PathBuf};

use stevedore_shared::errors::{StevedoreError, StevedoreResult};

/// Directory structure constants
pub mod dirs {
    pub const LAYERS_DIR: &str = "layers";

    pub const IMAGES_DIR: &str = "images";

    pub const CONTAINERS_DIR: &str = "containers";

    /// Per-container materialized root filesystem
    pub const ROOTFS_DIR: &str = "rootfs";

    /// Per-container scratch directory reported by the store
    pub const USERDATA_DIR: &str = "userdata";

    /// Builtin volume copies, under a container's userdata
    pub const VOLUMES_DIR: &str = "volumes";

    /// Named build caches for `--mount=type=cache`
    pub const CACHE_DIR: &str = "cache";

    pub const TMP_DIR: &str = "tmp";

    pub const LOCKS_DIR: &str = "locks";

    pub const STORE_LOCK: &str = "storage.lock";
}

/// Paths inside the store root and run root.
#[derive(Clone, Debug)]
pub struct StoreLayout {
    root: PathBuf,
    run_root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: PathBuf, run_root: PathBuf) -> Self {
        Self { root, run_root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.root.join(dirs::LAYERS_DIR)
    }

    pub fn layer_tar(&self, id: &str) -> PathBuf {
        self.layers_dir().join(format!("{}.tar", id))
    }

    pub fn layer_record(&self, id: &str) -> PathBuf {
        self.layers_dir().join(format!("{}.json", id))
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(dirs::IMAGES_DIR)
    }

    pub fn image_dir(&self, id: &str) -> PathBuf {
        self.images_dir().join(id)
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(dirs::CONTAINERS_DIR)
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    pub fn container_rootfs(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(dirs::ROOTFS_DIR)
    }

    pub fn container_userdata(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(dirs::USERDATA_DIR)
    }

    pub fn container_run_dir(&self, id: &str) -> PathBuf {
        self.run_root.join(dirs::CONTAINERS_DIR).join(id)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(dirs::CACHE_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(dirs::TMP_DIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.run_root.join(dirs::LOCKS_DIR)
    }

    pub fn store_lock(&self) -> PathBuf {
        self.root.join(dirs::STORE_LOCK)
    }

    /// Create every top-level directory.
    pub fn prepare(&self) -> StevedoreResult<()> {
        for dir in [
            self.root.clone(),
            self.layers_dir(),
            self.images_dir(),
            self.containers_dir(),
            self.cache_dir(),
            self.tmp_dir(),
            self.run_root.join(dirs::CONTAINERS_DIR),
            self.locks_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                StevedoreError::io(format!("Failed to create directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_creates_tree() {
        let temp = TempDir::new().unwrap();
        let layout = StoreLayout::new(temp.path().join("root"), temp.path().join("run"));
        layout.prepare().unwrap();

        assert!(layout.layers_dir().is_dir());
        assert!(layout.images_dir().is_dir());
        assert!(layout.containers_dir().is_dir());
        assert!(layout.locks_dir().is_dir());
        assert!(layout.tmp_dir().is_dir());
    }

    #[test]
    fn test_container_paths() {
        let layout = StoreLayout::new("/s".into(), "/r".into());
        assert_eq!(
            layout.container_rootfs("abc"),
            PathBuf::from("/s/containers/abc/rootfs")
        );
        assert_eq!(
            layout.container_run_dir("abc"),
            PathBuf::from("/r/containers/abc")
        );
        assert_eq!(layout.layer_tar("l1"), PathBuf::from("/s/layers/l1.tar"));
    }
}
