//! Content-addressed store of layers, images and containers.
//!
//! The builder core talks to the store only through the [`Store`] trait.
//! [`LocalStore`] is a directory-backed implementation: layers are kept as
//! uncompressed tarballs, container root filesystems are materialized
//! directories, and a container's read-write layer is computed on demand by
//! diffing its rootfs against its image's layer chain.

mod local;

use std::io::Read;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_shared::errors::StevedoreResult;

pub use local::LocalStore;

/// Big-data key under which an image's manifest is stored.
pub const MANIFEST_KEY: &str = "manifest";
/// Big-data key under which an image's config blob is stored.
pub const CONFIG_KEY: &str = "config";

/// An immutable layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// Digest of the uncompressed tar (the DiffID).
    pub diff_digest: String,
    pub diff_size: u64,
    /// Digest of the blob this layer was pulled as, when known.
    #[serde(default)]
    pub compressed_digest: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub top_layer: Option<String>,
    /// Digest of the stored manifest.
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub big_data_keys: Vec<String>,
    #[serde(default)]
    pub mount_count: u32,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    /// Image ID, empty for containers created from scratch.
    #[serde(default)]
    pub image: String,
    /// Top layer of the image; the container's own layer sits above it.
    #[serde(default)]
    pub parent_layer: Option<String>,
    /// Free-form metadata written by the creator.
    #[serde(default)]
    pub metadata: String,
    /// Host ownership used when the rootfs was materialized.
    #[serde(default)]
    pub id_mappings: crate::idtools::IdMappings,
    #[serde(default)]
    pub mount_count: u32,
    pub created: DateTime<Utc>,
}

/// Options for [`Store::create_container`].
#[derive(Clone, Debug, Default)]
pub struct ContainerOptions {
    pub names: Vec<String>,
    pub image: Option<String>,
    pub metadata: String,
    /// Host ownership applied while materializing the rootfs.
    pub id_mappings: crate::idtools::IdMappings,
}

/// Operations the builder core needs from a store.
pub trait Store: Send + Sync + std::fmt::Debug {
    // --- containers ---------------------------------------------------
    fn create_container(&self, options: &ContainerOptions) -> StevedoreResult<ContainerRecord>;
    fn container(&self, id_or_name: &str) -> StevedoreResult<ContainerRecord>;
    fn containers(&self) -> StevedoreResult<Vec<ContainerRecord>>;
    /// Scratch directory for the container's own bookkeeping files.
    fn container_directory(&self, id: &str) -> StevedoreResult<PathBuf>;
    /// Volatile per-container directory under the run root.
    fn container_run_directory(&self, id: &str) -> StevedoreResult<PathBuf>;
    /// Mount the container's rootfs; refcounted. Returns the mount point.
    fn mount_container(&self, id: &str) -> StevedoreResult<PathBuf>;
    /// Drop one mount reference (all of them with `force`). Returns whether
    /// the container is still mounted.
    fn unmount_container(&self, id: &str, force: bool) -> StevedoreResult<bool>;
    fn delete_container(&self, id: &str) -> StevedoreResult<()>;

    // --- layers -------------------------------------------------------
    fn layer(&self, id: &str) -> StevedoreResult<LayerRecord>;
    fn layers(&self) -> StevedoreResult<Vec<LayerRecord>>;
    /// Store a (possibly compressed) tar stream as a layer above `parent`.
    fn put_layer(
        &self,
        parent: Option<&str>,
        diff: &mut dyn Read,
        compressed_digest: Option<&str>,
    ) -> StevedoreResult<LayerRecord>;
    /// Uncompressed tar stream of a layer's changes against its parent.
    fn diff(&self, layer: &str) -> StevedoreResult<Box<dyn Read + Send>>;
    /// Uncompressed tar stream of a container's changes against its image.
    fn container_diff(&self, container: &str) -> StevedoreResult<Box<dyn Read + Send>>;
    /// Store a container's changes as a layer, returning the record.
    fn commit_container_layer(&self, container: &str) -> StevedoreResult<LayerRecord>;

    // --- images -------------------------------------------------------
    fn create_image(
        &self,
        id: &str,
        top_layer: Option<&str>,
        names: &[String],
    ) -> StevedoreResult<ImageRecord>;
    fn image(&self, id_or_name: &str) -> StevedoreResult<ImageRecord>;
    fn images(&self) -> StevedoreResult<Vec<ImageRecord>>;
    fn add_image_names(&self, id: &str, names: &[String]) -> StevedoreResult<()>;
    fn remove_image_names(&self, id: &str, names: &[String]) -> StevedoreResult<()>;
    fn delete_image(&self, id: &str) -> StevedoreResult<()>;
    fn image_big_data(&self, id: &str, key: &str) -> StevedoreResult<Vec<u8>>;
    fn set_image_big_data(&self, id: &str, key: &str, data: &[u8]) -> StevedoreResult<()>;
    /// Mount an image's filesystem read-only; refcounted.
    fn mount_image(&self, id: &str) -> StevedoreResult<PathBuf>;
    fn unmount_image(&self, id: &str, force: bool) -> StevedoreResult<bool>;

    /// Scratch space for staging blobs.
    fn tmp_dir(&self) -> PathBuf;
    /// Directory for named build caches.
    fn cache_dir(&self) -> PathBuf;
    /// Directory for lock files.
    fn locks_dir(&self) -> PathBuf;
}

/// Layer chain from `top` down to the base layer (top first).
pub fn layer_chain(store: &dyn Store, top: Option<&str>) -> StevedoreResult<Vec<LayerRecord>> {
    let mut chain = Vec::new();
    let mut next = top.map(str::to_string);
    while let Some(id) = next {
        let record = store.layer(&id)?;
        next = record.parent.clone();
        chain.push(record);
    }
    Ok(chain)
}
