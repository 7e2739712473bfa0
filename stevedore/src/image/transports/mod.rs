//! Image sources and destinations, one module per transport.

pub mod dir;
pub mod docker_archive;
pub mod oci_layout;
pub mod registry;
pub mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use super::manifest::{Descriptor, ManifestType};
use super::reference::{ImageReference, Transport};
use crate::storage::Store;
use crate::system::SystemContext;
use crate::util::digest::digest_hex;

/// Something images can be read from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    fn reference(&self) -> &ImageReference;

    /// Manifest bytes and media type. `instance` selects a manifest by
    /// digest when the top-level document is a list.
    async fn manifest(&self, instance: Option<&str>) -> StevedoreResult<(Vec<u8>, String)>;

    /// Materialize a blob as a file under `scratch`.
    async fn get_blob(&self, descriptor: &Descriptor, scratch: &Path) -> StevedoreResult<PathBuf>;

    /// Release resources held by the source.
    async fn close(&self) -> StevedoreResult<()>;
}

/// Something images can be written to.
#[async_trait]
pub trait ImageDestination: Send + Sync {
    fn reference(&self) -> &ImageReference;

    /// Manifest formats accepted, preferred first.
    fn supported_manifest_types(&self) -> Vec<ManifestType>;

    /// If the blob is already present, the descriptor to record for it.
    async fn try_reusing_blob(&self, descriptor: &Descriptor) -> StevedoreResult<Option<Descriptor>>;

    /// Store a blob read from `path`. Returns the descriptor as stored.
    async fn put_blob(
        &self,
        path: &Path,
        descriptor: &Descriptor,
        is_config: bool,
    ) -> StevedoreResult<Descriptor>;

    /// Store a manifest. `instance` is set for per-platform manifests of
    /// a list, which are stored before the list itself.
    async fn put_manifest(
        &self,
        manifest: &[u8],
        media_type: &str,
        instance: Option<&str>,
    ) -> StevedoreResult<()>;

    /// Make the written image visible.
    async fn commit(&self) -> StevedoreResult<()>;
}

/// Open a source for `reference`.
pub fn open_source(
    reference: &ImageReference,
    context: &SystemContext,
    store: &Arc<dyn Store>,
) -> StevedoreResult<Box<dyn ImageSource>> {
    Ok(match reference.transport {
        Transport::Docker => Box::new(registry::RegistrySource::new(reference, context)?),
        Transport::DockerArchive => Box::new(docker_archive::DockerArchiveSource::open(reference)?),
        Transport::Oci => Box::new(oci_layout::OciLayoutSource::open_dir(reference)?),
        Transport::OciArchive => Box::new(oci_layout::OciLayoutSource::open_archive(reference)?),
        Transport::Dir => Box::new(dir::DirSource::open(reference)?),
        Transport::ContainersStorage => {
            Box::new(storage::StorageSource::open(reference, store.clone())?)
        }
    })
}

/// Open a destination for `reference`.
pub fn open_destination(
    reference: &ImageReference,
    context: &SystemContext,
    store: &Arc<dyn Store>,
) -> StevedoreResult<Box<dyn ImageDestination>> {
    Ok(match reference.transport {
        Transport::Docker => Box::new(registry::RegistryDestination::new(reference, context)?),
        Transport::DockerArchive => Box::new(docker_archive::DockerArchiveDestination::create(reference)?),
        Transport::Oci => Box::new(oci_layout::OciLayoutDestination::create_dir(reference)?),
        Transport::OciArchive => Box::new(oci_layout::OciLayoutDestination::create_archive(reference)?),
        Transport::Dir => Box::new(dir::DirDestination::create(reference)?),
        Transport::ContainersStorage => {
            Box::new(storage::StorageDestination::new(reference, store.clone())?)
        }
    })
}

/// Path of a staged blob under a scratch directory.
pub fn scratch_blob_path(scratch: &Path, digest: &str) -> StevedoreResult<PathBuf> {
    Ok(scratch.join(digest_hex(digest)?))
}

/// Copy a local file into scratch space.
pub(crate) fn stage_copy(source: &Path, scratch: &Path, digest: &str) -> StevedoreResult<PathBuf> {
    let target = scratch_blob_path(scratch, digest)?;
    std::fs::copy(source, &target).map_err(|e| {
        StevedoreError::io(
            format!("Failed to stage blob {} from {}", digest, source.display()),
            e,
        )
    })?;
    Ok(target)
}
