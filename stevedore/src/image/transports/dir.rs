//! `dir:` transport: a manifest plus one file per blob, named by hex digest.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use super::{ImageDestination, ImageSource, stage_copy};
use crate::image::manifest::{Descriptor, ManifestType, detect_media_type};
use crate::image::reference::ImageReference;
use crate::util::digest::{digest_file, digest_hex, sha256_digest};
use crate::util::fs::atomic_write;

const MANIFEST_FILE: &str = "manifest.json";
const VERSION_FILE: &str = "version";
const VERSION: &str = "Directory Transport Version: 1.1\n";

fn instance_manifest_file(digest: &str) -> StevedoreResult<String> {
    Ok(format!("{}.manifest.json", digest_hex(digest)?))
}

pub struct DirSource {
    reference: ImageReference,
    root: PathBuf,
}

impl DirSource {
    pub fn open(reference: &ImageReference) -> StevedoreResult<Self> {
        let root = reference.path()?.to_path_buf();
        if !root.join(MANIFEST_FILE).exists() {
            return Err(StevedoreError::ImageUnknown(format!(
                "{} has no {}",
                root.display(),
                MANIFEST_FILE
            )));
        }
        Ok(Self {
            reference: reference.clone(),
            root,
        })
    }
}

#[async_trait]
impl ImageSource for DirSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn manifest(&self, instance: Option<&str>) -> StevedoreResult<(Vec<u8>, String)> {
        let file = match instance {
            Some(digest) => instance_manifest_file(digest)?,
            None => MANIFEST_FILE.to_string(),
        };
        let path = self.root.join(file);
        let bytes = fs::read(&path)
            .map_err(|e| StevedoreError::io(format!("Failed to read {}", path.display()), e))?;
        let (_, media_type) = detect_media_type(&bytes)?;
        Ok((bytes, media_type))
    }

    async fn get_blob(&self, descriptor: &Descriptor, scratch: &Path) -> StevedoreResult<PathBuf> {
        let path = self.root.join(digest_hex(&descriptor.digest)?);
        stage_copy(&path, scratch, &descriptor.digest)
    }

    async fn close(&self) -> StevedoreResult<()> {
        Ok(())
    }
}

pub struct DirDestination {
    reference: ImageReference,
    root: PathBuf,
}

impl DirDestination {
    pub fn create(reference: &ImageReference) -> StevedoreResult<Self> {
        let root = reference.path()?.to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| StevedoreError::io(format!("Failed to create {}", root.display()), e))?;
        atomic_write(&root.join(VERSION_FILE), VERSION.as_bytes())?;
        Ok(Self {
            reference: reference.clone(),
            root,
        })
    }
}

#[async_trait]
impl ImageDestination for DirDestination {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn supported_manifest_types(&self) -> Vec<ManifestType> {
        vec![ManifestType::OciV1, ManifestType::DockerV2S2]
    }

    async fn try_reusing_blob(&self, _descriptor: &Descriptor) -> StevedoreResult<Option<Descriptor>> {
        Ok(None)
    }

    async fn put_blob(
        &self,
        path: &Path,
        descriptor: &Descriptor,
        _is_config: bool,
    ) -> StevedoreResult<Descriptor> {
        let (digest, size) = digest_file(path)?;
        let target = self.root.join(digest_hex(&digest)?);
        fs::copy(path, &target)
            .map_err(|e| StevedoreError::io(format!("Failed to store blob {}", digest), e))?;
        Ok(Descriptor {
            digest,
            size: size as i64,
            ..descriptor.clone()
        })
    }

    async fn put_manifest(
        &self,
        manifest: &[u8],
        _media_type: &str,
        instance: Option<&str>,
    ) -> StevedoreResult<()> {
        let file = match instance {
            Some(_) => instance_manifest_file(&sha256_digest(manifest))?,
            None => MANIFEST_FILE.to_string(),
        };
        atomic_write(&self.root.join(file), manifest)
    }

    async fn commit(&self) -> StevedoreResult<()> {
        Ok(())
    }
}
