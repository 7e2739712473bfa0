//! `docker-archive:` tarballs in the `docker save` format.
//!
//! ```text
//! manifest.json   [{"Config": "<hex>.json", "RepoTags": [...], "Layers": ["<hex>.tar", ...]}]
//! <hex>.json      image config
//! <hex>.tar       layer blobs
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stevedore_shared::constants::media_types as mt;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tempfile::TempDir;
use tracing::debug;

use super::oci_layout::write_archive;
use super::{ImageDestination, ImageSource, stage_copy};
use crate::archive::Compression;
use crate::image::manifest::{Descriptor, Manifest, ManifestType};
use crate::image::reference::ImageReference;
use crate::util::digest::{digest_file, digest_hex};
use crate::util::fs::atomic_write;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ArchiveItem {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

/// What an archive says about its (first or selected) image.
#[derive(Clone, Debug)]
pub struct ArchiveInfo {
    pub repo_tags: Vec<String>,
    pub config_digest: String,
}

fn read_items(root: &Path) -> StevedoreResult<Vec<ArchiveItem>> {
    let path = root.join(MANIFEST_FILE);
    let bytes = fs::read(&path)
        .map_err(|e| StevedoreError::io(format!("Failed to read {}", path.display()), e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StevedoreError::Image(format!("Malformed docker archive manifest: {}", e)))
}

fn select(items: Vec<ArchiveItem>, reference: &ImageReference) -> StevedoreResult<ArchiveItem> {
    let inner = reference.inner.as_deref();
    match inner {
        Some(index) if index.starts_with('@') => {
            let n: usize = index[1..].parse().map_err(|_| {
                StevedoreError::InvalidReference(format!("invalid archive index {:?}", index))
            })?;
            items
                .into_iter()
                .nth(n)
                .ok_or_else(|| StevedoreError::ImageUnknown(format!("no image {} in archive", index)))
        }
        Some(_) => {
            let wanted = reference.named.as_ref().map(|n| n.whole()).unwrap_or_default();
            items
                .into_iter()
                .find(|item| {
                    item.repo_tags.iter().any(|t| {
                        crate::image::reference::parse_named(t)
                            .map(|n| n.whole() == wanted)
                            .unwrap_or(false)
                    })
                })
                .ok_or_else(|| StevedoreError::ImageUnknown(format!("{} not in archive", wanted)))
        }
        None => items
            .into_iter()
            .next()
            .ok_or_else(|| StevedoreError::ImageUnknown("archive contains no images".to_string())),
    }
}

fn extract(path: &Path) -> StevedoreResult<TempDir> {
    let dir = tempfile::tempdir()
        .map_err(|e| StevedoreError::io("Failed to create extraction directory", e))?;
    let file = File::open(path)
        .map_err(|e| StevedoreError::io(format!("Failed to open {}", path.display()), e))?;
    tar::Archive::new(file).unpack(dir.path()).map_err(|e| {
        StevedoreError::Image(format!("Failed to extract {}: {}", path.display(), e))
    })?;
    Ok(dir)
}

pub fn inspect(path: &Path) -> StevedoreResult<ArchiveInfo> {
    let extracted = extract(path)?;
    let item = read_items(extracted.path())?
        .into_iter()
        .next()
        .ok_or_else(|| StevedoreError::ImageUnknown("archive contains no images".to_string()))?;
    let (config_digest, _) = digest_file(&extracted.path().join(&item.config))?;
    Ok(ArchiveInfo {
        repo_tags: item.repo_tags,
        config_digest,
    })
}

fn layer_media_type(path: &Path) -> StevedoreResult<&'static str> {
    let mut header = [0u8; 8];
    let mut file = File::open(path)
        .map_err(|e| StevedoreError::io(format!("Failed to open {}", path.display()), e))?;
    let n = file
        .read(&mut header)
        .map_err(|e| StevedoreError::io(format!("Failed to read {}", path.display()), e))?;
    match Compression::detect(&header[..n]) {
        Compression::None => Ok(mt::DOCKER_LAYER),
        Compression::Gzip => Ok(mt::DOCKER_LAYER_GZIP),
        other => Err(StevedoreError::Unsupported(format!(
            "{} compressed layer in docker archive",
            other.as_str()
        ))),
    }
}

pub struct DockerArchiveSource {
    reference: ImageReference,
    extracted: Mutex<Option<TempDir>>,
    root: PathBuf,
    manifest: Vec<u8>,
    /// Digest to file within the extracted archive.
    blobs: HashMap<String, PathBuf>,
}

impl DockerArchiveSource {
    pub fn open(reference: &ImageReference) -> StevedoreResult<Self> {
        let extracted = extract(reference.path()?)?;
        let root = extracted.path().to_path_buf();
        let item = select(read_items(&root)?, reference)?;

        let mut blobs = HashMap::new();
        let config_path = root.join(&item.config);
        let (config_digest, config_size) = digest_file(&config_path)?;
        blobs.insert(config_digest.clone(), config_path);

        let mut layers = Vec::new();
        for layer in &item.layers {
            let path = root.join(layer);
            let (digest, size) = digest_file(&path)?;
            layers.push(Descriptor::new(layer_media_type(&path)?, digest.clone(), size as i64));
            blobs.insert(digest, path);
        }
        let manifest = Manifest::new(
            ManifestType::DockerV2S2,
            Descriptor::new(mt::DOCKER_CONFIG, config_digest, config_size as i64),
            layers,
        );
        debug!(reference = %reference, layers = item.layers.len(), "Opened docker archive");
        Ok(Self {
            reference: reference.clone(),
            extracted: Mutex::new(Some(extracted)),
            root,
            manifest: manifest.to_vec()?,
            blobs,
        })
    }
}

#[async_trait]
impl ImageSource for DockerArchiveSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn manifest(&self, instance: Option<&str>) -> StevedoreResult<(Vec<u8>, String)> {
        if let Some(instance) = instance {
            return Err(StevedoreError::ImageUnknown(format!(
                "docker archives have no manifest lists ({})",
                instance
            )));
        }
        Ok((self.manifest.clone(), mt::DOCKER_MANIFEST.to_string()))
    }

    async fn get_blob(&self, descriptor: &Descriptor, scratch: &Path) -> StevedoreResult<PathBuf> {
        let path = self.blobs.get(&descriptor.digest).ok_or_else(|| {
            StevedoreError::NotFound(format!(
                "blob {} in {}",
                descriptor.digest,
                self.root.display()
            ))
        })?;
        stage_copy(path, scratch, &descriptor.digest)
    }

    async fn close(&self) -> StevedoreResult<()> {
        if let Some(dir) = self.extracted.lock().take() {
            dir.close()
                .map_err(|e| StevedoreError::io("Failed to remove extracted archive", e))?;
        }
        Ok(())
    }
}

pub struct DockerArchiveDestination {
    reference: ImageReference,
    target: PathBuf,
    staging: TempDir,
    item: Mutex<Option<ArchiveItem>>,
}

impl DockerArchiveDestination {
    pub fn create(reference: &ImageReference) -> StevedoreResult<Self> {
        let staging = tempfile::tempdir()
            .map_err(|e| StevedoreError::io("Failed to create archive staging directory", e))?;
        Ok(Self {
            reference: reference.clone(),
            target: reference.path()?.to_path_buf(),
            staging,
            item: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ImageDestination for DockerArchiveDestination {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn supported_manifest_types(&self) -> Vec<ManifestType> {
        vec![ManifestType::DockerV2S2]
    }

    async fn try_reusing_blob(&self, _descriptor: &Descriptor) -> StevedoreResult<Option<Descriptor>> {
        Ok(None)
    }

    async fn put_blob(
        &self,
        path: &Path,
        descriptor: &Descriptor,
        is_config: bool,
    ) -> StevedoreResult<Descriptor> {
        let (digest, size) = digest_file(path)?;
        let suffix = if is_config { "json" } else { "tar" };
        let target = self
            .staging
            .path()
            .join(format!("{}.{}", digest_hex(&digest)?, suffix));
        fs::copy(path, &target)
            .map_err(|e| StevedoreError::io(format!("Failed to stage blob {}", digest), e))?;
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
        if instance.is_some() {
            return Err(StevedoreError::Unsupported(
                "docker archives cannot hold manifest lists".to_string(),
            ));
        }
        let manifest = Manifest::from_slice(manifest)?;
        let layers = manifest
            .layers
            .iter()
            .map(|l| Ok(format!("{}.tar", digest_hex(&l.digest)?)))
            .collect::<StevedoreResult<Vec<_>>>()?;
        let repo_tags = self
            .reference
            .named
            .as_ref()
            .map(|n| vec![n.whole()])
            .unwrap_or_default();
        *self.item.lock() = Some(ArchiveItem {
            config: format!("{}.json", digest_hex(&manifest.config.digest)?),
            repo_tags,
            layers,
        });
        Ok(())
    }

    async fn commit(&self) -> StevedoreResult<()> {
        let item = self.item.lock().clone().ok_or_else(|| {
            StevedoreError::Internal("commit called before a manifest was written".to_string())
        })?;
        atomic_write(
            &self.staging.path().join(MANIFEST_FILE),
            &serde_json::to_vec(&vec![item])?,
        )?;
        write_archive(self.staging.path(), &self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::apply::tests::{TestEntry, build_tar};

    #[tokio::test]
    async fn test_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("saved.tar");
        let reference = ImageReference::parse(&format!(
            "docker-archive:{}:localhost/app:1",
            target.display()
        ))
        .unwrap();

        let dest = DockerArchiveDestination::create(&reference).unwrap();
        let layer_path = dir.path().join("layer");
        fs::write(&layer_path, build_tar(&[TestEntry::File("a", b"data")])).unwrap();
        let layer = dest
            .put_blob(&layer_path, &Descriptor::new(mt::DOCKER_LAYER, "", -1), false)
            .await
            .unwrap();
        let config_path = dir.path().join("config");
        fs::write(&config_path, b"{}").unwrap();
        let config = dest
            .put_blob(&config_path, &Descriptor::new(mt::DOCKER_CONFIG, "", -1), true)
            .await
            .unwrap();
        let manifest = Manifest::new(ManifestType::DockerV2S2, config.clone(), vec![layer.clone()]);
        dest.put_manifest(&manifest.to_vec().unwrap(), mt::DOCKER_MANIFEST, None)
            .await
            .unwrap();
        dest.commit().await.unwrap();

        let info = inspect(&target).unwrap();
        assert_eq!(info.repo_tags, vec!["localhost/app:1".to_string()]);
        assert_eq!(info.config_digest, config.digest);

        let source = DockerArchiveSource::open(&reference).unwrap();
        let (bytes, _) = source.manifest(None).await.unwrap();
        let read = Manifest::from_slice(&bytes).unwrap();
        assert_eq!(read.layers[0].digest, layer.digest);
        assert_eq!(read.layers[0].media_type, mt::DOCKER_LAYER);
        source.close().await.unwrap();
    }
}
