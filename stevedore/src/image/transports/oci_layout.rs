//! `oci:` layout directories and `oci-archive:` tarballs of them.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stevedore_shared::constants::annotations::REF_NAME;
use stevedore_shared::constants::media_types as mt;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tempfile::TempDir;
use tracing::debug;

use super::{ImageDestination, ImageSource, stage_copy};
use crate::image::manifest::{Descriptor, DocumentKind, Index, Manifest, ManifestType, detect_media_type};
use crate::image::reference::ImageReference;
use crate::util::digest::{digest_file, digest_hex, sha256_digest};
use crate::util::fs::atomic_write;

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs/sha256";

#[derive(Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// What a layout says about the image a reference selects.
#[derive(Clone, Debug)]
pub struct LayoutInfo {
    pub ref_name: Option<String>,
    pub manifest_digest: String,
    pub config_digest: String,
}

fn blob_path(root: &Path, digest: &str) -> StevedoreResult<PathBuf> {
    Ok(root.join(BLOBS_DIR).join(digest_hex(digest)?))
}

fn read_index(root: &Path) -> StevedoreResult<Index> {
    let path = root.join(INDEX_FILE);
    let bytes = fs::read(&path)
        .map_err(|e| StevedoreError::io(format!("Failed to read {}", path.display()), e))?;
    Index::from_slice(&bytes)
}

/// Pick the index entry named by `inner`, or the only entry.
fn select(index: &Index, inner: Option<&str>) -> StevedoreResult<Descriptor> {
    match inner {
        Some(name) => index
            .manifests
            .iter()
            .find(|d| d.annotations.get(REF_NAME).map(String::as_str) == Some(name))
            .cloned()
            .ok_or_else(|| StevedoreError::ImageUnknown(format!("no image named {:?} in layout", name))),
        None => match index.manifests.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(StevedoreError::ImageUnknown("layout contains no images".to_string())),
            _ => Err(StevedoreError::InvalidReference(
                "layout contains several images; name one with :<ref>".to_string(),
            )),
        },
    }
}

fn inspect_root(root: &Path, inner: Option<&str>) -> StevedoreResult<LayoutInfo> {
    let index = read_index(root)?;
    let descriptor = select(&index, inner)?;
    let bytes = fs::read(blob_path(root, &descriptor.digest)?)
        .map_err(|e| StevedoreError::io(format!("Failed to read manifest {}", descriptor.digest), e))?;
    let config_digest = match detect_media_type(&bytes)?.0 {
        DocumentKind::Manifest => Manifest::from_slice(&bytes)?.config.digest,
        DocumentKind::Index => descriptor.digest.clone(),
    };
    Ok(LayoutInfo {
        ref_name: descriptor.annotations.get(REF_NAME).cloned(),
        manifest_digest: descriptor.digest,
        config_digest,
    })
}

pub fn inspect_dir(path: &Path, inner: Option<&str>) -> StevedoreResult<LayoutInfo> {
    inspect_root(path, inner)
}

pub fn inspect_archive(path: &Path, inner: Option<&str>) -> StevedoreResult<LayoutInfo> {
    let extracted = extract_archive(path)?;
    inspect_root(extracted.path(), inner)
}

fn extract_archive(path: &Path) -> StevedoreResult<TempDir> {
    let dir = tempfile::tempdir()
        .map_err(|e| StevedoreError::io("Failed to create extraction directory", e))?;
    let file = File::open(path)
        .map_err(|e| StevedoreError::io(format!("Failed to open {}", path.display()), e))?;
    tar::Archive::new(file).unpack(dir.path()).map_err(|e| {
        StevedoreError::Image(format!("Failed to extract {}: {}", path.display(), e))
    })?;
    Ok(dir)
}

/// Write a directory's contents as a tarball at `target`.
pub(crate) fn write_archive(root: &Path, target: &Path) -> StevedoreResult<()> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let staged = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StevedoreError::io(format!("Failed to stage {}", target.display()), e))?;
    let mut builder = tar::Builder::new(staged);
    builder.follow_symlinks(false);
    let mut entries: Vec<_> = fs::read_dir(root)
        .map_err(|e| StevedoreError::io(format!("Failed to list {}", root.display()), e))?
        .flatten()
        .collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        let result = if entry.path().is_dir() {
            builder.append_dir_all(&name, entry.path())
        } else {
            builder.append_path_with_name(entry.path(), &name)
        };
        result.map_err(|e| StevedoreError::io(format!("Failed to archive {:?}", name), e))?;
    }
    let staged = builder
        .into_inner()
        .map_err(|e| StevedoreError::io("Failed to finish archive", e))?;
    staged
        .persist(target)
        .map_err(|e| StevedoreError::io(format!("Failed to write {}", target.display()), e.error))?;
    Ok(())
}

pub struct OciLayoutSource {
    reference: ImageReference,
    root: PathBuf,
    descriptor: Descriptor,
    extracted: Mutex<Option<TempDir>>,
}

impl OciLayoutSource {
    pub fn open_dir(reference: &ImageReference) -> StevedoreResult<Self> {
        let root = reference.path()?.to_path_buf();
        Self::open_root(reference, root, None)
    }

    pub fn open_archive(reference: &ImageReference) -> StevedoreResult<Self> {
        let extracted = extract_archive(reference.path()?)?;
        let root = extracted.path().to_path_buf();
        Self::open_root(reference, root, Some(extracted))
    }

    fn open_root(
        reference: &ImageReference,
        root: PathBuf,
        extracted: Option<TempDir>,
    ) -> StevedoreResult<Self> {
        let index = read_index(&root)?;
        let descriptor = select(&index, reference.inner.as_deref())?;
        debug!(reference = %reference, digest = %descriptor.digest, "Opened OCI layout source");
        Ok(Self {
            reference: reference.clone(),
            root,
            descriptor,
            extracted: Mutex::new(extracted),
        })
    }

    fn read_blob(&self, digest: &str) -> StevedoreResult<Vec<u8>> {
        let path = blob_path(&self.root, digest)?;
        fs::read(&path).map_err(|e| StevedoreError::io(format!("Failed to read blob {}", digest), e))
    }
}

#[async_trait]
impl ImageSource for OciLayoutSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn manifest(&self, instance: Option<&str>) -> StevedoreResult<(Vec<u8>, String)> {
        match instance {
            None => {
                let bytes = self.read_blob(&self.descriptor.digest)?;
                Ok((bytes, self.descriptor.media_type.clone()))
            }
            Some(digest) => {
                let bytes = self.read_blob(digest)?;
                let (_, media_type) = detect_media_type(&bytes)?;
                Ok((bytes, media_type))
            }
        }
    }

    async fn get_blob(&self, descriptor: &Descriptor, scratch: &Path) -> StevedoreResult<PathBuf> {
        stage_copy(&blob_path(&self.root, &descriptor.digest)?, scratch, &descriptor.digest)
    }

    async fn close(&self) -> StevedoreResult<()> {
        if let Some(dir) = self.extracted.lock().take() {
            dir.close()
                .map_err(|e| StevedoreError::io("Failed to remove extracted layout", e))?;
        }
        Ok(())
    }
}

pub struct OciLayoutDestination {
    reference: ImageReference,
    root: PathBuf,
    /// Archive to write on commit, with the staging directory it is built in.
    archive: Option<(PathBuf, TempDir)>,
    top: Mutex<Option<Descriptor>>,
}

impl OciLayoutDestination {
    pub fn create_dir(reference: &ImageReference) -> StevedoreResult<Self> {
        let root = reference.path()?.to_path_buf();
        init_layout(&root)?;
        Ok(Self {
            reference: reference.clone(),
            root,
            archive: None,
            top: Mutex::new(None),
        })
    }

    pub fn create_archive(reference: &ImageReference) -> StevedoreResult<Self> {
        let target = reference.path()?.to_path_buf();
        let staging = tempfile::tempdir()
            .map_err(|e| StevedoreError::io("Failed to create layout staging directory", e))?;
        let root = staging.path().to_path_buf();
        init_layout(&root)?;
        Ok(Self {
            reference: reference.clone(),
            root,
            archive: Some((target, staging)),
            top: Mutex::new(None),
        })
    }

    fn write_blob(&self, digest: &str, data: &[u8]) -> StevedoreResult<()> {
        atomic_write(&blob_path(&self.root, digest)?, data)
    }
}

fn init_layout(root: &Path) -> StevedoreResult<()> {
    fs::create_dir_all(root.join(BLOBS_DIR))
        .map_err(|e| StevedoreError::io(format!("Failed to create layout {}", root.display()), e))?;
    let marker = root.join(LAYOUT_FILE);
    if !marker.exists() {
        let bytes = serde_json::to_vec(&LayoutMarker {
            image_layout_version: "1.0.0".to_string(),
        })?;
        atomic_write(&marker, &bytes)?;
    }
    let index = root.join(INDEX_FILE);
    if !index.exists() {
        let mut empty = Index::new(ManifestType::OciV1);
        empty.media_type = Some(mt::OCI_INDEX.to_string());
        atomic_write(&index, &empty.to_vec()?)?;
    }
    Ok(())
}

#[async_trait]
impl ImageDestination for OciLayoutDestination {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn supported_manifest_types(&self) -> Vec<ManifestType> {
        vec![ManifestType::OciV1, ManifestType::DockerV2S2]
    }

    async fn try_reusing_blob(&self, descriptor: &Descriptor) -> StevedoreResult<Option<Descriptor>> {
        if descriptor.size < 0 {
            return Ok(None);
        }
        let exists = blob_path(&self.root, &descriptor.digest)?.exists();
        Ok(exists.then(|| descriptor.clone()))
    }

    async fn put_blob(
        &self,
        path: &Path,
        descriptor: &Descriptor,
        _is_config: bool,
    ) -> StevedoreResult<Descriptor> {
        let (digest, size) = digest_file(path)?;
        let target = blob_path(&self.root, &digest)?;
        if !target.exists() {
            fs::copy(path, &target)
                .map_err(|e| StevedoreError::io(format!("Failed to store blob {}", digest), e))?;
        }
        Ok(Descriptor {
            digest,
            size: size as i64,
            ..descriptor.clone()
        })
    }

    async fn put_manifest(
        &self,
        manifest: &[u8],
        media_type: &str,
        instance: Option<&str>,
    ) -> StevedoreResult<()> {
        let digest = sha256_digest(manifest);
        self.write_blob(&digest, manifest)?;
        if instance.is_none() {
            let mut descriptor = Descriptor::new(media_type, digest, manifest.len() as i64);
            if let Some(name) = &self.reference.inner {
                descriptor.annotations.insert(REF_NAME.to_string(), name.clone());
            }
            *self.top.lock() = Some(descriptor);
        }
        Ok(())
    }

    async fn commit(&self) -> StevedoreResult<()> {
        let top = self.top.lock().clone().ok_or_else(|| {
            StevedoreError::Internal("commit called before a manifest was written".to_string())
        })?;
        let mut index = read_index(&self.root)?;
        match top.annotations.get(REF_NAME) {
            Some(name) => index
                .manifests
                .retain(|d| d.annotations.get(REF_NAME) != Some(name)),
            None => index.manifests.retain(|d| d.digest != top.digest),
        }
        index.manifests.push(top);
        atomic_write(&self.root.join(INDEX_FILE), &index.to_vec()?)?;

        if let Some((target, _)) = &self.archive {
            write_archive(&self.root, target)?;
        }
        debug!(reference = %self.reference, "Committed OCI layout");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_layout_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = dir.path().join("layout");
        let reference = ImageReference::parse(&format!("oci:{}:v1", layout.display())).unwrap();

        let dest = OciLayoutDestination::create_dir(&reference).unwrap();
        let config_path = dir.path().join("config");
        fs::write(&config_path, b"{}").unwrap();
        let config = dest
            .put_blob(&config_path, &Descriptor::new(mt::OCI_CONFIG, "", -1), true)
            .await
            .unwrap();
        assert_eq!(config.digest, sha256_digest(b"{}"));

        let manifest = Manifest::new(ManifestType::OciV1, config.clone(), vec![]);
        dest.put_manifest(&manifest.to_vec().unwrap(), mt::OCI_MANIFEST, None)
            .await
            .unwrap();
        dest.commit().await.unwrap();

        let info = inspect_dir(&layout, Some("v1")).unwrap();
        assert_eq!(info.ref_name.as_deref(), Some("v1"));
        assert_eq!(info.config_digest, config.digest);

        let source = OciLayoutSource::open_dir(&reference).unwrap();
        let (bytes, media_type) = source.manifest(None).await.unwrap();
        assert_eq!(media_type, mt::OCI_MANIFEST);
        assert_eq!(Manifest::from_slice(&bytes).unwrap().layers.len(), 0);
    }

    #[tokio::test]
    async fn test_archive_is_written_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("img.tar");
        let reference = ImageReference::parse(&format!("oci-archive:{}", target.display())).unwrap();
        let dest = OciLayoutDestination::create_archive(&reference).unwrap();
        let config_path = dir.path().join("config");
        fs::write(&config_path, b"{\"os\":\"linux\"}").unwrap();
        let config = dest
            .put_blob(&config_path, &Descriptor::new(mt::OCI_CONFIG, "", -1), true)
            .await
            .unwrap();
        let manifest = Manifest::new(ManifestType::OciV1, config, vec![]);
        dest.put_manifest(&manifest.to_vec().unwrap(), mt::OCI_MANIFEST, None)
            .await
            .unwrap();
        dest.commit().await.unwrap();
        assert!(target.exists());

        let info = inspect_archive(&target, None).unwrap();
        assert!(info.ref_name.is_none());
    }
}
