//! Manifest lists (OCI image indexes / Docker manifest lists) built from
//! existing images.
//!
//! A list is kept in the store as an image with no layers. Its big-data
//! holds the index under `manifest` and, under [`INSTANCES_KEY`], where each
//! instance's manifest and blobs can be read from when the list is pushed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing::{debug, info, warn};

use super::config::ImageConfig;
use super::copy::{CopyOptions, CopyReport, copy_image};
use super::manifest::{Descriptor, DocumentKind, Index, Manifest, ManifestType, Platform, detect_media_type};
use super::policy::Policy;
use super::reference::{ImageReference, parse_named};
use super::transports::{ImageSource, open_destination, open_source};
use crate::storage::{MANIFEST_KEY, Store};
use crate::system::SystemContext;
use crate::util::digest::sha256_digest;
use crate::util::random_id;

/// Big-data key of the instance → source map.
pub const INSTANCES_KEY: &str = "instances.json";

/// Where an instance's content lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSource {
    /// Transport-qualified reference the instance was added from.
    pub reference: String,
    /// Digest of the instance inside that reference, when it is a list.
    #[serde(default)]
    pub instance: Option<String>,
}

/// Which blobs a push sends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PushSelection {
    /// Send every blob of every instance.
    #[default]
    All,
    /// Send only blobs the destination reports missing.
    Specific,
}

/// Fields `annotate` may change on an instance.
#[derive(Clone, Debug, Default)]
pub struct InstanceAnnotations {
    pub os: Option<String>,
    pub architecture: Option<String>,
    pub variant: Option<String>,
    pub os_version: Option<String>,
    pub features: Vec<String>,
    pub os_features: Vec<String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct ManifestList {
    id: String,
    index: Index,
    instances: BTreeMap<String, InstanceSource>,
    store: Arc<dyn Store>,
}

fn parse_source(spec: &str) -> StevedoreResult<ImageReference> {
    ImageReference::parse(spec).or_else(|_| ImageReference::storage(spec))
}

async fn platform_of(source: &dyn ImageSource, manifest: &Manifest) -> StevedoreResult<Platform> {
    let scratch = tempfile::tempdir()
        .map_err(|e| StevedoreError::io("Failed to create scratch directory", e))?;
    let path = source.get_blob(&manifest.config, scratch.path()).await?;
    let bytes = std::fs::read(&path)
        .map_err(|e| StevedoreError::io(format!("Failed to read {}", path.display()), e))?;
    Ok(ImageConfig::from_slice(&bytes)?.platform())
}

impl ManifestList {
    /// Create an empty list named `name`.
    pub fn create(store: Arc<dyn Store>, name: &str, manifest_type: ManifestType) -> StevedoreResult<Self> {
        let name = parse_named(name)?.whole();
        let list = Self {
            id: random_id(),
            index: Index::new(manifest_type),
            instances: BTreeMap::new(),
            store,
        };
        list.store.create_image(&list.id, None, &[name.clone()])?;
        list.save()?;
        info!(list = %name, id = %list.id, "Created manifest list");
        Ok(list)
    }

    /// Load a list by name or ID.
    pub fn load(store: Arc<dyn Store>, name: &str) -> StevedoreResult<Self> {
        let image = crate::image::pull::find_local_image(store.as_ref(), name)?;
        let instances = match store.image_big_data(&image.id, INSTANCES_KEY) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(StevedoreError::NotFound(_)) => {
                return Err(StevedoreError::InvalidArgument(format!(
                    "{} is not a manifest list",
                    name
                )));
            }
            Err(e) => return Err(e),
        };
        let index = Index::from_slice(&store.image_big_data(&image.id, MANIFEST_KEY)?)?;
        Ok(Self {
            id: image.id,
            index,
            instances,
            store,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn instances(&self) -> &BTreeMap<String, InstanceSource> {
        &self.instances
    }

    pub fn save(&self) -> StevedoreResult<()> {
        self.store
            .set_image_big_data(&self.id, INSTANCES_KEY, &serde_json::to_vec(&self.instances)?)?;
        self.store
            .set_image_big_data(&self.id, MANIFEST_KEY, &self.index.to_vec()?)
    }

    /// Add the image at `spec`. When it is itself a list, add either every
    /// instance (`all`) or the one matching the host platform. Returns the
    /// digests added.
    pub async fn add(
        &mut self,
        context: &SystemContext,
        spec: &str,
        all: bool,
    ) -> StevedoreResult<Vec<String>> {
        let reference = parse_source(spec)?;
        let source = open_source(&reference, context, &self.store)?;
        let result = self.add_from(source.as_ref(), &reference, all).await;
        if let Err(e) = source.close().await {
            warn!(source = %reference, error = %e, "Failed to close image source");
        }
        let added = result?;
        self.save()?;
        Ok(added)
    }

    async fn add_from(
        &mut self,
        source: &dyn ImageSource,
        reference: &ImageReference,
        all: bool,
    ) -> StevedoreResult<Vec<String>> {
        let (bytes, media_type) = source.manifest(None).await?;
        let entries: Vec<(Descriptor, Option<String>)> = match detect_media_type(&bytes)?.0 {
            DocumentKind::Index => {
                let index = Index::from_slice(&bytes)?;
                let selected: Vec<Descriptor> = if all {
                    index.manifests.clone()
                } else {
                    let host = Platform::host();
                    index.select(&host).cloned().into_iter().collect()
                };
                if selected.is_empty() {
                    return Err(StevedoreError::ImageUnknown(format!(
                        "no instance of {} matches this platform",
                        reference
                    )));
                }
                selected
                    .into_iter()
                    .map(|d| {
                        let digest = d.digest.clone();
                        (d, Some(digest))
                    })
                    .collect()
            }
            DocumentKind::Manifest => {
                let manifest = Manifest::from_slice(&bytes)?;
                let mut descriptor =
                    Descriptor::new(media_type, sha256_digest(&bytes), bytes.len() as i64);
                descriptor.platform = Some(platform_of(source, &manifest).await?);
                vec![(descriptor, None)]
            }
        };

        let mut added = Vec::new();
        for (descriptor, instance) in entries {
            let digest = descriptor.digest.clone();
            self.index.manifests.retain(|d| d.digest != digest);
            self.index.manifests.push(descriptor);
            self.instances.insert(
                digest.clone(),
                InstanceSource {
                    reference: reference.to_string(),
                    instance,
                },
            );
            debug!(list = %self.id, instance = %digest, "Added instance");
            added.push(digest);
        }
        Ok(added)
    }

    pub fn remove(&mut self, digest: &str) -> StevedoreResult<()> {
        let before = self.index.manifests.len();
        self.index.manifests.retain(|d| d.digest != digest);
        if self.index.manifests.len() == before {
            return Err(StevedoreError::NotFound(format!(
                "instance {} in list {}",
                digest, self.id
            )));
        }
        self.instances.remove(digest);
        self.save()
    }

    pub fn annotate(&mut self, digest: &str, changes: &InstanceAnnotations) -> StevedoreResult<()> {
        let entry = self
            .index
            .manifests
            .iter_mut()
            .find(|d| d.digest == digest)
            .ok_or_else(|| {
                StevedoreError::NotFound(format!("instance {} in list {}", digest, self.id))
            })?;
        let platform = entry.platform.get_or_insert_with(Platform::default);
        if let Some(os) = &changes.os {
            platform.os = os.clone();
        }
        if let Some(arch) = &changes.architecture {
            platform.architecture = arch.clone();
        }
        if let Some(variant) = &changes.variant {
            platform.variant = Some(variant.clone());
        }
        if let Some(os_version) = &changes.os_version {
            platform.os_version = Some(os_version.clone());
        }
        if !changes.features.is_empty() {
            platform.features = changes.features.clone();
        }
        if !changes.os_features.is_empty() {
            platform.os_features = changes.os_features.clone();
        }
        entry
            .annotations
            .extend(changes.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.save()
    }

    /// Push the list and its instances to `destination`.
    pub async fn push(
        &self,
        context: &SystemContext,
        policy: &Policy,
        destination: &ImageReference,
        selection: PushSelection,
        manifest_type: Option<ManifestType>,
    ) -> StevedoreResult<CopyReport> {
        let source = ListSource::open(self, context).await?;
        let dest = open_destination(destination, context, &self.store)?;
        let options = CopyOptions {
            manifest_type,
            all_instances: true,
            reuse_blobs: selection == PushSelection::Specific,
            scratch: Some(self.store.tmp_dir()),
            ..CopyOptions::default()
        };
        let result = copy_image(policy, &source, dest.as_ref(), &options).await;
        source.close().await?;
        result
    }
}

/// Presents a stored list and the images it references as one source.
struct ListSource {
    reference: ImageReference,
    index_bytes: Vec<u8>,
    sources: Vec<Box<dyn ImageSource>>,
    /// Instance digest → (source position, digest inside that source).
    instances: HashMap<String, (usize, Option<String>)>,
    /// Blob digest → source position.
    blobs: HashMap<String, usize>,
}

impl ListSource {
    async fn open(list: &ManifestList, context: &SystemContext) -> StevedoreResult<Self> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut sources: Vec<Box<dyn ImageSource>> = Vec::new();
        let mut instances = HashMap::new();
        let mut blobs = HashMap::new();

        for entry in &list.index.manifests {
            let origin = list.instances.get(&entry.digest).ok_or_else(|| {
                StevedoreError::Internal(format!("list {} has no source for {}", list.id, entry.digest))
            })?;
            let position = match positions.get(&origin.reference) {
                Some(p) => *p,
                None => {
                    let reference = parse_source(&origin.reference)?;
                    sources.push(open_source(&reference, context, &list.store)?);
                    positions.insert(origin.reference.clone(), sources.len() - 1);
                    sources.len() - 1
                }
            };
            let (bytes, _) = sources[position].manifest(origin.instance.as_deref()).await?;
            let manifest = Manifest::from_slice(&bytes)?;
            blobs.insert(manifest.config.digest.clone(), position);
            for layer in &manifest.layers {
                blobs.insert(layer.digest.clone(), position);
            }
            instances.insert(entry.digest.clone(), (position, origin.instance.clone()));
        }

        Ok(Self {
            reference: ImageReference::storage(&list.id)?,
            index_bytes: list.index.to_vec()?,
            sources,
            instances,
            blobs,
        })
    }
}

#[async_trait]
impl ImageSource for ListSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn manifest(&self, instance: Option<&str>) -> StevedoreResult<(Vec<u8>, String)> {
        let Some(digest) = instance else {
            let (_, media_type) = detect_media_type(&self.index_bytes)?;
            return Ok((self.index_bytes.clone(), media_type));
        };
        let (position, inner) = self
            .instances
            .get(digest)
            .ok_or_else(|| StevedoreError::NotFound(format!("instance {}", digest)))?;
        self.sources[*position].manifest(inner.as_deref()).await
    }

    async fn get_blob(&self, descriptor: &Descriptor, scratch: &Path) -> StevedoreResult<PathBuf> {
        let position = self
            .blobs
            .get(&descriptor.digest)
            .ok_or_else(|| StevedoreError::NotFound(format!("blob {}", descriptor.digest)))?;
        self.sources[*position].get_blob(descriptor, scratch).await
    }

    async fn close(&self) -> StevedoreResult<()> {
        for source in &self.sources {
            if let Err(e) = source.close().await {
                warn!(source = %source.reference(), error = %e, "Failed to close image source");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::apply::tests::{TestEntry, build_tar};
    use crate::storage::LocalStore;
    use stevedore_shared::constants::media_types as mt;

    fn write_dir_image(root: &Path, arch: &str) -> String {
        std::fs::create_dir_all(root).unwrap();
        let layer = build_tar(&[TestEntry::File(arch, b"bits")]);
        let layer_digest = sha256_digest(&layer);
        std::fs::write(root.join(&layer_digest[7..]), &layer).unwrap();
        let config = format!(
            r#"{{"architecture":"{}","os":"linux","rootfs":{{"type":"layers","diff_ids":["{}"]}}}}"#,
            arch, layer_digest
        );
        let config_digest = sha256_digest(config.as_bytes());
        std::fs::write(root.join(&config_digest[7..]), &config).unwrap();
        let manifest = Manifest::new(
            ManifestType::OciV1,
            Descriptor::new(mt::OCI_CONFIG, config_digest, config.len() as i64),
            vec![Descriptor::new(mt::OCI_LAYER, layer_digest, layer.len() as i64)],
        );
        let bytes = manifest.to_vec().unwrap();
        std::fs::write(root.join("manifest.json"), &bytes).unwrap();
        sha256_digest(&bytes)
    }

    fn setup() -> (tempfile::TempDir, SystemContext, Arc<dyn Store>) {
        let dir = tempfile::tempdir().unwrap();
        let context = SystemContext::with_root(dir.path());
        let store: Arc<dyn Store> = Arc::new(LocalStore::open(context.layout()).unwrap());
        (dir, context, store)
    }

    #[tokio::test]
    async fn test_create_add_annotate_remove() {
        let (dir, context, store) = setup();
        let amd = write_dir_image(&dir.path().join("amd"), "amd64");
        let arm = write_dir_image(&dir.path().join("arm"), "arm64");

        let mut list = ManifestList::create(store.clone(), "localhost/multi:1", ManifestType::OciV1).unwrap();
        list.add(&context, &format!("dir:{}", dir.path().join("amd").display()), false)
            .await
            .unwrap();
        list.add(&context, &format!("dir:{}", dir.path().join("arm").display()), false)
            .await
            .unwrap();
        assert_eq!(list.index().manifests.len(), 2);
        let arm_entry = list.index().manifests.iter().find(|d| d.digest == arm).unwrap();
        assert_eq!(arm_entry.platform.as_ref().unwrap().architecture, "arm64");

        list.annotate(
            &arm,
            &InstanceAnnotations {
                variant: Some("v8".to_string()),
                annotations: [("team".to_string(), "infra".to_string())].into(),
                ..InstanceAnnotations::default()
            },
        )
        .unwrap();

        let reloaded = ManifestList::load(store.clone(), "localhost/multi:1").unwrap();
        let entry = reloaded.index().manifests.iter().find(|d| d.digest == arm).unwrap();
        assert_eq!(entry.platform.as_ref().unwrap().variant.as_deref(), Some("v8"));
        assert_eq!(entry.annotations.get("team").map(String::as_str), Some("infra"));

        let mut reloaded = reloaded;
        reloaded.remove(&amd).unwrap();
        assert!(reloaded.remove(&amd).is_err());
        assert_eq!(reloaded.index().manifests.len(), 1);
    }

    #[tokio::test]
    async fn test_push_to_oci_layout() {
        let (dir, context, store) = setup();
        write_dir_image(&dir.path().join("amd"), "amd64");
        write_dir_image(&dir.path().join("arm"), "arm64");
        let mut list = ManifestList::create(store.clone(), "localhost/multi:2", ManifestType::OciV1).unwrap();
        for arch in ["amd", "arm"] {
            list.add(&context, &format!("dir:{}", dir.path().join(arch).display()), false)
                .await
                .unwrap();
        }

        let target = ImageReference::parse(&format!("dir:{}", dir.path().join("pushed").display())).unwrap();
        let report = list
            .push(&context, &Policy::accept_anything(), &target, PushSelection::All, None)
            .await
            .unwrap();
        assert!(report.config_digest.is_none());
        let pushed = Index::from_slice(&report.manifest).unwrap();
        assert_eq!(pushed.manifests.len(), 2);
        for entry in &pushed.manifests {
            let file = dir.path().join("pushed").join(format!("{}.manifest.json", &entry.digest[7..]));
            assert!(file.exists(), "missing {}", file.display());
        }
    }

    #[test]
    fn test_load_plain_image_is_not_a_list() {
        let (_dir, _context, store) = setup();
        store
            .create_image(&"c".repeat(64), None, &["localhost/plain:1".to_string()])
            .unwrap();
        let err = ManifestList::load(store, "localhost/plain:1").unwrap_err();
        assert!(matches!(err, StevedoreError::InvalidArgument(_)));
    }
}
