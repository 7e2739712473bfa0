//! `containers-storage:` transport: images kept in the local [`Store`].
//!
//! Layers are stored uncompressed, so the destination records a manifest
//! that describes them as such. Its digest can differ from the manifest the
//! image was copied with.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing::{debug, info};

use super::{ImageDestination, ImageSource, scratch_blob_path};
use crate::archive::Compression;
use crate::image::manifest::{
    Descriptor, DocumentKind, Manifest, ManifestType, detect_media_type, layer_media_type,
};
use crate::image::reference::ImageReference;
use crate::storage::{CONFIG_KEY, ImageRecord, LayerRecord, MANIFEST_KEY, Store, layer_chain};
use crate::util::digest::{SHA256_PREFIX, digest_hex, sha256_digest};

/// Big-data key of a manifest-list instance.
pub fn instance_key(digest: &str) -> String {
    format!("{}-{}", MANIFEST_KEY, digest)
}

/// Descriptor digest standing in for a store layer that is not re-read.
pub fn fake_layer_digest(layer_id: &str) -> String {
    format!("{}{}", SHA256_PREFIX, layer_id)
}

fn lookup_image(store: &dyn Store, reference: &ImageReference) -> StevedoreResult<ImageRecord> {
    match (&reference.id, &reference.named) {
        (Some(id), _) => store.image(id),
        (None, Some(named)) => store.image(&named.whole()),
        (None, None) => Err(StevedoreError::InvalidReference(reference.to_string())),
    }
}

pub struct StorageSource {
    reference: ImageReference,
    store: Arc<dyn Store>,
    image: ImageRecord,
}

impl StorageSource {
    pub fn open(reference: &ImageReference, store: Arc<dyn Store>) -> StevedoreResult<Self> {
        let image = lookup_image(store.as_ref(), reference)?;
        Ok(Self {
            reference: reference.clone(),
            store,
            image,
        })
    }

    fn find_layer(&self, digest: &str) -> StevedoreResult<LayerRecord> {
        layer_chain(self.store.as_ref(), self.image.top_layer.as_deref())?
            .into_iter()
            .find(|l| {
                l.diff_digest == digest
                    || l.compressed_digest.as_deref() == Some(digest)
                    || fake_layer_digest(&l.id) == digest
            })
            .ok_or_else(|| StevedoreError::LayerUnknown(format!("{} in image {}", digest, self.image.id)))
    }
}

#[async_trait]
impl ImageSource for StorageSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn manifest(&self, instance: Option<&str>) -> StevedoreResult<(Vec<u8>, String)> {
        let key = match instance {
            Some(digest) => instance_key(digest),
            None => MANIFEST_KEY.to_string(),
        };
        let bytes = self.store.image_big_data(&self.image.id, &key)?;
        let (_, media_type) = detect_media_type(&bytes)?;
        Ok((bytes, media_type))
    }

    async fn get_blob(&self, descriptor: &Descriptor, scratch: &Path) -> StevedoreResult<PathBuf> {
        let target = scratch_blob_path(scratch, &descriptor.digest)?;
        let config = self.store.image_big_data(&self.image.id, CONFIG_KEY).ok();
        if let Some(config) = config.filter(|c| sha256_digest(c) == descriptor.digest) {
            std::fs::write(&target, config)
                .map_err(|e| StevedoreError::io("Failed to stage config", e))?;
            return Ok(target);
        }
        let layer = self.find_layer(&descriptor.digest)?;
        let mut diff = self.store.diff(&layer.id)?;
        let mut file = File::create(&target)
            .map_err(|e| StevedoreError::io(format!("Failed to create {}", target.display()), e))?;
        io::copy(&mut diff, &mut file)
            .map_err(|e| StevedoreError::io(format!("Failed to stage layer {}", layer.id), e))?;
        Ok(target)
    }

    async fn close(&self) -> StevedoreResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Pending {
    top: Option<String>,
    layers: Vec<LayerRecord>,
    config: Option<Vec<u8>>,
    manifest: Option<Vec<u8>>,
    instances: Vec<(String, Vec<u8>)>,
}

pub struct StorageDestination {
    reference: ImageReference,
    store: Arc<dyn Store>,
    names: Vec<String>,
    pending: Mutex<Pending>,
}

impl StorageDestination {
    pub fn new(reference: &ImageReference, store: Arc<dyn Store>) -> StevedoreResult<Self> {
        let names = reference.named.iter().map(|n| n.whole()).collect();
        Ok(Self {
            reference: reference.clone(),
            store,
            names,
            pending: Mutex::new(Pending::default()),
        })
    }

    fn use_layer(&self, layer: LayerRecord) {
        let mut pending = self.pending.lock();
        pending.top = Some(layer.id.clone());
        pending.layers.push(layer);
    }

    fn store_image(&self, id: &str, top_layer: Option<&str>) -> StevedoreResult<()> {
        match self.store.create_image(id, top_layer, &self.names) {
            Ok(_) => Ok(()),
            Err(StevedoreError::NameInUse(_)) => {
                debug!(image = %id, "Image already stored, updating names");
                self.store.add_image_names(id, &self.names)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ImageDestination for StorageDestination {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn supported_manifest_types(&self) -> Vec<ManifestType> {
        vec![ManifestType::OciV1, ManifestType::DockerV2S2]
    }

    async fn try_reusing_blob(&self, descriptor: &Descriptor) -> StevedoreResult<Option<Descriptor>> {
        let top = self.pending.lock().top.clone();
        if descriptor.size < 0 {
            if let Ok(id) = digest_hex(&descriptor.digest) {
                if let Ok(layer) = self.store.layer(id) {
                    if layer.parent == top {
                        self.use_layer(layer);
                        return Ok(Some(descriptor.clone()));
                    }
                }
            }
        }
        let found = self.store.layers()?.into_iter().find(|l| {
            l.parent == top
                && (l.diff_digest == descriptor.digest
                    || l.compressed_digest.as_deref() == Some(descriptor.digest.as_str()))
        });
        match found {
            Some(layer) => {
                debug!(layer = %layer.id, digest = %descriptor.digest, "Reusing stored layer");
                self.use_layer(layer);
                Ok(Some(descriptor.clone()))
            }
            None => Ok(None),
        }
    }

    async fn put_blob(
        &self,
        path: &Path,
        descriptor: &Descriptor,
        is_config: bool,
    ) -> StevedoreResult<Descriptor> {
        if is_config {
            let bytes = std::fs::read(path)
                .map_err(|e| StevedoreError::io(format!("Failed to read {}", path.display()), e))?;
            let stored = Descriptor {
                digest: sha256_digest(&bytes),
                size: bytes.len() as i64,
                ..descriptor.clone()
            };
            self.pending.lock().config = Some(bytes);
            return Ok(stored);
        }

        let top = self.pending.lock().top.clone();
        let mut file = File::open(path)
            .map_err(|e| StevedoreError::io(format!("Failed to open {}", path.display()), e))?;
        let compressed = (descriptor.size >= 0).then_some(descriptor.digest.as_str());
        let layer = self.store.put_layer(top.as_deref(), &mut file, compressed)?;
        let stored = Descriptor {
            size: if descriptor.size >= 0 {
                descriptor.size
            } else {
                layer.diff_size as i64
            },
            ..descriptor.clone()
        };
        self.use_layer(layer);
        Ok(stored)
    }

    async fn put_manifest(
        &self,
        manifest: &[u8],
        _media_type: &str,
        instance: Option<&str>,
    ) -> StevedoreResult<()> {
        let mut pending = self.pending.lock();
        match instance {
            Some(_) => pending
                .instances
                .push((sha256_digest(manifest), manifest.to_vec())),
            None => pending.manifest = Some(manifest.to_vec()),
        }
        Ok(())
    }

    async fn commit(&self) -> StevedoreResult<()> {
        let (manifest, config, layers, instances) = {
            let mut pending = self.pending.lock();
            (
                pending.manifest.take(),
                pending.config.take(),
                std::mem::take(&mut pending.layers),
                std::mem::take(&mut pending.instances),
            )
        };
        let manifest = manifest.ok_or_else(|| {
            StevedoreError::Internal("commit called before a manifest was written".to_string())
        })?;

        if detect_media_type(&manifest)?.0 == DocumentKind::Index {
            let id = digest_hex(&sha256_digest(&manifest))?.to_string();
            self.store_image(&id, None)?;
            for (digest, bytes) in &instances {
                self.store.set_image_big_data(&id, &instance_key(digest), bytes)?;
            }
            self.store.set_image_big_data(&id, MANIFEST_KEY, &manifest)?;
            info!(image = %id, instances = instances.len(), "Stored manifest list");
            return Ok(());
        }

        let config = config.ok_or_else(|| {
            StevedoreError::Internal("commit called before the config was written".to_string())
        })?;
        let parsed = Manifest::from_slice(&manifest)?;
        let manifest_type = parsed.manifest_type()?;
        let layer_type = layer_media_type(manifest_type, Compression::None)?;
        let config_digest = sha256_digest(&config);
        let mut normalized = Manifest::new(
            manifest_type,
            Descriptor::new(
                manifest_type.config_media_type(),
                config_digest.clone(),
                config.len() as i64,
            ),
            layers
                .iter()
                .map(|l| Descriptor::new(layer_type, l.diff_digest.clone(), l.diff_size as i64))
                .collect(),
        );
        normalized.annotations = parsed.annotations;

        let id = digest_hex(&config_digest)?.to_string();
        let top = layers.last().map(|l| l.id.as_str());
        self.store_image(&id, top)?;
        self.store.set_image_big_data(&id, CONFIG_KEY, &config)?;
        self.store
            .set_image_big_data(&id, MANIFEST_KEY, &normalized.to_vec()?)?;
        info!(image = %id, layers = layers.len(), names = ?self.names, "Stored image");
        Ok(())
    }
}
