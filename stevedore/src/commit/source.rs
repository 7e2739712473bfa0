//! Turning a working container into an image source.
//!
//! Layers are laid out bottom to top as: the base image's chain, the
//! prepended linked layers, the container's own layer, the appended linked
//! layers. When the destination is the local store, base layers are
//! described by fake `sha256:<layer-id>` digests of unknown size so the
//! store destination can reuse them without reading them back.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use stevedore_shared::constants::annotations;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::archive::{CompressWriter, Compression, decompressed_reader};
use crate::builder::{Builder, LinkedLayer};
use crate::image::config::{History, ImageConfig, RootFs};
use crate::image::manifest::{Descriptor, Manifest, ManifestType, layer_media_type};
use crate::image::reference::ImageReference;
use crate::image::transports::storage::fake_layer_digest;
use crate::image::transports::{ImageSource, scratch_blob_path, stage_copy};
use crate::storage::{Store, layer_chain};
use crate::util::digest::{Digester, DigestingWriter, digest_hex, sha256_digest};

/// Inputs to [`assemble`].
#[derive(Clone, Debug, Default)]
pub struct AssembleOptions {
    pub manifest_type: ManifestType,
    pub compression: Compression,
    /// The destination is not the local store; every layer gets a real
    /// digest.
    pub exporting: bool,
    pub omit_history: bool,
    /// Fixed `created` time for the config and new history entries.
    pub history_timestamp: Option<DateTime<Utc>>,
    /// Manifest annotations on top of the builder's own.
    pub annotations: BTreeMap<String, String>,
}

enum BlobSource {
    File(PathBuf),
    StoreLayer(String),
}

/// A layer written to scratch space.
struct LayerBlob {
    path: PathBuf,
    digest: String,
    size: u64,
    diff_id: String,
    /// The tar stream held no entries.
    empty: bool,
}

/// Stream `reader` through decompression, optional recompression and two
/// digesters into a file under `scratch`.
fn write_layer_blob<R: Read>(reader: R, compression: Compression, scratch: &Path) -> StevedoreResult<LayerBlob> {
    let (_, mut reader) = decompressed_reader(reader)?;
    let staging = tempfile::NamedTempFile::new_in(scratch)
        .map_err(|e| StevedoreError::io("Failed to create layer file", e))?;
    let file = staging
        .reopen()
        .map_err(|e| StevedoreError::io("Failed to open layer file", e))?;
    let mut writer = CompressWriter::new(DigestingWriter::new(BufWriter::new(file)), compression)?;

    let mut diff = Digester::new();
    let mut empty = true;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| StevedoreError::io("Failed to read layer stream", e))?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        diff.update(chunk);
        // A tar with no entries is all end-of-archive zero blocks.
        if empty && chunk.iter().any(|b| *b != 0) {
            empty = false;
        }
        writer
            .write_all(chunk)
            .map_err(|e| StevedoreError::io("Failed to write layer blob", e))?;
    }

    let digesting = writer
        .finish()
        .map_err(|e| StevedoreError::io("Failed to finish layer compression", e))?;
    let (mut inner, blob) = digesting.into_parts();
    inner
        .flush()
        .map_err(|e| StevedoreError::io("Failed to flush layer blob", e))?;
    let (diff_id, _) = diff.finish();
    let (digest, size) = blob.finish();

    let path = scratch.join(digest_hex(&digest)?);
    staging
        .persist(&path)
        .map_err(|e| StevedoreError::io("Failed to keep layer blob", e.error))?;
    Ok(LayerBlob {
        path,
        digest,
        size,
        diff_id,
        empty,
    })
}

#[derive(Default)]
struct Assembly {
    layers: Vec<Descriptor>,
    diff_ids: Vec<String>,
    history: Vec<History>,
    blobs: HashMap<String, BlobSource>,
}

impl Assembly {
    fn push_blob(&mut self, blob: LayerBlob, media_type: &str) {
        self.layers
            .push(Descriptor::new(media_type, blob.digest.clone(), blob.size as i64));
        self.diff_ids.push(blob.diff_id);
        self.blobs.insert(blob.digest, BlobSource::File(blob.path));
    }

    /// Add a new layer with its history entry. Empty layers only get the
    /// entry, marked `empty_layer`.
    fn push_new(&mut self, blob: LayerBlob, media_type: &str, mut history: History, record: bool) {
        history.empty_layer = blob.empty;
        if blob.empty {
            if let Err(e) = fs::remove_file(&blob.path) {
                warn!(path = %blob.path.display(), error = %e, "Failed to remove empty layer blob");
            }
        } else {
            self.push_blob(blob, media_type);
        }
        if record {
            self.history.push(history);
        }
    }
}

/// The committed form of a working container.
pub struct AssembledSource {
    reference: ImageReference,
    store: Arc<dyn Store>,
    scratch: Mutex<Option<TempDir>>,
    manifest: Vec<u8>,
    media_type: String,
    config: Vec<u8>,
    config_digest: String,
    blobs: HashMap<String, BlobSource>,
}

impl AssembledSource {
    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest
    }

    pub fn manifest_digest(&self) -> String {
        sha256_digest(&self.manifest)
    }

    pub fn config_blob(&self) -> &[u8] {
        &self.config
    }

    pub fn config_digest(&self) -> &str {
        &self.config_digest
    }
}

/// Build the manifest, config and layer blobs for `builder`.
pub fn assemble(builder: &Builder, options: &AssembleOptions) -> StevedoreResult<AssembledSource> {
    let container_id = builder.require_container()?.to_string();
    let state = builder.state();
    let store = builder.store().clone();
    let media_type = layer_media_type(options.manifest_type, options.compression)?;
    let stored_media_type = layer_media_type(options.manifest_type, Compression::None)?;
    let created = options.history_timestamp.unwrap_or_else(Utc::now);

    fs::create_dir_all(store.tmp_dir())
        .map_err(|e| StevedoreError::io("Failed to create scratch root", e))?;
    let scratch = tempfile::Builder::new()
        .prefix("commit-")
        .tempdir_in(store.tmp_dir())
        .map_err(|e| StevedoreError::io("Failed to create commit scratch directory", e))?;

    let mut config: ImageConfig = match options.manifest_type {
        ManifestType::OciV1 => state.oci_config.to_oci(),
        ManifestType::DockerV2S2 => {
            let mut docker = state.docker_config.clone();
            docker.container = container_id.clone();
            docker
        }
    };
    config.default_platform();
    config.created = Some(created);

    let record = store.container(&container_id)?;
    let mut chain = layer_chain(store.as_ref(), record.parent_layer.as_deref())?;
    chain.reverse();

    let base_history = if options.omit_history {
        Vec::new()
    } else {
        config.history.clone()
    };
    let base_non_empty = base_history.iter().filter(|h| !h.empty_layer).count();
    if !base_history.is_empty() && base_non_empty != chain.len() {
        return Err(StevedoreError::Image(format!(
            "base image history describes {} layers but {} are stored",
            base_non_empty,
            chain.len()
        )));
    }

    let mut assembly = Assembly {
        history: base_history.clone(),
        ..Assembly::default()
    };
    for layer in &chain {
        if options.exporting {
            let blob = write_layer_blob(store.diff(&layer.id)?, options.compression, scratch.path())?;
            debug!(layer = %layer.id, digest = %blob.digest, "Exported base layer");
            assembly.push_blob(blob, media_type);
        } else {
            let digest = fake_layer_digest(&layer.id);
            assembly.layers.push(Descriptor::new(stored_media_type, digest.clone(), -1));
            assembly.diff_ids.push(layer.diff_digest.clone());
            assembly.blobs.insert(digest, BlobSource::StoreLayer(layer.id.clone()));
        }
    }

    let record_history = !options.omit_history;
    let linked_history = |linked: &LinkedLayer| History {
        created: linked.history.created.or(Some(created)),
        ..linked.history.clone()
    };
    for linked in &state.prepended_linked_layers {
        let blob = write_layer_blob(linked.open_tar(scratch.path())?, options.compression, scratch.path())?;
        assembly.push_new(blob, media_type, linked_history(linked), record_history);
    }

    let rw = write_layer_blob(store.container_diff(&container_id)?, options.compression, scratch.path())?;
    debug!(container = %container_id, digest = %rw.digest, empty = rw.empty, "Container layer written");
    let rw_history = History {
        created: Some(created),
        created_by: state.created_by.clone(),
        author: config.author.clone(),
        comment: state.history_comment.clone(),
        empty_layer: false,
    };
    assembly.push_new(rw, media_type, rw_history, record_history);

    for linked in &state.appended_linked_layers {
        let blob = write_layer_blob(linked.open_tar(scratch.path())?, options.compression, scratch.path())?;
        assembly.push_new(blob, media_type, linked_history(linked), record_history);
    }

    if record_history {
        check_history(&assembly, &base_history, chain.len());
    }

    config.rootfs = RootFs {
        diff_ids: assembly.diff_ids.clone(),
        ..RootFs::default()
    };
    config.history = assembly.history;
    let config_bytes = config.to_vec()?;
    let config_digest = sha256_digest(&config_bytes);

    let mut manifest = Manifest::new(
        options.manifest_type,
        Descriptor::new(
            options.manifest_type.config_media_type(),
            config_digest.clone(),
            config_bytes.len() as i64,
        ),
        assembly.layers,
    );
    if options.manifest_type == ManifestType::OciV1 {
        manifest.annotations = manifest_annotations(builder, &options.annotations);
    }
    let manifest_bytes = manifest.to_vec()?;

    Ok(AssembledSource {
        reference: ImageReference::storage(&container_id)?,
        store,
        scratch: Mutex::new(Some(scratch)),
        manifest: manifest_bytes,
        media_type: options.manifest_type.media_type().to_string(),
        config: config_bytes,
        config_digest,
        blobs: assembly.blobs,
    })
}

/// Every new history entry must correspond to exactly one new layer or be
/// marked empty. Anything else is a bug in the assembly above.
fn check_history(assembly: &Assembly, base_history: &[History], base_layers: usize) {
    let new_entries = &assembly.history[base_history.len()..];
    let new_non_empty = new_entries.iter().filter(|h| !h.empty_layer).count();
    let expected_diff_ids = base_layers + new_non_empty;
    if assembly.diff_ids.len() != expected_diff_ids || assembly.layers.len() != expected_diff_ids {
        panic!(
            "image assembly produced {} layers and {} diff IDs but history describes {} layers",
            assembly.layers.len(),
            assembly.diff_ids.len(),
            expected_diff_ids
        );
    }
}

fn manifest_annotations(builder: &Builder, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let state = builder.state();
    let mut out = BTreeMap::new();
    if !state.from_image_id.is_empty() {
        if !state.from_image.is_empty() && !state.from_image.starts_with('@') {
            out.insert(annotations::BASE_IMAGE_NAME.to_string(), state.from_image.clone());
        }
        if !state.source_manifest.is_empty() {
            out.insert(
                annotations::BASE_IMAGE_DIGEST.to_string(),
                sha256_digest(&state.source_manifest),
            );
        }
    }
    out.extend(state.image_annotations.clone());
    out.extend(extra.clone());
    out
}

#[async_trait]
impl ImageSource for AssembledSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn manifest(&self, instance: Option<&str>) -> StevedoreResult<(Vec<u8>, String)> {
        if let Some(instance) = instance {
            return Err(StevedoreError::NotFound(format!(
                "committed image has no instance {}",
                instance
            )));
        }
        Ok((self.manifest.clone(), self.media_type.clone()))
    }

    async fn get_blob(&self, descriptor: &Descriptor, scratch: &Path) -> StevedoreResult<PathBuf> {
        if descriptor.digest == self.config_digest {
            let target = scratch_blob_path(scratch, &descriptor.digest)?;
            fs::write(&target, &self.config)
                .map_err(|e| StevedoreError::io("Failed to stage config", e))?;
            return Ok(target);
        }
        match self.blobs.get(&descriptor.digest) {
            Some(BlobSource::File(path)) => stage_copy(path, scratch, &descriptor.digest),
            Some(BlobSource::StoreLayer(id)) => {
                let target = scratch_blob_path(scratch, &descriptor.digest)?;
                let mut diff = self.store.diff(id)?;
                let mut file = File::create(&target).map_err(|e| {
                    StevedoreError::io(format!("Failed to create {}", target.display()), e)
                })?;
                io::copy(&mut diff, &mut file)
                    .map_err(|e| StevedoreError::io(format!("Failed to stage layer {}", id), e))?;
                Ok(target)
            }
            None => Err(StevedoreError::LayerUnknown(descriptor.digest.clone())),
        }
    }

    async fn close(&self) -> StevedoreResult<()> {
        if let Some(scratch) = self.scratch.lock().take() {
            let path = scratch.path().to_path_buf();
            if let Err(e) = scratch.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove commit scratch directory");
            }
        }
        Ok(())
    }
}
