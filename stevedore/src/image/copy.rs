//! Copy an image (or a list of images) from a source to a destination.
//!
//! Blobs are staged one at a time in a scratch directory. Layers go first,
//! bottom-up, then the config, then the manifest, then `commit`.

use std::path::{Path, PathBuf};

use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tempfile::TempDir;
use tracing::{debug, info};

use super::manifest::{
    Descriptor, DocumentKind, Index, Manifest, ManifestType, Platform, detect_media_type,
};
use super::policy::Policy;
use super::transports::{ImageDestination, ImageSource};
use crate::util::digest::{sha256_digest, verify_file};

#[derive(Clone, Debug)]
pub struct CopyOptions {
    /// Force the manifest format written to the destination.
    pub manifest_type: Option<ManifestType>,
    /// For lists: copy every instance instead of the one for `platform`.
    pub all_instances: bool,
    /// Ask the destination whether it already has each layer.
    pub reuse_blobs: bool,
    /// Platform selected from a list when not copying all instances.
    pub platform: Platform,
    /// Parent of the scratch directory. `None` uses the system temp dir.
    pub scratch: Option<PathBuf>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            manifest_type: None,
            all_instances: false,
            reuse_blobs: true,
            platform: Platform::host(),
            scratch: None,
        }
    }
}

/// What was written to the destination.
#[derive(Clone, Debug)]
pub struct CopyReport {
    pub manifest: Vec<u8>,
    pub manifest_digest: String,
    pub media_type: String,
    /// Config digest, `None` when a list was copied.
    pub config_digest: Option<String>,
}

struct Copied {
    manifest: Vec<u8>,
    media_type: String,
    config_digest: String,
}

fn scratch_dir(options: &CopyOptions) -> StevedoreResult<TempDir> {
    let result = match &options.scratch {
        Some(parent) => {
            std::fs::create_dir_all(parent).map_err(|e| {
                StevedoreError::io(format!("Failed to create {}", parent.display()), e)
            })?;
            tempfile::Builder::new().prefix("copy-").tempdir_in(parent)
        }
        None => tempfile::Builder::new().prefix("stevedore-copy-").tempdir(),
    };
    result.map_err(|e| StevedoreError::io("Failed to create scratch directory", e))
}

fn choose_type(current: ManifestType, forced: Option<ManifestType>, supported: &[ManifestType]) -> StevedoreResult<ManifestType> {
    let wanted = forced.unwrap_or(current);
    if supported.contains(&wanted) {
        return Ok(wanted);
    }
    if forced.is_some() {
        return Err(StevedoreError::UnsupportedManifestType(format!(
            "destination does not accept {} manifests",
            wanted
        )));
    }
    supported.first().copied().ok_or_else(|| {
        StevedoreError::UnsupportedManifestType("destination accepts no manifest types".to_string())
    })
}

async fn transfer_blob(
    src: &dyn ImageSource,
    dest: &dyn ImageDestination,
    descriptor: &Descriptor,
    is_config: bool,
    scratch: &Path,
) -> StevedoreResult<Descriptor> {
    let staged = src.get_blob(descriptor, scratch).await?;
    if descriptor.size >= 0 && !verify_file(&staged, &descriptor.digest)? {
        let _ = std::fs::remove_file(&staged);
        return Err(StevedoreError::Image(format!(
            "Digest mismatch for blob {}",
            descriptor.digest
        )));
    }
    let stored = dest.put_blob(&staged, descriptor, is_config).await;
    let _ = std::fs::remove_file(&staged);
    stored
}

async fn copy_single(
    src: &dyn ImageSource,
    dest: &dyn ImageDestination,
    instance: Option<&str>,
    write_as_instance: bool,
    options: &CopyOptions,
    scratch: &Path,
) -> StevedoreResult<Copied> {
    let (bytes, _) = src.manifest(instance).await?;
    let manifest = Manifest::from_slice(&bytes)?;
    let current = manifest.manifest_type()?;
    let target = choose_type(current, options.manifest_type, &dest.supported_manifest_types())?;

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        if options.reuse_blobs {
            if let Some(reused) = dest.try_reusing_blob(layer).await? {
                debug!(digest = %layer.digest, "Layer already present at destination");
                layers.push(reused);
                continue;
            }
        }
        layers.push(transfer_blob(src, dest, layer, false, scratch).await?);
    }
    let config = transfer_blob(src, dest, &manifest.config, true, scratch).await?;

    let updated = Manifest {
        config: config.clone(),
        layers,
        ..manifest.clone()
    };
    let (out, media_type) = if updated == manifest && target == current {
        (bytes, current.media_type().to_string())
    } else {
        (updated.convert(target)?.to_vec()?, target.media_type().to_string())
    };

    let marker = write_as_instance.then(|| sha256_digest(&out));
    dest.put_manifest(&out, &media_type, marker.as_deref()).await?;
    Ok(Copied {
        manifest: out,
        media_type,
        config_digest: config.digest,
    })
}

async fn copy_index(
    src: &dyn ImageSource,
    dest: &dyn ImageDestination,
    bytes: Vec<u8>,
    options: &CopyOptions,
    scratch: &Path,
) -> StevedoreResult<CopyReport> {
    let index = Index::from_slice(&bytes)?;
    let mut updated = index.clone();
    for entry in &mut updated.manifests {
        let copied = copy_single(src, dest, Some(&entry.digest), true, options, scratch).await?;
        entry.digest = sha256_digest(&copied.manifest);
        entry.size = copied.manifest.len() as i64;
        entry.media_type = copied.media_type;
    }
    let list_type = match options.manifest_type {
        Some(t) => Some(t.list_media_type().to_string()),
        None => updated.media_type.clone(),
    };
    updated.media_type = list_type;
    let out = if updated == index { bytes } else { updated.to_vec()? };
    let media_type = updated.media_type.clone().unwrap_or_default();
    dest.put_manifest(&out, &media_type, None).await?;
    dest.commit().await?;
    info!(
        instances = updated.manifests.len(),
        destination = %dest.reference(),
        "Copied image list"
    );
    Ok(CopyReport {
        manifest_digest: sha256_digest(&out),
        manifest: out,
        media_type,
        config_digest: None,
    })
}

/// Copy `src` to `dest` after checking `policy`.
pub async fn copy_image(
    policy: &Policy,
    src: &dyn ImageSource,
    dest: &dyn ImageDestination,
    options: &CopyOptions,
) -> StevedoreResult<CopyReport> {
    policy.check(src.reference())?;
    let scratch = scratch_dir(options)?;
    let (bytes, _) = src.manifest(None).await?;

    let (kind, _) = detect_media_type(&bytes)?;
    if kind == DocumentKind::Index {
        if options.all_instances {
            return copy_index(src, dest, bytes, options, scratch.path()).await;
        }
        let index = Index::from_slice(&bytes)?;
        let selected = index.select(&options.platform).ok_or_else(|| {
            StevedoreError::ImageUnknown(format!(
                "no image for {}/{} in {}",
                options.platform.os,
                options.platform.architecture,
                src.reference()
            ))
        })?;
        debug!(digest = %selected.digest, "Selected platform instance");
        let digest = selected.digest.clone();
        return finish(dest, copy_single(src, dest, Some(&digest), false, options, scratch.path()).await?).await;
    }
    finish(dest, copy_single(src, dest, None, false, options, scratch.path()).await?).await
}

async fn finish(dest: &dyn ImageDestination, copied: Copied) -> StevedoreResult<CopyReport> {
    dest.commit().await?;
    let manifest_digest = sha256_digest(&copied.manifest);
    info!(
        destination = %dest.reference(),
        manifest = %manifest_digest,
        config = %copied.config_digest,
        "Copied image"
    );
    Ok(CopyReport {
        manifest: copied.manifest,
        manifest_digest,
        media_type: copied.media_type,
        config_digest: Some(copied.config_digest),
    })
}
