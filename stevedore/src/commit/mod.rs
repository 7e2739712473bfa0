//! Committing a working container to an image.

pub mod source;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing::{info, warn};

pub use source::{AssembleOptions, AssembledSource, assemble};

use crate::archive::Compression;
use crate::builder::Builder;
use crate::image::copy::{CopyOptions, copy_image};
use crate::image::manifest::ManifestType;
use crate::image::policy::Policy;
use crate::image::reference::{ImageReference, Transport, is_fully_qualified};
use crate::image::transports::{ImageSource, open_destination};
use crate::util::digest::digest_hex;

#[derive(Clone, Debug, Default)]
pub struct CommitOptions {
    pub manifest_type: ManifestType,
    /// Compression for layers written to an external destination.
    pub compression: Compression,
    /// Write no history at all, base history included.
    pub omit_history: bool,
    /// Fixed timestamp for reproducible output.
    pub history_timestamp: Option<DateTime<Utc>>,
    /// Extra manifest annotations (OCI only).
    pub annotations: BTreeMap<String, String>,
    /// Flattening all layers into one is not supported.
    pub squash: bool,
    /// More names for the image when committing to the local store.
    pub additional_tags: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CommitResult {
    pub image_id: String,
    pub manifest_digest: String,
    pub reference: ImageReference,
}

/// Parse a commit target. Bare names go to the local store, under
/// `localhost/` when they carry no registry.
pub fn parse_destination(spec: &str) -> StevedoreResult<ImageReference> {
    if let Ok(reference) = ImageReference::parse(spec) {
        return Ok(reference);
    }
    if spec.is_empty() {
        return Err(StevedoreError::InvalidReference("empty destination".into()));
    }
    if is_fully_qualified(spec) || spec.starts_with("sha256:") {
        ImageReference::storage(spec)
    } else {
        ImageReference::storage(&format!("localhost/{}", spec))
    }
}

impl Builder {
    /// Write the container as an image to `destination`.
    pub async fn commit(
        &self,
        destination: &ImageReference,
        options: &CommitOptions,
    ) -> StevedoreResult<CommitResult> {
        if options.squash {
            return Err(StevedoreError::InvalidArgument(
                "squashed commits are not supported".into(),
            ));
        }
        let exporting = destination.transport != Transport::ContainersStorage;
        let source = assemble(
            self,
            &AssembleOptions {
                manifest_type: options.manifest_type,
                compression: options.compression,
                exporting,
                omit_history: options.omit_history,
                history_timestamp: options.history_timestamp,
                annotations: options.annotations.clone(),
            },
        )?;

        let result = self.copy_assembled(&source, destination, options).await;
        if let Err(e) = source.close().await {
            warn!(error = %e, "Failed to release commit source");
        }
        result
    }

    async fn copy_assembled(
        &self,
        source: &AssembledSource,
        destination: &ImageReference,
        options: &CommitOptions,
    ) -> StevedoreResult<CommitResult> {
        let policy = Policy::from_file(&self.context().policy_path())?;
        let dest = open_destination(destination, self.context(), self.store())?;
        let copy_options = CopyOptions {
            scratch: Some(self.store().tmp_dir()),
            ..CopyOptions::default()
        };
        let report = copy_image(&policy, source, dest.as_ref(), &copy_options).await?;

        let config_digest = report
            .config_digest
            .clone()
            .unwrap_or_else(|| source.config_digest().to_string());
        let image_id = digest_hex(&config_digest)?.to_string();

        let reference = if destination.transport == Transport::ContainersStorage {
            if !options.additional_tags.is_empty() {
                let names = options
                    .additional_tags
                    .iter()
                    .map(|tag| parse_destination(tag).and_then(|r| crate::image::reference::local_name(&r)))
                    .collect::<StevedoreResult<Vec<_>>>()?;
                self.store().add_image_names(&image_id, &names)?;
            }
            match destination.named {
                Some(_) => destination.clone(),
                None => ImageReference::storage(&image_id)?,
            }
        } else {
            destination.clone()
        };

        info!(
            container = %self.container_name(),
            destination = %destination,
            image = %image_id,
            digest = %report.manifest_digest,
            "Committed image"
        );
        Ok(CommitResult {
            image_id,
            manifest_digest: report.manifest_digest,
            reference,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tests::{scratch_builder, setup};
    use crate::image::manifest::Manifest;
    use crate::storage::{CONFIG_KEY, MANIFEST_KEY};

    #[test]
    fn test_parse_destination() {
        let r = parse_destination("myimage").unwrap();
        assert_eq!(r.transport, Transport::ContainersStorage);
        assert_eq!(r.named.as_ref().map(|n| n.whole()).as_deref(), Some("localhost/myimage:latest"));

        let r = parse_destination("oci-archive:/tmp/out.tar").unwrap();
        assert_eq!(r.transport, Transport::OciArchive);
        assert!(parse_destination("").is_err());
    }

    #[tokio::test]
    async fn test_squash_rejected() {
        let (_dir, context, store) = setup();
        let builder = scratch_builder(&context, &store).await;
        let options = CommitOptions {
            squash: true,
            ..CommitOptions::default()
        };
        let dest = parse_destination("squashed").unwrap();
        assert!(matches!(
            builder.commit(&dest, &options).await,
            Err(StevedoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_to_store() {
        let (_dir, context, store) = setup();
        let mut builder = scratch_builder(&context, &store).await;
        let root = builder.mount().unwrap();
        std::fs::write(root.join("hello"), b"world").unwrap();

        let dest = parse_destination("localhost/hello:v1").unwrap();
        let options = CommitOptions {
            additional_tags: vec!["hello:latest".into()],
            ..CommitOptions::default()
        };
        let result = builder.commit(&dest, &options).await.unwrap();
        let image = store.image(&result.image_id).unwrap();
        assert!(image.names.contains(&"localhost/hello:v1".to_string()));
        assert!(image.names.contains(&"localhost/hello:latest".to_string()));

        let manifest = Manifest::from_slice(&store.image_big_data(&image.id, MANIFEST_KEY).unwrap()).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert!(!store.image_big_data(&image.id, CONFIG_KEY).unwrap().is_empty());
    }
}
