//! Pre-built layers woven around the container's own layer at commit.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing::debug;

use super::Builder;
use crate::archive::tar_directory;
use crate::idtools::IdMappings;
use crate::image::config::History;
use crate::util::fs::dir_is_empty;

/// A tarball, or a directory packed at commit time, plus its history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedLayer {
    #[serde(rename = "BlobPath")]
    pub blob_path: PathBuf,
    #[serde(rename = "History")]
    pub history: History,
}

impl LinkedLayer {
    pub fn new(blob_path: impl Into<PathBuf>, history: History) -> Self {
        Self {
            blob_path: blob_path.into(),
            history,
        }
    }

    /// Whether the layer contributes no content. Empty layers get an
    /// `empty_layer` history entry and no blob.
    pub fn is_empty(&self) -> StevedoreResult<bool> {
        let meta = fs::metadata(&self.blob_path).map_err(|e| {
            StevedoreError::io(format!("Failed to stat {}", self.blob_path.display()), e)
        })?;
        Ok(if meta.is_dir() {
            dir_is_empty(&self.blob_path)
        } else {
            meta.len() == 0
        })
    }

    /// Open the layer as a tar stream. Directories are packed into a
    /// temporary file under `scratch` first.
    pub fn open_tar(&self, scratch: &Path) -> StevedoreResult<File> {
        if self.blob_path.is_dir() {
            let file = tempfile::tempfile_in(scratch)
                .map_err(|e| StevedoreError::io("Failed to create linked layer file", e))?;
            let mut file = tar_directory(&self.blob_path, &IdMappings::default(), file)?;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| StevedoreError::io("Failed to rewind linked layer", e))?;
            debug!(path = %self.blob_path.display(), "Packed linked layer directory");
            return Ok(file);
        }
        File::open(&self.blob_path).map_err(|e| {
            StevedoreError::io(format!("Failed to open linked layer {}", self.blob_path.display()), e)
        })
    }
}

impl Builder {
    /// Add a layer below the container's own layer, after any earlier
    /// prepended ones.
    pub fn add_prepended_linked_layer(&mut self, history: History, blob_path: &Path) -> StevedoreResult<()> {
        let layer = checked_layer(history, blob_path)?;
        self.state_mut().prepended_linked_layers.push(layer);
        self.save()
    }

    /// Add a layer above the container's own layer.
    pub fn add_appended_linked_layer(&mut self, history: History, blob_path: &Path) -> StevedoreResult<()> {
        let layer = checked_layer(history, blob_path)?;
        self.state_mut().appended_linked_layers.push(layer);
        self.save()
    }
}

fn checked_layer(history: History, blob_path: &Path) -> StevedoreResult<LinkedLayer> {
    let blob_path = fs::canonicalize(blob_path).map_err(|e| {
        StevedoreError::io(format!("Linked layer {} is not accessible", blob_path.display()), e)
    })?;
    Ok(LinkedLayer::new(blob_path, history))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{scratch_builder, setup};
    use super::*;

    #[test]
    fn test_empty_detection() {
        let dir = tempfile::tempdir().unwrap();
        let empty_file = dir.path().join("empty.tar");
        fs::write(&empty_file, b"").unwrap();
        let empty_dir = dir.path().join("d");
        fs::create_dir(&empty_dir).unwrap();

        assert!(LinkedLayer::new(&empty_file, History::default()).is_empty().unwrap());
        assert!(LinkedLayer::new(&empty_dir, History::default()).is_empty().unwrap());
        fs::write(empty_dir.join("x"), b"1").unwrap();
        assert!(!LinkedLayer::new(&empty_dir, History::default()).is_empty().unwrap());
    }

    #[test]
    fn test_directory_is_packed() {
        let dir = tempfile::tempdir().unwrap();
        let content = dir.path().join("content");
        fs::create_dir(&content).unwrap();
        fs::write(content.join("f"), b"data").unwrap();

        let file = LinkedLayer::new(&content, History::default())
            .open_tar(dir.path())
            .unwrap();
        let mut archive = tar::Archive::new(file);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["f"]);
    }

    #[tokio::test]
    async fn test_layers_recorded_in_order() {
        let (dir, context, store) = setup();
        let mut builder = scratch_builder(&context, &store).await;
        let one = dir.path().join("one.tar");
        let two = dir.path().join("two.tar");
        fs::write(&one, b"").unwrap();
        fs::write(&two, b"").unwrap();

        builder
            .add_prepended_linked_layer(History { created_by: "one".into(), ..History::default() }, &one)
            .unwrap();
        builder
            .add_appended_linked_layer(History { created_by: "two".into(), ..History::default() }, &two)
            .unwrap();
        assert_eq!(builder.state().prepended_linked_layers[0].history.created_by, "one");
        assert_eq!(builder.state().appended_linked_layers[0].history.created_by, "two");

        let missing = dir.path().join("missing.tar");
        assert!(builder.add_appended_linked_layer(History::default(), &missing).is_err());
    }
}
