//! Shared fixtures for stevedore's integration tests: an isolated store,
//! OCI layouts built from in-memory files, and readers for what a commit
//! wrote.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use stevedore::{Builder, BuilderOptions, LocalStore, Store, SystemContext};
use tempfile::TempDir;

/// Image pulled by tests that need a real userland.
pub const TEST_IMAGE: &str = "docker.io/library/alpine:latest";

const PERMISSIVE_POLICY: &str = r#"{"default": [{"type": "insecureAcceptAnything"}]}"#;

/// A store under a temporary directory, removed on drop.
pub struct TestEnv {
    pub context: SystemContext,
    pub store: Arc<dyn Store>,
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let policy = dir.path().join("policy.json");
        fs::write(&policy, PERMISSIVE_POLICY).expect("Failed to write policy");
        let context = SystemContext::with_root(dir.path()).with_signature_policy(&policy);
        let store: Arc<dyn Store> =
            Arc::new(LocalStore::open(context.layout()).expect("Failed to open store"));
        Self { context, store, dir }
    }

    /// Scratch path inside the environment.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub async fn builder(&self, from: &str) -> Builder {
        let options = BuilderOptions {
            from: from.to_string(),
            ..BuilderOptions::default()
        };
        Builder::new(&self.context, self.store.clone(), options)
            .await
            .expect("Failed to create working container")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// One file in a fixture layer.
#[derive(Clone, Debug)]
pub struct FileEntry {
    pub path: String,
    pub data: Vec<u8>,
    pub mode: u32,
}

impl FileEntry {
    pub fn new(path: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.to_string(),
            data: data.into(),
            mode: 0o644,
        }
    }
}

/// Uncompressed tar of `files`, with fixed timestamps.
pub fn layer_tar(files: &[FileEntry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.data.len() as u64);
        header.set_mode(file.mode);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, &file.path, file.data.as_slice())
            .expect("Failed to append tar entry");
    }
    builder.into_inner().expect("Failed to finish tar")
}

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn write_blob(root: &Path, data: &[u8]) -> (String, usize) {
    let digest = sha256_digest(data);
    let hex = digest.trim_start_matches("sha256:");
    let dir = root.join("blobs/sha256");
    fs::create_dir_all(&dir).expect("Failed to create blob dir");
    fs::write(dir.join(hex), data).expect("Failed to write blob");
    (digest, data.len())
}

/// Write an OCI image layout at `root` holding one image tagged `tag`.
///
/// Each inner slice becomes one uncompressed layer, bottom first, with a
/// history entry `layer <n>`.
pub fn write_oci_layout(root: &Path, tag: &str, layers: &[Vec<FileEntry>]) -> PathBuf {
    fs::create_dir_all(root).expect("Failed to create layout dir");
    fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)
        .expect("Failed to write oci-layout");

    let mut layer_descriptors = Vec::new();
    let mut diff_ids = Vec::new();
    let mut history = Vec::new();
    for (i, files) in layers.iter().enumerate() {
        let tar = layer_tar(files);
        let (digest, size) = write_blob(root, &tar);
        layer_descriptors.push(json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": digest,
            "size": size,
        }));
        diff_ids.push(digest);
        history.push(json!({
            "created": "2024-01-01T00:00:00Z",
            "created_by": format!("layer {}", i + 1),
        }));
    }

    let config = json!({
        "created": "2024-01-01T00:00:00Z",
        "architecture": stevedore::image::manifest::host_architecture(),
        "os": "linux",
        "config": {"Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"]},
        "rootfs": {"type": "layers", "diff_ids": diff_ids},
        "history": history,
    });
    let config_bytes = serde_json::to_vec(&config).expect("Failed to encode config");
    let (config_digest, config_size) = write_blob(root, &config_bytes);

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config_size,
        },
        "layers": layer_descriptors,
    });
    let manifest_bytes = serde_json::to_vec(&manifest).expect("Failed to encode manifest");
    let (manifest_digest, manifest_size) = write_blob(root, &manifest_bytes);

    let index = json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest,
            "size": manifest_size,
            "annotations": {"org.opencontainers.image.ref.name": tag},
        }],
    });
    fs::write(root.join("index.json"), serde_json::to_vec(&index).expect("Failed to encode index"))
        .expect("Failed to write index.json");
    root.to_path_buf()
}

/// An image read back from an OCI layout or archive.
#[derive(Debug)]
pub struct ExportedImage {
    pub manifest_bytes: Vec<u8>,
    pub manifest: Value,
    pub config_bytes: Vec<u8>,
    pub config: Value,
    /// `(path, size)` of every entry, per layer, bottom first.
    pub layers: Vec<Vec<(String, u64)>>,
    /// Raw layer blobs, bottom first.
    pub layer_blobs: Vec<Vec<u8>>,
}

fn read_blob(root: &Path, digest: &str) -> Vec<u8> {
    let hex = digest.trim_start_matches("sha256:");
    fs::read(root.join("blobs/sha256").join(hex)).expect("Failed to read blob")
}

fn decompress(blob: &[u8]) -> Vec<u8> {
    if blob.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(blob)
            .read_to_end(&mut out)
            .expect("Failed to gunzip layer");
        return out;
    }
    blob.to_vec()
}

fn tar_entries(tar_bytes: &[u8]) -> Vec<(String, u64)> {
    let mut archive = tar::Archive::new(tar_bytes);
    archive
        .entries()
        .expect("Failed to read layer tar")
        .map(|entry| {
            let entry = entry.expect("Bad tar entry");
            let path = entry.path().expect("Bad tar path").to_string_lossy().into_owned();
            (path, entry.header().size().unwrap_or(0))
        })
        .collect()
}

/// Read the single image in an OCI layout directory.
pub fn read_oci_layout(root: &Path) -> ExportedImage {
    let index: Value =
        serde_json::from_slice(&fs::read(root.join("index.json")).expect("Failed to read index.json"))
            .expect("Bad index.json");
    let manifest_digest = index["manifests"][0]["digest"]
        .as_str()
        .expect("index has no manifest");
    let manifest_bytes = read_blob(root, manifest_digest);
    let manifest: Value = serde_json::from_slice(&manifest_bytes).expect("Bad manifest");
    let config_digest = manifest["config"]["digest"].as_str().expect("manifest has no config");
    let config_bytes = read_blob(root, config_digest);
    let config: Value = serde_json::from_slice(&config_bytes).expect("Bad config");

    let mut layers = Vec::new();
    let mut layer_blobs = Vec::new();
    for layer in manifest["layers"].as_array().cloned().unwrap_or_default() {
        let blob = read_blob(root, layer["digest"].as_str().expect("layer has no digest"));
        layers.push(tar_entries(&decompress(&blob)));
        layer_blobs.push(blob);
    }
    ExportedImage {
        manifest_bytes,
        manifest,
        config_bytes,
        config,
        layers,
        layer_blobs,
    }
}

/// Unpack an `oci-archive:` tarball and read its image.
pub fn read_oci_archive(path: &Path) -> ExportedImage {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let file = fs::File::open(path).expect("Failed to open archive");
    tar::Archive::new(file)
        .unpack(dir.path())
        .expect("Failed to unpack archive");
    read_oci_layout(dir.path())
}
