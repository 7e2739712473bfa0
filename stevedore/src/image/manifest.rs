//! Image manifest, index and descriptor documents.
//!
//! OCI v1 and Docker schema 2 share a structure; only the media types
//! differ. One set of serde types covers both and [`Manifest::convert`]
//! rewrites media types between the two formats.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stevedore_shared::constants::media_types as mt;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::archive::Compression;

/// Target manifest format of a commit or push.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestType {
    #[default]
    #[serde(rename = "oci")]
    OciV1,
    #[serde(rename = "docker")]
    DockerV2S2,
}

impl ManifestType {
    pub fn media_type(&self) -> &'static str {
        match self {
            ManifestType::OciV1 => mt::OCI_MANIFEST,
            ManifestType::DockerV2S2 => mt::DOCKER_MANIFEST,
        }
    }

    pub fn config_media_type(&self) -> &'static str {
        match self {
            ManifestType::OciV1 => mt::OCI_CONFIG,
            ManifestType::DockerV2S2 => mt::DOCKER_CONFIG,
        }
    }

    pub fn list_media_type(&self) -> &'static str {
        match self {
            ManifestType::OciV1 => mt::OCI_INDEX,
            ManifestType::DockerV2S2 => mt::DOCKER_MANIFEST_LIST,
        }
    }

    /// Format a manifest media type belongs to.
    pub fn from_media_type(media_type: &str) -> StevedoreResult<Self> {
        match media_type {
            mt::OCI_MANIFEST => Ok(ManifestType::OciV1),
            mt::DOCKER_MANIFEST => Ok(ManifestType::DockerV2S2),
            other => Err(StevedoreError::UnsupportedManifestType(other.to_string())),
        }
    }
}

impl fmt::Display for ManifestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.media_type())
    }
}

impl FromStr for ManifestType {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "oci" | "ociv1" => Ok(ManifestType::OciV1),
            "docker" | "dockerv2s2" | "v2s2" => Ok(ManifestType::DockerV2S2),
            _ => ManifestType::from_media_type(s),
        }
    }
}

/// Layer media type for a manifest format and compression.
pub fn layer_media_type(
    manifest_type: ManifestType,
    compression: Compression,
) -> StevedoreResult<&'static str> {
    match (manifest_type, compression) {
        (_, Compression::Bzip2) => Err(StevedoreError::InvalidArgument(
            "bzip2 layer compression has no defined media type".to_string(),
        )),
        (ManifestType::OciV1, Compression::None) => Ok(mt::OCI_LAYER),
        (ManifestType::OciV1, Compression::Gzip) => Ok(mt::OCI_LAYER_GZIP),
        (ManifestType::OciV1, Compression::Zstd) => Ok(mt::OCI_LAYER_ZSTD),
        (ManifestType::DockerV2S2, Compression::None) => Ok(mt::DOCKER_LAYER),
        (ManifestType::DockerV2S2, Compression::Gzip) => Ok(mt::DOCKER_LAYER_GZIP),
        (ManifestType::DockerV2S2, Compression::Zstd) => Err(StevedoreError::InvalidArgument(
            "zstd layers cannot be described by a Docker schema 2 manifest".to_string(),
        )),
    }
}

/// Compression implied by a layer media type.
pub fn layer_compression(media_type: &str) -> Compression {
    if media_type.ends_with("gzip") {
        Compression::Gzip
    } else if media_type.ends_with("zstd") {
        Compression::Zstd
    } else {
        Compression::None
    }
}

fn is_config_media_type(media_type: &str) -> bool {
    media_type == mt::OCI_CONFIG || media_type == mt::DOCKER_CONFIG
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

impl Platform {
    /// Platform of the running host, in Go naming.
    pub fn host() -> Self {
        Self {
            architecture: host_architecture().to_string(),
            os: host_os().to_string(),
            ..Default::default()
        }
    }

    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && (self.variant.is_none() || other.variant.is_none() || self.variant == other.variant)
    }
}

pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

pub fn host_os() -> &'static str {
    std::env::consts::OS
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    /// -1 when the size is not known.
    pub size: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
            platform: None,
        }
    }
}

/// An image manifest in either format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new(manifest_type: ManifestType, config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(manifest_type.media_type().to_string()),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> StevedoreResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StevedoreError::Image(format!("Failed to parse manifest: {}", e)))
    }

    pub fn to_vec(&self) -> StevedoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Format of this manifest, from its media type or its config's.
    pub fn manifest_type(&self) -> StevedoreResult<ManifestType> {
        match self.media_type.as_deref() {
            Some(media_type) => ManifestType::from_media_type(media_type),
            None if self.config.media_type == mt::DOCKER_CONFIG => Ok(ManifestType::DockerV2S2),
            None => Ok(ManifestType::OciV1),
        }
    }

    /// Rewrite this manifest for another format. Fails for layers the
    /// target format cannot describe.
    pub fn convert(&self, target: ManifestType) -> StevedoreResult<Manifest> {
        if self.manifest_type()? == target {
            return Ok(self.clone());
        }
        let mut converted = self.clone();
        converted.media_type = Some(target.media_type().to_string());
        converted.config.media_type = target.config_media_type().to_string();
        for layer in &mut converted.layers {
            if layer.media_type == mt::DOCKER_FOREIGN_LAYER_GZIP {
                if target == ManifestType::OciV1 {
                    layer.media_type = mt::OCI_LAYER_GZIP.to_string();
                }
                continue;
            }
            layer.media_type =
                layer_media_type(target, layer_compression(&layer.media_type))?.to_string();
        }
        if target == ManifestType::DockerV2S2 {
            converted.annotations.clear();
        }
        Ok(converted)
    }
}

/// A manifest list (Docker) or image index (OCI).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Index {
    pub fn new(manifest_type: ManifestType) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(manifest_type.list_media_type().to_string()),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> StevedoreResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StevedoreError::Image(format!("Failed to parse image index: {}", e)))
    }

    pub fn to_vec(&self) -> StevedoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// First entry whose platform matches `platform`.
    pub fn select(&self, platform: &Platform) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| p.matches(platform)))
    }
}

/// Kinds of manifest documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    Manifest,
    Index,
}

/// Classify a manifest document by its declared or implied media type.
pub fn detect_media_type(bytes: &[u8]) -> StevedoreResult<(DocumentKind, String)> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        #[serde(default)]
        media_type: Option<String>,
        #[serde(default)]
        manifests: Option<serde_json::Value>,
        #[serde(default)]
        config: Option<Descriptor>,
        #[serde(default)]
        schema_version: Option<u32>,
    }

    let probe: Probe = serde_json::from_slice(bytes)
        .map_err(|e| StevedoreError::Image(format!("Failed to parse manifest: {}", e)))?;
    if probe.schema_version == Some(1) {
        return Err(StevedoreError::UnsupportedManifestType(
            "Docker schema 1 manifests are not supported".to_string(),
        ));
    }
    match probe.media_type.as_deref() {
        Some(mt::OCI_INDEX) | Some(mt::DOCKER_MANIFEST_LIST) => {
            Ok((DocumentKind::Index, probe.media_type.unwrap_or_default()))
        }
        Some(mt::OCI_MANIFEST) | Some(mt::DOCKER_MANIFEST) => {
            Ok((DocumentKind::Manifest, probe.media_type.unwrap_or_default()))
        }
        Some(other) => Err(StevedoreError::UnsupportedManifestType(other.to_string())),
        None if probe.manifests.is_some() => Ok((DocumentKind::Index, mt::OCI_INDEX.to_string())),
        None => match probe.config {
            Some(config) if config.media_type == mt::DOCKER_CONFIG => {
                Ok((DocumentKind::Manifest, mt::DOCKER_MANIFEST.to_string()))
            }
            Some(config) if is_config_media_type(&config.media_type) || !config.digest.is_empty() => {
                Ok((DocumentKind::Manifest, mt::OCI_MANIFEST.to_string()))
            }
            _ => Err(StevedoreError::Image(
                "document is neither a manifest nor an index".to_string(),
            )),
        },
    }
}
