//! `docker://` transport: a remote registry speaking the distribution API.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::{OciDescriptor, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference, RegistryOperation};
use serde::Deserialize;
use stevedore_shared::constants::media_types as mt;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{ImageDestination, ImageSource, scratch_blob_path};
use crate::image::manifest::{Descriptor, ManifestType, detect_media_type};
use crate::image::reference::ImageReference;
use crate::system::SystemContext;
use crate::util::digest::{digest_file, sha256_digest};

const ACCEPTED_MANIFESTS: [&str; 4] = [
    mt::OCI_MANIFEST,
    mt::OCI_INDEX,
    mt::DOCKER_MANIFEST,
    mt::DOCKER_MANIFEST_LIST,
];

/// Map a registry client error onto the retry-relevant kinds.
pub fn classify_error(context: &str, error: impl std::fmt::Display) -> StevedoreError {
    let message = format!("{}: {}", context, error);
    let upper = message.to_ascii_uppercase();
    if upper.contains("TOOMANYREQUESTS") || upper.contains("429") {
        StevedoreError::RateLimited(message)
    } else if upper.contains("BLOB_UNKNOWN") {
        StevedoreError::LayerUnknown(message)
    } else if upper.contains("MANIFEST_UNKNOWN") || upper.contains("NAME_UNKNOWN") {
        StevedoreError::ImageUnknown(message)
    } else if upper.contains("UNAUTHORIZED") || upper.contains("DENIED") {
        StevedoreError::Permission(message)
    } else {
        StevedoreError::Network(message)
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

fn normalize_registry(key: &str) -> &str {
    let key = key
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = key.split('/').next().unwrap_or(key);
    match host {
        "index.docker.io" | "registry-1.docker.io" => "docker.io",
        other => other,
    }
}

fn decode_auth(encoded: &str) -> Option<RegistryAuth> {
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some(RegistryAuth::Basic(user.to_string(), pass.to_string()))
}

/// Credentials for `registry` from the configured auth file, if any.
pub fn lookup_auth(context: &SystemContext, registry: &str) -> RegistryAuth {
    let Some(path) = context.auth_path() else {
        return RegistryAuth::Anonymous;
    };
    let file: AuthFile = match std::fs::read(&path)
        .map_err(|e| e.to_string())
        .and_then(|b| serde_json::from_slice(&b).map_err(|e| e.to_string()))
    {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable auth file");
            return RegistryAuth::Anonymous;
        }
    };
    let registry = normalize_registry(registry);
    file.auths
        .iter()
        .filter(|(key, _)| normalize_registry(key) == registry)
        .find_map(|(_, entry)| entry.auth.as_deref().and_then(decode_auth))
        .unwrap_or(RegistryAuth::Anonymous)
}

struct Connection {
    client: Client,
    named: Reference,
    auth: RegistryAuth,
    authed: OnceCell<()>,
}

impl Connection {
    fn new(reference: &ImageReference, context: &SystemContext) -> StevedoreResult<Self> {
        let named = reference
            .named
            .clone()
            .ok_or_else(|| StevedoreError::InvalidReference(reference.to_string()))?;
        let protocol = if context.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(context.insecure_registries.clone())
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });
        let auth = lookup_auth(context, named.registry());
        Ok(Self {
            client,
            named,
            auth,
            authed: OnceCell::new(),
        })
    }

    async fn ensure_auth(&self, operation: RegistryOperation) -> StevedoreResult<()> {
        self.authed
            .get_or_try_init(|| async {
                self.client
                    .auth(&self.named, &self.auth, operation)
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_error(&format!("authenticating to {}", self.named.registry()), e))
            })
            .await
            .map(|_| ())
    }
}

pub struct RegistrySource {
    reference: ImageReference,
    conn: Connection,
}

impl RegistrySource {
    pub fn new(reference: &ImageReference, context: &SystemContext) -> StevedoreResult<Self> {
        Ok(Self {
            reference: reference.clone(),
            conn: Connection::new(reference, context)?,
        })
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn manifest(&self, instance: Option<&str>) -> StevedoreResult<(Vec<u8>, String)> {
        self.conn.ensure_auth(RegistryOperation::Pull).await?;
        let target = match instance {
            Some(digest) => self.conn.named.clone_with_digest(digest.to_string()),
            None => self.conn.named.clone(),
        };
        let (bytes, digest) = self
            .conn
            .client
            .pull_manifest_raw(&target, &self.conn.auth, &ACCEPTED_MANIFESTS)
            .await
            .map_err(|e| classify_error(&format!("pulling manifest {}", target), e))?;
        let bytes = bytes.to_vec();
        debug!(reference = %target, digest = %digest, "Fetched manifest");
        let (_, media_type) = detect_media_type(&bytes)?;
        Ok((bytes, media_type))
    }

    async fn get_blob(&self, descriptor: &Descriptor, scratch: &Path) -> StevedoreResult<PathBuf> {
        self.conn.ensure_auth(RegistryOperation::Pull).await?;
        let target = scratch_blob_path(scratch, &descriptor.digest)?;
        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| StevedoreError::io(format!("Failed to create {}", target.display()), e))?;
        let oci = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            size: descriptor.size,
            urls: None,
            annotations: None,
        };
        self.conn
            .client
            .pull_blob(&self.conn.named, &oci, &mut file)
            .await
            .map_err(|e| classify_error(&format!("pulling blob {}", descriptor.digest), e))?;
        Ok(target)
    }

    async fn close(&self) -> StevedoreResult<()> {
        Ok(())
    }
}

pub struct RegistryDestination {
    reference: ImageReference,
    conn: Connection,
}

impl RegistryDestination {
    pub fn new(reference: &ImageReference, context: &SystemContext) -> StevedoreResult<Self> {
        Ok(Self {
            reference: reference.clone(),
            conn: Connection::new(reference, context)?,
        })
    }
}

#[async_trait]
impl ImageDestination for RegistryDestination {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn supported_manifest_types(&self) -> Vec<ManifestType> {
        vec![ManifestType::OciV1, ManifestType::DockerV2S2]
    }

    async fn try_reusing_blob(&self, _descriptor: &Descriptor) -> StevedoreResult<Option<Descriptor>> {
        Ok(None)
    }

    async fn put_blob(
        &self,
        path: &Path,
        descriptor: &Descriptor,
        _is_config: bool,
    ) -> StevedoreResult<Descriptor> {
        self.conn.ensure_auth(RegistryOperation::Push).await?;
        let (digest, size) = digest_file(path)?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| StevedoreError::io(format!("Failed to read {}", path.display()), e))?;
        self.conn
            .client
            .push_blob(&self.conn.named, &data, &digest)
            .await
            .map_err(|e| classify_error(&format!("pushing blob {}", digest), e))?;
        debug!(digest = %digest, size, "Pushed blob");
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
        self.conn.ensure_auth(RegistryOperation::Push).await?;
        let parsed: OciManifest = serde_json::from_slice(manifest)
            .map_err(|e| StevedoreError::Image(format!("Manifest not accepted by registry client: {}", e)))?;
        let target = match instance {
            Some(_) => self
                .conn
                .named
                .clone_with_digest(sha256_digest(manifest)),
            None => self.conn.named.clone(),
        };
        self.conn
            .client
            .push_manifest(&target, &parsed)
            .await
            .map_err(|e| classify_error(&format!("pushing manifest {}", target), e))?;
        Ok(())
    }

    async fn commit(&self) -> StevedoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error("pull", "TOOMANYREQUESTS: slow down"),
            StevedoreError::RateLimited(_)
        ));
        assert!(matches!(
            classify_error("pull", "server returned 429"),
            StevedoreError::RateLimited(_)
        ));
        assert!(matches!(
            classify_error("pull", "BLOB_UNKNOWN: blob unknown to registry"),
            StevedoreError::LayerUnknown(_)
        ));
        assert!(matches!(
            classify_error("pull", "connection reset"),
            StevedoreError::Network(_)
        ));
        assert!(classify_error("pull", "connection reset").is_transient());
    }

    #[test]
    fn test_lookup_auth_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        let encoded = STANDARD.encode("alice:secret");
        std::fs::write(
            &path,
            format!(
                r#"{{"auths": {{"https://index.docker.io/v1/": {{"auth": "{}"}}}}}}"#,
                encoded
            ),
        )
        .unwrap();
        let context = SystemContext {
            auth_file: Some(path),
            ..SystemContext::with_root(dir.path())
        };

        match lookup_auth(&context, "docker.io") {
            RegistryAuth::Basic(user, pass) => {
                assert_eq!(user, "alice");
                assert_eq!(pass, "secret");
            }
            _ => panic!("expected basic auth"),
        }
        assert!(matches!(
            lookup_auth(&context, "quay.io"),
            RegistryAuth::Anonymous
        ));
    }

    #[test]
    fn test_source_requires_named_reference() {
        let reference = ImageReference::parse("dir:/tmp/x").unwrap();
        let err = RegistrySource::new(&reference, &SystemContext::default()).err().unwrap();
        assert!(matches!(err, StevedoreError::InvalidReference(_)));
    }
}
