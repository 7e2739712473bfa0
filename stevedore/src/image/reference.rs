//! Transport-qualified image references and local-name resolution.
//!
//! A reference is `<transport>:<scoped>`: `docker://registry/repo:tag`,
//! `oci:/path[:ref]`, `oci-archive:/path[:ref]`, `docker-archive:/path[:ref]`,
//! `dir:/path` or `containers-storage:name`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use oci_client::Reference;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use super::transports::{docker_archive, oci_layout};
use crate::util::digest::digest_hex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Docker,
    DockerArchive,
    Oci,
    OciArchive,
    Dir,
    ContainersStorage,
}

impl Transport {
    pub const ALL: [Transport; 6] = [
        Transport::Docker,
        Transport::DockerArchive,
        Transport::Oci,
        Transport::OciArchive,
        Transport::Dir,
        Transport::ContainersStorage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Docker => "docker",
            Transport::DockerArchive => "docker-archive",
            Transport::Oci => "oci",
            Transport::OciArchive => "oci-archive",
            Transport::Dir => "dir",
            Transport::ContainersStorage => "containers-storage",
        }
    }

    /// Prefix including the separator, e.g. `docker://`.
    pub fn prefix(&self) -> &'static str {
        match self {
            Transport::Docker => "docker://",
            Transport::DockerArchive => "docker-archive:",
            Transport::Oci => "oci:",
            Transport::OciArchive => "oci-archive:",
            Transport::Dir => "dir:",
            Transport::ContainersStorage => "containers-storage:",
        }
    }

    /// Whether references carry a filesystem path.
    pub fn is_path_based(&self) -> bool {
        !matches!(self, Transport::Docker | Transport::ContainersStorage)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transport {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim_end_matches("://").trim_end_matches(':');
        Transport::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| StevedoreError::InvalidReference(format!("unknown transport {:?}", s)))
    }
}

/// A parsed, transport-qualified image reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub transport: Transport,
    /// Location for path-based transports.
    pub path: Option<PathBuf>,
    /// Named portion, for registry and store references, or a named
    /// archive reference.
    pub named: Option<Reference>,
    /// Unparsed reference within a layout or archive (`oci:/p:latest`).
    pub inner: Option<String>,
    /// Store image ID for `containers-storage:<id>`.
    pub id: Option<String>,
}

impl ImageReference {
    /// Parse `<transport>:<scoped>`. Fails for anything without a known
    /// transport prefix.
    pub fn parse(spec: &str) -> StevedoreResult<Self> {
        let (transport, scoped) = Transport::ALL
            .into_iter()
            .find_map(|t| spec.strip_prefix(t.prefix()).map(|rest| (t, rest)))
            .ok_or_else(|| {
                StevedoreError::InvalidReference(format!("{:?} has no known transport prefix", spec))
            })?;
        Self::parse_scoped(transport, scoped)
    }

    pub fn parse_scoped(transport: Transport, scoped: &str) -> StevedoreResult<Self> {
        if scoped.is_empty() {
            return Err(StevedoreError::InvalidReference(format!(
                "empty {} reference",
                transport
            )));
        }
        let mut reference = ImageReference {
            transport,
            path: None,
            named: None,
            inner: None,
            id: None,
        };
        match transport {
            Transport::Docker => {
                let scoped = scoped.trim_start_matches("//");
                reference.named = Some(parse_named(scoped)?);
            }
            Transport::ContainersStorage => {
                if is_image_id(scoped) {
                    reference.id = Some(scoped.trim_start_matches("sha256:").to_string());
                } else {
                    reference.named = Some(parse_named(scoped)?);
                }
            }
            Transport::Dir => {
                reference.path = Some(PathBuf::from(scoped));
            }
            Transport::Oci | Transport::OciArchive | Transport::DockerArchive => {
                let (path, inner) = match scoped.split_once(':') {
                    Some((path, inner)) if !inner.is_empty() => (path, Some(inner)),
                    Some((path, _)) => (path, None),
                    None => (scoped, None),
                };
                if path.is_empty() {
                    return Err(StevedoreError::InvalidReference(format!(
                        "{} reference {:?} has no path",
                        transport, scoped
                    )));
                }
                reference.path = Some(PathBuf::from(path));
                if let Some(inner) = inner {
                    if transport == Transport::DockerArchive && !inner.starts_with('@') {
                        reference.named = Some(parse_named(inner)?);
                    }
                    reference.inner = Some(inner.to_string());
                }
            }
        }
        Ok(reference)
    }

    /// Reference to an image in the local store.
    pub fn storage(name: &str) -> StevedoreResult<Self> {
        Self::parse_scoped(Transport::ContainersStorage, name)
    }

    pub fn path(&self) -> StevedoreResult<&Path> {
        self.path.as_deref().ok_or_else(|| {
            StevedoreError::InvalidReference(format!("{} has no path", self.transport))
        })
    }

    /// Transport-scoped string, without the transport prefix.
    pub fn scoped(&self) -> String {
        match self.transport {
            Transport::Docker => self.named.as_ref().map(Reference::whole).unwrap_or_default(),
            Transport::ContainersStorage => match (&self.named, &self.id) {
                (Some(named), _) => named.whole(),
                (None, Some(id)) => id.clone(),
                (None, None) => String::new(),
            },
            _ => {
                let path = self
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                match &self.inner {
                    Some(inner) => format!("{}:{}", path, inner),
                    None => path,
                }
            }
        }
    }

    /// Digest pinned by the reference, if any.
    pub fn digest(&self) -> Option<&str> {
        self.named.as_ref().and_then(|n| n.digest())
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.transport.prefix(), self.scoped())
    }
}

impl FromStr for ImageReference {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse a registry-style name, normalizing `alpine` to
/// `docker.io/library/alpine`.
pub fn parse_named(name: &str) -> StevedoreResult<Reference> {
    name.parse::<Reference>()
        .map_err(|e| StevedoreError::InvalidReference(format!("{:?}: {}", name, e)))
}

/// Whether the first path component of a name looks like a registry host:
/// it contains a `.` or a `:`, or is `localhost`.
pub fn is_fully_qualified(name: &str) -> bool {
    match name.split_once('/') {
        Some((first, _)) => first.contains('.') || first.contains(':') || first == "localhost",
        None => false,
    }
}

fn is_image_id(s: &str) -> bool {
    let hex = s.strip_prefix("sha256:").unwrap_or(s);
    hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Inputs to [`resolve`] beyond the spec string.
#[derive(Clone, Debug, Default)]
pub struct ResolveOptions<'a> {
    /// Registry tried first for unqualified names.
    pub registry: Option<&'a str>,
    /// Further registries searched for unqualified names.
    pub search_registries: &'a [String],
    /// Transport used when the spec has none, e.g. `docker://`.
    pub transport: Option<&'a str>,
}

/// Outcome of [`resolve`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub reference: ImageReference,
    /// Name under which the image is kept in the local store.
    pub local_name: String,
}

/// Candidate references for a spec string, in the order they are tried.
pub fn candidates(spec: &str, options: &ResolveOptions<'_>) -> Vec<String> {
    let transport = options.transport.unwrap_or("docker://");
    let transport = if transport.ends_with(':') || transport.ends_with("//") {
        transport.to_string()
    } else if transport == "docker" {
        "docker://".to_string()
    } else {
        format!("{}:", transport)
    };

    let mut out = Vec::new();
    if !is_fully_qualified(spec) {
        for registry in options
            .registry
            .into_iter()
            .chain(options.search_registries.iter().map(String::as_str))
        {
            let registry = registry.trim_end_matches('/');
            if !registry.is_empty() {
                out.push(format!("{}{}/{}", transport, registry, spec));
            }
        }
    }
    out.push(format!("{}{}", transport, spec));
    out
}

/// Classify `spec` and pick its local name.
///
/// A transport-qualified spec is parsed as is. Otherwise the registry
/// prefixes and then the default transport are prepended; a guessed
/// registry reference must name its registry explicitly, so a bare name
/// with no registry configured is an [`StevedoreError::InvalidReference`].
pub fn resolve(spec: &str, options: &ResolveOptions<'_>) -> StevedoreResult<Resolved> {
    let reference = match ImageReference::parse(spec) {
        Ok(reference) => reference,
        Err(_) => {
            let mut last_error = None;
            let mut found = None;
            for candidate in candidates(spec, options) {
                match ImageReference::parse(&candidate) {
                    Ok(r) if r.transport == Transport::Docker && !guessed_is_qualified(&candidate) => {
                        last_error = Some(StevedoreError::InvalidReference(format!(
                            "{:?} does not name a registry and no registry is configured",
                            spec
                        )));
                    }
                    Ok(r) => {
                        tracing::debug!(spec, candidate = %candidate, "Resolved reference");
                        found = Some(r);
                        break;
                    }
                    Err(e) => last_error = Some(e),
                }
            }
            match found {
                Some(r) => r,
                None => {
                    return Err(last_error.unwrap_or_else(|| {
                        StevedoreError::InvalidReference(format!("{:?}", spec))
                    }));
                }
            }
        }
    };

    let local_name = local_name(&reference)?;
    validate_local_name(&local_name)?;
    Ok(Resolved {
        reference,
        local_name,
    })
}

fn guessed_is_qualified(candidate: &str) -> bool {
    candidate
        .strip_prefix(Transport::Docker.prefix())
        .is_some_and(is_fully_qualified)
}

/// Canonical local name for a reference.
pub fn local_name(reference: &ImageReference) -> StevedoreResult<String> {
    match reference.transport {
        Transport::Docker | Transport::ContainersStorage => match (&reference.named, &reference.id) {
            (Some(named), _) => Ok(named.whole()),
            (None, Some(id)) => Ok(format!("@{}", id)),
            (None, None) => Err(StevedoreError::InvalidReference(reference.to_string())),
        },
        Transport::Dir => {
            let path = reference.path()?;
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    StevedoreError::NameUnrepresentable(path.display().to_string())
                })
        }
        Transport::DockerArchive => {
            if let Some(named) = &reference.named {
                return Ok(named.whole());
            }
            let info = docker_archive::inspect(reference.path()?)?;
            match info.repo_tags.into_iter().next() {
                Some(tag) => Ok(tag),
                None => Ok(format!("@{}", digest_hex(&info.config_digest)?)),
            }
        }
        Transport::Oci | Transport::OciArchive => {
            let info = if reference.transport == Transport::Oci {
                oci_layout::inspect_dir(reference.path()?, reference.inner.as_deref())?
            } else {
                oci_layout::inspect_archive(reference.path()?, reference.inner.as_deref())?
            };
            match info.ref_name {
                Some(name) => Ok(name),
                None => Ok(format!("@{}", digest_hex(&info.config_digest)?)),
            }
        }
    }
}

/// A local name is either `@<hex>` or a parseable registry-style name.
pub fn validate_local_name(name: &str) -> StevedoreResult<()> {
    if let Some(hex) = name.strip_prefix('@') {
        if is_image_id(hex) {
            return Ok(());
        }
        return Err(StevedoreError::NameUnrepresentable(name.to_string()));
    }
    parse_named(name)
        .map(|_| ())
        .map_err(|_| StevedoreError::NameUnrepresentable(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_transports() {
        let r = ImageReference::parse("docker://quay.io/foo/bar:v1").unwrap();
        assert_eq!(r.transport, Transport::Docker);
        let named = r.named.as_ref().unwrap();
        assert_eq!(named.registry(), "quay.io");
        assert_eq!(named.repository(), "foo/bar");
        assert_eq!(named.tag(), Some("v1"));

        let r = ImageReference::parse("oci-archive:/tmp/x.tar:latest").unwrap();
        assert_eq!(r.path.as_deref(), Some(Path::new("/tmp/x.tar")));
        assert_eq!(r.inner.as_deref(), Some("latest"));

        let r = ImageReference::parse("dir:/tmp/img").unwrap();
        assert_eq!(r.transport, Transport::Dir);

        let id = "a".repeat(64);
        let r = ImageReference::parse(&format!("containers-storage:{}", id)).unwrap();
        assert_eq!(r.id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_display_round_trip() {
        for spec in [
            "docker://quay.io/foo/bar:v1",
            "oci:/srv/layout:tag",
            "dir:/tmp/img",
            "docker-archive:/tmp/a.tar",
        ] {
            let r = ImageReference::parse(spec).unwrap();
            assert_eq!(r.to_string(), spec);
        }
    }

    #[test]
    fn test_unknown_transport_fails() {
        assert!(matches!(
            ImageReference::parse("ftp:/x").unwrap_err(),
            StevedoreError::InvalidReference(_)
        ));
        assert!("ftp".parse::<Transport>().is_err());
        assert_eq!("oci-archive".parse::<Transport>().unwrap(), Transport::OciArchive);
    }

    #[test]
    fn test_bare_name_without_registry_is_invalid() {
        let err = resolve("alpine", &ResolveOptions::default()).unwrap_err();
        assert!(matches!(err, StevedoreError::InvalidReference(_)));
    }

    #[test]
    fn test_registry_prefix_is_tried_first() {
        let options = ResolveOptions {
            registry: Some("registry.example.com"),
            ..Default::default()
        };
        let resolved = resolve("alpine:3.18", &options).unwrap();
        let named = resolved.reference.named.unwrap();
        assert_eq!(named.registry(), "registry.example.com");
        assert_eq!(named.tag(), Some("3.18"));
        assert!(resolved.local_name.starts_with("registry.example.com/"));
    }

    #[test]
    fn test_qualified_name_skips_registries() {
        let search = vec!["quay.io".to_string()];
        let options = ResolveOptions {
            search_registries: &search,
            ..Default::default()
        };
        let c = candidates("localhost:5000/app", &options);
        assert_eq!(c, vec!["docker://localhost:5000/app".to_string()]);
        let c = candidates("app", &options);
        assert_eq!(c[0], "docker://quay.io/app");
    }

    #[test]
    fn test_dir_local_name_is_last_component() {
        let resolved = resolve("dir:/tmp/images/myimage", &ResolveOptions::default()).unwrap();
        assert_eq!(resolved.local_name, "myimage");
    }

    #[test]
    fn test_validate_local_name() {
        assert!(validate_local_name(&format!("@{}", "b".repeat(64))).is_ok());
        assert!(validate_local_name("localhost/app:latest").is_ok());
        assert!(matches!(
            validate_local_name("Has Spaces").unwrap_err(),
            StevedoreError::NameUnrepresentable(_)
        ));
        assert!(validate_local_name("@xyz").is_err());
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let options = ResolveOptions {
            registry: Some("r.example.com"),
            ..Default::default()
        };
        let a = resolve("ns/app:1", &options).unwrap();
        let b = resolve("ns/app:1", &options).unwrap();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn prop_transport_prefix_is_classified(name in "[a-z][a-z0-9]{0,10}") {
            let spec = format!("docker://registry.example.com/{}", name);
            let r = ImageReference::parse(&spec).unwrap();
            prop_assert_eq!(r.transport, Transport::Docker);
            let spec = format!("dir:/tmp/{}", name);
            let r = ImageReference::parse(&spec).unwrap();
            prop_assert_eq!(r.transport, Transport::Dir);
        }

        #[test]
        fn prop_unqualified_names_need_a_registry(name in "[a-z][a-z0-9]{0,10}") {
            prop_assert!(resolve(&name, &ResolveOptions::default()).is_err());
        }
    }
}
