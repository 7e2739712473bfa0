//! Build secrets exposed through `--mount=type=secret`.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::idtools::IdMappings;
use crate::run::mount_spec::SecretMount;

/// Where a secret's bytes come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretSource {
    Env(String),
    File(PathBuf),
}

impl SecretSource {
    /// Parse `env:NAME` or `file:/path`. A bare absolute path is a file.
    pub fn parse(spec: &str) -> StevedoreResult<Self> {
        match spec.split_once(':') {
            Some(("env", name)) if !name.is_empty() => Ok(SecretSource::Env(name.to_string())),
            Some(("file", path)) if !path.is_empty() => Ok(SecretSource::File(PathBuf::from(path))),
            _ if spec.starts_with('/') => Ok(SecretSource::File(PathBuf::from(spec))),
            _ => Err(StevedoreError::InvalidArgument(format!(
                "secret source {:?} is not env:NAME or file:PATH",
                spec
            ))),
        }
    }

    fn read(&self) -> StevedoreResult<Vec<u8>> {
        match self {
            SecretSource::Env(name) => std::env::var_os(name)
                .map(|v| v.into_encoded_bytes())
                .ok_or_else(|| StevedoreError::NotFound(format!("secret environment variable {}", name))),
            SecretSource::File(path) => std::fs::read(path)
                .map_err(|e| StevedoreError::io(format!("Failed to read secret {}", path.display()), e)),
        }
    }
}

/// Parse `id=source` pairs as given on a command line.
pub fn parse_secrets<S: AsRef<str>>(specs: &[S]) -> StevedoreResult<BTreeMap<String, SecretSource>> {
    let mut out = BTreeMap::new();
    for spec in specs {
        let spec = spec.as_ref();
        let (id, source) = spec.split_once('=').ok_or_else(|| {
            StevedoreError::InvalidArgument(format!("secret {:?} is not id=source", spec))
        })?;
        out.insert(id.to_string(), SecretSource::parse(source)?);
    }
    Ok(out)
}

/// Copy the secret into `dir` with the requested mode and ownership.
///
/// Returns `Ok(None)` for an unknown, optional secret.
pub fn materialize(
    mount: &SecretMount,
    secrets: &BTreeMap<String, SecretSource>,
    dir: &Path,
    mappings: &IdMappings,
) -> StevedoreResult<Option<PathBuf>> {
    let Some(source) = secrets.get(&mount.id) else {
        if mount.required {
            return Err(StevedoreError::NotFound(format!("secret {:?}", mount.id)));
        }
        tracing::debug!(id = %mount.id, "Skipping optional secret that was not provided");
        return Ok(None);
    };
    let data = source.read()?;

    std::fs::create_dir_all(dir)
        .map_err(|e| StevedoreError::io(format!("Failed to create {}", dir.display()), e))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| StevedoreError::io(format!("Failed to chmod {}", dir.display()), e))?;
    let path = dir.join(&mount.id);
    std::fs::write(&path, &data)
        .map_err(|e| StevedoreError::io(format!("Failed to write secret {}", path.display()), e))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mount.mode))
        .map_err(|e| StevedoreError::io(format!("Failed to chmod {}", path.display()), e))?;

    let (uid, gid) = mappings.to_host(mount.uid, mount.gid)?;
    if let Err(e) = std::os::unix::fs::chown(&path, Some(uid), Some(gid)) {
        tracing::warn!(id = %mount.id, uid, gid, error = %e, "Failed to chown secret");
    }
    tracing::debug!(id = %mount.id, path = %path.display(), "Materialized secret");
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::mount_spec::{RunMount, parse_run_mount};

    fn secret_mount(spec: &str) -> SecretMount {
        match parse_run_mount(spec).unwrap() {
            RunMount::Secret(s) => s,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!(SecretSource::parse("env:TOKEN").unwrap(), SecretSource::Env("TOKEN".into()));
        assert_eq!(
            SecretSource::parse("file:/tmp/x").unwrap(),
            SecretSource::File(PathBuf::from("/tmp/x"))
        );
        assert!(SecretSource::parse("env:").is_err());
        assert!(SecretSource::parse("vault:x").is_err());
        let map = parse_secrets(&["a=env:A", "b=/etc/b"]).unwrap();
        assert_eq!(map.len(), 2);
        assert!(parse_secrets(&["nope"]).is_err());
    }

    #[test]
    fn test_materialize_file_secret() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, b"hello").unwrap();
        let mut secrets = BTreeMap::new();
        secrets.insert("x".to_string(), SecretSource::File(src));

        let out = dir.path().join("out");
        let path = materialize(&secret_mount("type=secret,id=x"), &secrets, &out, &IdMappings::default())
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o400);
    }

    #[test]
    fn test_missing_secret_required_or_optional() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = BTreeMap::new();
        let optional = secret_mount("type=secret,id=x");
        assert!(materialize(&optional, &secrets, dir.path(), &IdMappings::default())
            .unwrap()
            .is_none());
        let required = secret_mount("type=secret,id=x,required=true");
        assert!(matches!(
            materialize(&required, &secrets, dir.path(), &IdMappings::default()),
            Err(StevedoreError::NotFound(_))
        ));
    }
}
