//! Signature policy (`policy.json`) evaluation.
//!
//! ```json
//! {
//!   "default": [{"type": "insecureAcceptAnything"}],
//!   "transports": {
//!     "docker": {"quay.io/untrusted": [{"type": "reject"}]}
//!   }
//! }
//! ```
//!
//! Signature-verifying requirements are not supported and never accept.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing::debug;

use super::reference::ImageReference;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Requirement {
    InsecureAcceptAnything,
    Reject,
    SignedBy {
        #[serde(default, rename = "keyType")]
        key_type: Option<String>,
    },
    SigstoreSigned {},
}

impl Requirement {
    fn accepts(&self) -> bool {
        matches!(self, Requirement::InsecureAcceptAnything)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub default: Vec<Requirement>,
    #[serde(default)]
    pub transports: HashMap<String, HashMap<String, Vec<Requirement>>>,
}

impl Policy {
    pub fn from_file(path: &Path) -> StevedoreResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            StevedoreError::Policy(format!("Failed to read policy {}: {}", path.display(), e))
        })?;
        Self::from_slice(&bytes)
            .map_err(|e| StevedoreError::Policy(format!("{}: {}", path.display(), e)))
    }

    pub fn from_slice(bytes: &[u8]) -> StevedoreResult<Self> {
        let policy: Policy = serde_json::from_slice(bytes)
            .map_err(|e| StevedoreError::Policy(format!("Malformed policy: {}", e)))?;
        if policy.default.is_empty() {
            return Err(StevedoreError::Policy(
                "Policy has no default requirements".to_string(),
            ));
        }
        Ok(policy)
    }

    /// Policy that accepts everything, for tests and `--signature-policy` overrides.
    pub fn accept_anything() -> Self {
        Self {
            default: vec![Requirement::InsecureAcceptAnything],
            transports: HashMap::new(),
        }
    }

    /// Requirements for an image, most specific scope first.
    pub fn requirements_for(&self, reference: &ImageReference) -> &[Requirement] {
        if let Some(scopes) = self.transports.get(reference.transport.name()) {
            for scope in policy_scopes(reference) {
                if let Some(reqs) = scopes.get(&scope) {
                    debug!(transport = %reference.transport, scope = %scope, "Matched policy scope");
                    return reqs;
                }
            }
            if let Some(reqs) = scopes.get("") {
                return reqs;
            }
        }
        &self.default
    }

    /// Check that `reference` may be used as a copy source.
    pub fn check(&self, reference: &ImageReference) -> StevedoreResult<()> {
        let reqs = self.requirements_for(reference);
        if reqs.is_empty() {
            return Err(StevedoreError::Policy(format!(
                "Policy requirements for {} are empty",
                reference
            )));
        }
        match reqs.iter().find(|r| !r.accepts()) {
            None => Ok(()),
            Some(Requirement::Reject) => Err(StevedoreError::Policy(format!(
                "Source image rejected: Running image {} is rejected by policy.",
                reference
            ))),
            Some(other) => Err(StevedoreError::Policy(format!(
                "Source image rejected: {:?} requirement for {} is not supported",
                other, reference
            ))),
        }
    }
}

/// Scopes to look up for a reference, most specific first.
fn policy_scopes(reference: &ImageReference) -> Vec<String> {
    let mut scopes = Vec::new();
    if let Some(named) = &reference.named {
        let repo = format!("{}/{}", named.registry(), named.repository());
        if let Some(tag) = named.tag() {
            scopes.push(format!("{}:{}", repo, tag));
        }
        if let Some(digest) = named.digest() {
            scopes.push(format!("{}@{}", repo, digest));
        }
        let mut current = repo.as_str();
        scopes.push(current.to_string());
        while let Some((parent, _)) = current.rsplit_once('/') {
            scopes.push(parent.to_string());
            current = parent;
        }
    } else if let Some(path) = &reference.path {
        let mut current = Some(path.as_path());
        while let Some(p) = current {
            if p.as_os_str().is_empty() {
                break;
            }
            scopes.push(p.display().to_string());
            current = p.parent();
        }
    }
    scopes
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"{
        "default": [{"type": "insecureAcceptAnything"}],
        "transports": {
            "docker": {
                "quay.io/untrusted": [{"type": "reject"}],
                "registry.example.com": [{"type": "signedBy", "keyType": "GPGKeys"}]
            },
            "dir": {
                "": [{"type": "reject"}]
            }
        }
    }"#;

    #[test]
    fn test_default_accepts() {
        let policy = Policy::from_slice(POLICY.as_bytes()).unwrap();
        let reference = ImageReference::parse("docker://docker.io/library/alpine:latest").unwrap();
        policy.check(&reference).unwrap();
    }

    #[test]
    fn test_repository_scope_rejects() {
        let policy = Policy::from_slice(POLICY.as_bytes()).unwrap();
        let reference = ImageReference::parse("docker://quay.io/untrusted/app:1").unwrap();
        let err = policy.check(&reference).unwrap_err();
        assert!(matches!(err, StevedoreError::Policy(_)));
    }

    #[test]
    fn test_registry_scope_signed_by_unsupported() {
        let policy = Policy::from_slice(POLICY.as_bytes()).unwrap();
        let reference = ImageReference::parse("docker://registry.example.com/team/app").unwrap();
        assert!(policy.check(&reference).is_err());
    }

    #[test]
    fn test_transport_default_scope() {
        let policy = Policy::from_slice(POLICY.as_bytes()).unwrap();
        let reference = ImageReference::parse("dir:/tmp/image").unwrap();
        assert!(policy.check(&reference).is_err());
    }

    #[test]
    fn test_missing_default_is_error() {
        assert!(Policy::from_slice(br#"{"transports": {}}"#).is_err());
    }

    #[test]
    fn test_missing_file_is_policy_error() {
        let err = Policy::from_file(Path::new("/nonexistent/policy.json")).unwrap_err();
        assert!(matches!(err, StevedoreError::Policy(_)));
    }
}
