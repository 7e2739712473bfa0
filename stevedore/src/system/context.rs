//! System-wide configuration.
//!
//! Loaded once per invocation from an optional JSON file and environment
//! overrides. Every field has a serde default so a partial file is valid.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stevedore_shared::constants::env as env_vars;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::system::layout::StoreLayout;
use crate::util::is_rootless;

/// How `run` isolates the command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Delegate to an external OCI runtime (runc, crun).
    #[default]
    Oci,
    /// Re-exec this binary through the three-stage chroot pipeline.
    Chroot,
}

impl Isolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Isolation::Oci => "oci",
            Isolation::Chroot => "chroot",
        }
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Isolation {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "oci" | "default" | "" => Ok(Isolation::Oci),
            "chroot" => Ok(Isolation::Chroot),
            other => Err(StevedoreError::InvalidArgument(format!(
                "unrecognized isolation type {:?}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemContext {
    /// Store root (layers, images, containers).
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Volatile run root (bundles, secrets, lock files).
    #[serde(default = "default_run_root")]
    pub run_root: PathBuf,

    /// Signature policy file. `None` searches the standard locations.
    #[serde(default)]
    pub signature_policy: Option<PathBuf>,

    /// Registries tried, in order, for names without a registry component.
    #[serde(default)]
    pub registries: Vec<String>,

    /// Transport prefix tried when a name carries none.
    #[serde(default = "default_transport")]
    pub default_transport: String,

    /// Registries contacted over plain HTTP.
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    /// Registry credentials file in the `auth.json` format.
    #[serde(default)]
    pub auth_file: Option<PathBuf>,

    /// OCI runtime binary for `Isolation::Oci`.
    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default)]
    pub isolation: Isolation,

    /// Capabilities granted to run commands before per-run add/drop.
    #[serde(default = "default_capabilities")]
    pub default_capabilities: Vec<String>,

    /// Ulimits applied to every run, `NAME=soft:hard`.
    #[serde(default)]
    pub default_ulimits: Vec<String>,

    #[serde(default)]
    pub dns_servers: Vec<String>,

    #[serde(default)]
    pub dns_search: Vec<String>,

    #[serde(default)]
    pub dns_options: Vec<String>,

    /// Base file for generated `/etc/hosts`.
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,

    /// Base file for generated `/etc/resolv.conf`.
    #[serde(default = "default_resolv_file")]
    pub resolv_file: PathBuf,

    /// Seccomp profile applied when a run does not name one.
    #[serde(default)]
    pub seccomp_profile: Option<PathBuf>,

    #[serde(default = "default_cni_config_dir")]
    pub cni_config_dir: PathBuf,

    #[serde(default = "default_cni_plugin_dirs")]
    pub cni_plugin_dirs: Vec<PathBuf>,

    #[serde(default = "default_slirp4netns")]
    pub slirp4netns: String,

    #[serde(default = "default_ssh_agent")]
    pub ssh_agent: String,

    #[serde(default = "default_ssh_add")]
    pub ssh_add: String,

    #[serde(default = "default_newuidmap")]
    pub newuidmap: String,

    #[serde(default = "default_newgidmap")]
    pub newgidmap: String,
}

fn default_root() -> PathBuf {
    if is_rootless() {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("stevedore")
    } else {
        PathBuf::from("/var/lib/stevedore")
    }
}

fn default_run_root() -> PathBuf {
    if is_rootless() {
        dirs::runtime_dir()
            .unwrap_or_else(|| {
                std::env::temp_dir().join(format!("stevedore-{}", nix::unistd::getuid()))
            })
            .join("stevedore")
    } else {
        PathBuf::from("/run/stevedore")
    }
}

fn default_transport() -> String {
    "docker://".to_string()
}

fn default_runtime() -> String {
    "runc".to_string()
}

fn default_capabilities() -> Vec<String> {
    [
        "CAP_CHOWN",
        "CAP_DAC_OVERRIDE",
        "CAP_FOWNER",
        "CAP_FSETID",
        "CAP_KILL",
        "CAP_NET_BIND_SERVICE",
        "CAP_SETFCAP",
        "CAP_SETGID",
        "CAP_SETPCAP",
        "CAP_SETUID",
        "CAP_SYS_CHROOT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

fn default_resolv_file() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

fn default_cni_config_dir() -> PathBuf {
    PathBuf::from("/etc/cni/net.d")
}

fn default_cni_plugin_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/libexec/cni"),
        PathBuf::from("/usr/lib/cni"),
        PathBuf::from("/opt/cni/bin"),
    ]
}

fn default_slirp4netns() -> String {
    "slirp4netns".to_string()
}

fn default_ssh_agent() -> String {
    "ssh-agent".to_string()
}

fn default_ssh_add() -> String {
    "ssh-add".to_string()
}

fn default_newuidmap() -> String {
    "newuidmap".to_string()
}

fn default_newgidmap() -> String {
    "newgidmap".to_string()
}

impl Default for SystemContext {
    fn default() -> Self {
        Self {
            root: default_root(),
            run_root: default_run_root(),
            signature_policy: None,
            registries: Vec::new(),
            default_transport: default_transport(),
            insecure_registries: Vec::new(),
            auth_file: None,
            runtime: default_runtime(),
            isolation: Isolation::default(),
            default_capabilities: default_capabilities(),
            default_ulimits: Vec::new(),
            dns_servers: Vec::new(),
            dns_search: Vec::new(),
            dns_options: Vec::new(),
            hosts_file: default_hosts_file(),
            resolv_file: default_resolv_file(),
            seccomp_profile: None,
            cni_config_dir: default_cni_config_dir(),
            cni_plugin_dirs: default_cni_plugin_dirs(),
            slirp4netns: default_slirp4netns(),
            ssh_agent: default_ssh_agent(),
            ssh_add: default_ssh_add(),
            newuidmap: default_newuidmap(),
            newgidmap: default_newgidmap(),
        }
    }
}

impl SystemContext {
    /// Load configuration from `$STEVEDORE_CONFIG`, the user config dir or
    /// `/etc/stevedore/config.json` (first that exists), then apply
    /// environment overrides.
    pub fn load() -> StevedoreResult<Self> {
        let mut ctx = match Self::config_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        ctx.apply_env();
        Ok(ctx)
    }

    pub fn from_file(path: &Path) -> StevedoreResult<Self> {
        let data = std::fs::read(path).map_err(|e| {
            StevedoreError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            StevedoreError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn config_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(env_vars::CONFIG) {
            return Some(PathBuf::from(path));
        }
        let candidates = [
            dirs::config_dir().map(|d| d.join("stevedore/config.json")),
            Some(PathBuf::from("/etc/stevedore/config.json")),
        ];
        candidates.into_iter().flatten().find(|p| p.exists())
    }

    fn apply_env(&mut self) {
        if let Some(root) = std::env::var_os(env_vars::ROOT) {
            self.root = PathBuf::from(root);
        }
        if let Some(run_root) = std::env::var_os(env_vars::RUNROOT) {
            self.run_root = PathBuf::from(run_root);
        }
        if let Ok(isolation) = std::env::var(env_vars::ISOLATION) {
            match isolation.parse() {
                Ok(isolation) => self.isolation = isolation,
                Err(e) => tracing::warn!(error = %e, "Ignoring {}", env_vars::ISOLATION),
            }
        }
        if let Ok(runtime) = std::env::var(env_vars::RUNTIME) {
            self.runtime = runtime;
        }
    }

    /// Context rooted in a scratch directory, for tests and tools.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            run_root: root.join("run"),
            root: root.join("storage"),
            ..Self::default()
        }
    }

    pub fn with_registries(mut self, registries: Vec<String>) -> Self {
        self.registries = registries;
        self
    }

    pub fn with_signature_policy(mut self, path: impl Into<PathBuf>) -> Self {
        self.signature_policy = Some(path.into());
        self
    }

    pub fn layout(&self) -> StoreLayout {
        StoreLayout::new(self.root.clone(), self.run_root.clone())
    }

    /// Signature policy path: explicit setting, else the user's
    /// `containers/policy.json`, else the system one.
    pub fn policy_path(&self) -> PathBuf {
        if let Some(path) = &self.signature_policy {
            return path.clone();
        }
        if let Some(user) = dirs::config_dir().map(|d| d.join("containers/policy.json"))
            && user.exists()
        {
            return user;
        }
        PathBuf::from("/etc/containers/policy.json")
    }

    /// Registry credentials file: explicit setting, `$REGISTRY_AUTH_FILE`,
    /// then `$XDG_RUNTIME_DIR/containers/auth.json`, then `~/.docker/config.json`.
    pub fn auth_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.auth_file {
            return Some(path.clone());
        }
        if let Some(path) = std::env::var_os("REGISTRY_AUTH_FILE") {
            return Some(PathBuf::from(path));
        }
        let candidates = [
            dirs::runtime_dir().map(|d| d.join("containers/auth.json")),
            dirs::home_dir().map(|d| d.join(".docker/config.json")),
        ];
        candidates.into_iter().flatten().find(|p| p.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_has_capabilities_and_transport() {
        let ctx = SystemContext::default();
        assert_eq!(ctx.default_transport, "docker://");
        assert_eq!(ctx.runtime, "runc");
        assert!(ctx.default_capabilities.contains(&"CAP_CHOWN".to_string()));
        assert!(ctx.registries.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"root": "/srv/store", "registries": ["quay.io"], "isolation": "chroot"}"#,
        )
        .unwrap();

        let ctx = SystemContext::from_file(&path).unwrap();
        assert_eq!(ctx.root, PathBuf::from("/srv/store"));
        assert_eq!(ctx.registries, vec!["quay.io".to_string()]);
        assert_eq!(ctx.isolation, Isolation::Chroot);
        assert_eq!(ctx.runtime, "runc");
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = SystemContext::from_file(&path).unwrap_err();
        assert!(matches!(err, StevedoreError::Config(_)));
    }

    #[test]
    fn test_isolation_parse() {
        assert_eq!("chroot".parse::<Isolation>().unwrap(), Isolation::Chroot);
        assert_eq!("OCI".parse::<Isolation>().unwrap(), Isolation::Oci);
        assert!("jail".parse::<Isolation>().is_err());
    }

    #[test]
    fn test_with_root_layout() {
        let ctx = SystemContext::with_root("/tmp/x");
        let layout = ctx.layout();
        assert_eq!(layout.root(), Path::new("/tmp/x/storage"));
        assert_eq!(layout.run_root(), Path::new("/tmp/x/run"));
    }

    #[test]
    fn test_explicit_policy_path_wins() {
        let ctx = SystemContext::default().with_signature_policy("/custom/policy.json");
        assert_eq!(ctx.policy_path(), PathBuf::from("/custom/policy.json"));
    }
}
