//! Options for creating builders and the settings they persist.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::idtools::{IdMap, IdMappings, parse_id_map};
use crate::image::pull::PullPolicy;
use crate::system::Isolation;

/// Kinds of Linux namespaces a run can configure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    User,
    Network,
    Pid,
    Uts,
    Ipc,
    Mount,
    Cgroup,
}

impl NamespaceKind {
    pub const ALL: [NamespaceKind; 7] = [
        NamespaceKind::User,
        NamespaceKind::Network,
        NamespaceKind::Pid,
        NamespaceKind::Uts,
        NamespaceKind::Ipc,
        NamespaceKind::Mount,
        NamespaceKind::Cgroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceKind::User => "user",
            NamespaceKind::Network => "network",
            NamespaceKind::Pid => "pid",
            NamespaceKind::Uts => "uts",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Mount => "mount",
            NamespaceKind::Cgroup => "cgroup",
        }
    }
}

impl FromStr for NamespaceKind {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" | "userns" => Ok(NamespaceKind::User),
            "net" | "network" => Ok(NamespaceKind::Network),
            "pid" => Ok(NamespaceKind::Pid),
            "uts" => Ok(NamespaceKind::Uts),
            "ipc" => Ok(NamespaceKind::Ipc),
            "mount" | "mnt" => Ok(NamespaceKind::Mount),
            "cgroup" | "cgroupns" => Ok(NamespaceKind::Cgroup),
            other => Err(StevedoreError::InvalidArgument(format!(
                "unknown namespace {:?}",
                other
            ))),
        }
    }
}

/// How one namespace is provided.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "path")]
pub enum NamespaceMode {
    /// Share the caller's namespace.
    Host,
    /// Join the namespace at this path.
    Path(PathBuf),
    /// Create a new namespace.
    New,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceOption {
    pub kind: NamespaceKind,
    pub mode: NamespaceMode,
}

impl NamespaceOption {
    pub fn new(kind: NamespaceKind, mode: NamespaceMode) -> Self {
        Self { kind, mode }
    }

    /// Parse `kind=host|private|<path>`.
    pub fn parse(spec: &str) -> StevedoreResult<Self> {
        let (kind, value) = spec.split_once('=').ok_or_else(|| {
            StevedoreError::InvalidArgument(format!("namespace option {:?} is not kind=value", spec))
        })?;
        let mode = match value {
            "host" => NamespaceMode::Host,
            "" | "private" | "new" => NamespaceMode::New,
            path if path.starts_with('/') => NamespaceMode::Path(PathBuf::from(path)),
            other => {
                return Err(StevedoreError::InvalidArgument(format!(
                    "namespace value {:?} is not host, private or an absolute path",
                    other
                )));
            }
        };
        Ok(Self::new(kind.parse()?, mode))
    }
}

/// Namespace settings; later entries override earlier ones of the same kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceOptions(pub Vec<NamespaceOption>);

impl NamespaceOptions {
    pub fn get(&self, kind: NamespaceKind) -> Option<&NamespaceMode> {
        self.0.iter().rev().find(|o| o.kind == kind).map(|o| &o.mode)
    }

    pub fn set(&mut self, kind: NamespaceKind, mode: NamespaceMode) {
        self.0.retain(|o| o.kind != kind);
        self.0.push(NamespaceOption::new(kind, mode));
    }

    /// Apply `overrides` on top of these options.
    pub fn merged(&self, overrides: &NamespaceOptions) -> NamespaceOptions {
        let mut merged = self.clone();
        for option in &overrides.0 {
            merged.set(option.kind, option.mode.clone());
        }
        merged
    }
}

/// Container user-namespace ID mappings as requested by the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappingOptions {
    /// Run without a user namespace even when rootless.
    #[serde(default)]
    pub host_uid_mapping: bool,
    #[serde(default)]
    pub host_gid_mapping: bool,
    #[serde(default)]
    pub uid_map: Vec<IdMap>,
    #[serde(default)]
    pub gid_map: Vec<IdMap>,
}

impl IdMappingOptions {
    /// Parse `--userns-uid-map` / `--userns-gid-map` style strings.
    pub fn from_specs(uid_map: Option<&str>, gid_map: Option<&str>) -> StevedoreResult<Self> {
        let uid_map = uid_map.map(parse_id_map).transpose()?.unwrap_or_default();
        let gid_map = match gid_map {
            Some(spec) => parse_id_map(spec)?,
            None => uid_map.clone(),
        };
        Ok(Self {
            uid_map,
            gid_map,
            ..Self::default()
        })
    }

    pub fn mappings(&self) -> IdMappings {
        IdMappings::new(self.uid_map.clone(), self.gid_map.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.uid_map.is_empty() && self.gid_map.is_empty()
    }
}

/// Resource and security settings shared by every run of a builder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonBuildOptions {
    #[serde(default)]
    pub add_host: Vec<String>,
    #[serde(default)]
    pub cpu_period: Option<u64>,
    #[serde(default)]
    pub cpu_quota: Option<i64>,
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    #[serde(default)]
    pub cpuset_cpus: Option<String>,
    #[serde(default)]
    pub cpuset_mems: Option<String>,
    /// Memory limit in bytes.
    #[serde(default)]
    pub memory: Option<i64>,
    /// Memory plus swap limit in bytes; -1 for unlimited.
    #[serde(default)]
    pub memory_swap: Option<i64>,
    #[serde(default)]
    pub ulimit: Vec<String>,
    /// Size of `/dev/shm`, e.g. `64m`.
    #[serde(default)]
    pub shm_size: Option<String>,
    #[serde(default)]
    pub apparmor_profile: Option<String>,
    /// Path to a seccomp JSON profile, or `unconfined`.
    #[serde(default)]
    pub seccomp_profile_path: Option<String>,
    #[serde(default)]
    pub label_opts: Vec<String>,
    /// `host:container[:options]` bind volumes applied to every run.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub dns_search: Vec<String>,
    #[serde(default)]
    pub dns_options: Vec<String>,
    #[serde(default)]
    pub no_hosts: bool,
}

/// Inputs to [`crate::builder::Builder::new`].
#[derive(Clone, Debug, Default)]
pub struct BuilderOptions {
    /// Base image, or `scratch`.
    pub from: String,
    pub pull_policy: PullPolicy,
    /// Registry tried first for unqualified `from` names.
    pub registry: Option<String>,
    /// Transport used when `from` names none.
    pub transport: Option<String>,
    /// Explicit container name; generated from the image name otherwise.
    pub container_name: Option<String>,
    pub isolation: Option<Isolation>,
    pub namespace_options: NamespaceOptions,
    pub id_mapping_options: IdMappingOptions,
    pub common: CommonBuildOptions,
    /// Default capability set; the context's set when `None`.
    pub capabilities: Option<Vec<String>>,
    /// Network configurations (CNI network names) joined by runs.
    pub networks: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_option_parse() {
        let opt = NamespaceOption::parse("net=host").unwrap();
        assert_eq!(opt.kind, NamespaceKind::Network);
        assert_eq!(opt.mode, NamespaceMode::Host);

        let opt = NamespaceOption::parse("pid=/proc/1/ns/pid").unwrap();
        assert_eq!(opt.mode, NamespaceMode::Path(PathBuf::from("/proc/1/ns/pid")));

        let opt = NamespaceOption::parse("uts=private").unwrap();
        assert_eq!(opt.mode, NamespaceMode::New);

        assert!(NamespaceOption::parse("bogus=host").is_err());
        assert!(NamespaceOption::parse("net").is_err());
    }

    #[test]
    fn test_namespace_overrides() {
        let mut base = NamespaceOptions::default();
        base.set(NamespaceKind::Network, NamespaceMode::New);
        base.set(NamespaceKind::Pid, NamespaceMode::New);
        let mut overrides = NamespaceOptions::default();
        overrides.set(NamespaceKind::Network, NamespaceMode::Host);

        let merged = base.merged(&overrides);
        assert_eq!(merged.get(NamespaceKind::Network), Some(&NamespaceMode::Host));
        assert_eq!(merged.get(NamespaceKind::Pid), Some(&NamespaceMode::New));
        assert_eq!(merged.get(NamespaceKind::Uts), None);
    }

    #[test]
    fn test_id_mapping_specs_default_gid_to_uid() {
        let opts = IdMappingOptions::from_specs(Some("0:100000:65536"), None).unwrap();
        assert_eq!(opts.uid_map, vec![IdMap::new(0, 100000, 65536)]);
        assert_eq!(opts.gid_map, opts.uid_map);
    }
}
