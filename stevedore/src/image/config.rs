//! Image configuration blobs.
//!
//! [`ImageConfig`] models the OCI v1 image config plus the Docker-only
//! fields (`container`, `docker_version`, `Healthcheck`, ...). The Docker
//! extras are skipped when empty, so an OCI config round-trips unchanged.
//! Maps are `BTreeMap`s so serialized output is deterministic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use super::manifest::{Platform, host_architecture, host_os};

/// Marker value stored for set-like maps (`ExposedPorts`, `Volumes`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(rename = "Test", default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<String>,
    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(rename = "Timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(rename = "StartPeriod", default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<i64>,
    #[serde(rename = "Retries", default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<i64>,
}

/// The `config` section: how a container from this image runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Hostname", default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(rename = "Domainname", default, skip_serializing_if = "String::is_empty")]
    pub domainname: String,
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, Empty>,
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Healthcheck", default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthConfig>,
    #[serde(rename = "Volumes", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Empty>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "StopSignal", default, skip_serializing_if = "String::is_empty")]
    pub stop_signal: String,
    #[serde(rename = "Shell", default, skip_serializing_if = "Vec::is_empty")]
    pub shell: Vec<String>,
    #[serde(rename = "OnBuild", default, skip_serializing_if = "Vec::is_empty")]
    pub on_build: Vec<String>,
}

impl ContainerConfig {
    /// Value of an environment variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| match entry.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            None if entry == key => Some(""),
            _ => None,
        })
    }

    /// Set a variable, replacing an existing definition in place or
    /// appending a new one.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        match self.env.iter().position(|e| env_key(e) == key) {
            Some(pos) => self.env[pos] = entry,
            None => self.env.push(entry),
        }
    }

    pub fn unset_env(&mut self, key: &str) {
        self.env.retain(|e| env_key(e) != key);
    }

    /// Merge `KEY=VALUE` entries, later ones winning.
    pub fn merge_env<'a>(&mut self, entries: impl IntoIterator<Item = &'a str>) {
        for entry in entries {
            let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
            self.set_env(key, value);
        }
    }
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

/// Normalize `8080` to `8080/tcp`; validate the port and protocol.
pub fn normalize_port(port_spec: &str) -> StevedoreResult<String> {
    let (port, protocol) = port_spec.split_once('/').unwrap_or((port_spec, "tcp"));
    let valid_port = match port.split_once('-') {
        Some((lo, hi)) => lo.parse::<u16>().is_ok() && hi.parse::<u16>().is_ok(),
        None => port.parse::<u16>().is_ok(),
    };
    if !valid_port || !matches!(protocol, "tcp" | "udp" | "sctp") {
        return Err(StevedoreError::InvalidArgument(format!(
            "invalid port specification {:?}",
            port_spec
        )));
    }
    Ok(format!("{}/{}", port, protocol))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            typ: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// An image config blob, OCI or Docker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,

    // Docker-only fields.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<ContainerConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

impl ImageConfig {
    /// Empty config for the running host's platform.
    pub fn for_host() -> Self {
        Self {
            architecture: host_architecture().to_string(),
            os: host_os().to_string(),
            ..Default::default()
        }
    }

    pub fn from_slice(bytes: &[u8]) -> StevedoreResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StevedoreError::Image(format!("Failed to parse image config: {}", e)))
    }

    pub fn to_vec(&self) -> StevedoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Fill empty architecture/os with host defaults.
    pub fn default_platform(&mut self) {
        if self.architecture.is_empty() {
            self.architecture = host_architecture().to_string();
        }
        if self.os.is_empty() {
            self.os = host_os().to_string();
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            os_version: (!self.os_version.is_empty()).then(|| self.os_version.clone()),
            variant: (!self.variant.is_empty()).then(|| self.variant.clone()),
            ..Default::default()
        }
    }

    /// Strip Docker-only fields for an OCI config.
    pub fn to_oci(&self) -> Self {
        let mut oci = self.clone();
        oci.container.clear();
        oci.container_config = None;
        oci.docker_version.clear();
        oci.comment.clear();
        oci.config.healthcheck = None;
        oci.config.hostname.clear();
        oci.config.domainname.clear();
        oci.config.shell.clear();
        oci.config.on_build.clear();
        oci
    }

    /// Count of history entries that describe a layer.
    pub fn non_empty_history(&self) -> usize {
        self.history.iter().filter(|h| !h.empty_layer).count()
    }
}
