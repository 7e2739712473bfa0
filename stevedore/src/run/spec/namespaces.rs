//! Which namespaces a run gets, and its user-namespace ID mappings.

use oci_spec::runtime::{
    LinuxIdMapping, LinuxIdMappingBuilder, LinuxNamespace, LinuxNamespaceBuilder,
    LinuxNamespaceType,
};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::builder::{IdMappingOptions, NamespaceKind, NamespaceMode, NamespaceOptions};
use crate::idtools::{IdMap, IdMappings, current_process_mappings};

/// Whether network setup runs for a new network namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// Configure networks when the namespace is new.
    #[default]
    Default,
    /// Loopback only.
    Disabled,
}

/// One network the container joins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkAttachment {
    /// Network name; empty for the default network.
    pub network: String,
    pub interface: String,
}

#[derive(Clone, Debug, Default)]
pub struct NamespacePlan {
    pub namespaces: Vec<LinuxNamespace>,
    pub mappings: IdMappings,
    pub new_user: bool,
    pub new_net: bool,
    pub new_uts: bool,
    /// Networks to attach once the child exists; empty when none.
    pub attachments: Vec<NetworkAttachment>,
}

impl NamespacePlan {
    pub fn configure_network(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn uid_mappings(&self) -> StevedoreResult<Vec<LinuxIdMapping>> {
        to_oci_mappings(&self.mappings.uid_map)
    }

    pub fn gid_mappings(&self) -> StevedoreResult<Vec<LinuxIdMapping>> {
        to_oci_mappings(&self.mappings.gid_map)
    }
}

fn oci_type(kind: NamespaceKind) -> LinuxNamespaceType {
    match kind {
        NamespaceKind::User => LinuxNamespaceType::User,
        NamespaceKind::Network => LinuxNamespaceType::Network,
        NamespaceKind::Pid => LinuxNamespaceType::Pid,
        NamespaceKind::Uts => LinuxNamespaceType::Uts,
        NamespaceKind::Ipc => LinuxNamespaceType::Ipc,
        NamespaceKind::Mount => LinuxNamespaceType::Mount,
        NamespaceKind::Cgroup => LinuxNamespaceType::Cgroup,
    }
}

/// Mode used when nothing was configured for `kind`. Everything but the
/// user and cgroup namespaces is private by default.
fn default_mode(kind: NamespaceKind) -> NamespaceMode {
    match kind {
        NamespaceKind::User | NamespaceKind::Cgroup => NamespaceMode::Host,
        _ => NamespaceMode::New,
    }
}

fn namespace(kind: NamespaceKind, path: Option<&std::path::Path>) -> StevedoreResult<LinuxNamespace> {
    let mut builder = LinuxNamespaceBuilder::default().typ(oci_type(kind));
    if let Some(path) = path {
        builder = builder.path(path.to_path_buf());
    }
    builder
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build namespace: {}", e)))
}

fn to_oci_mappings(maps: &[IdMap]) -> StevedoreResult<Vec<LinuxIdMapping>> {
    maps.iter()
        .map(|m| {
            LinuxIdMappingBuilder::default()
                .container_id(m.container_id)
                .host_id(m.host_id)
                .size(m.size)
                .build()
                .map_err(|e| StevedoreError::Internal(format!("Failed to build id mapping: {}", e)))
        })
        .collect()
}

/// Identity mappings over the ranges this process can see.
fn inherited_mappings() -> StevedoreResult<IdMappings> {
    let current = current_process_mappings()?;
    let identity = |maps: &[IdMap]| {
        maps.iter()
            .map(|m| IdMap::new(m.container_id, m.container_id, m.size))
            .collect::<Vec<_>>()
    };
    Ok(IdMappings::new(identity(&current.uid_map), identity(&current.gid_map)))
}

/// Decide every namespace for a run.
///
/// `configured` are the builder's settings with per-run overrides already
/// merged. A user namespace is created when ID mappings exist or when one
/// was asked for; with no mappings it inherits this process's ranges 1:1.
pub fn plan(
    configured: &NamespaceOptions,
    id_mappings: &IdMappingOptions,
    networks: &[String],
    policy: NetworkPolicy,
) -> StevedoreResult<NamespacePlan> {
    let mut out = NamespacePlan::default();

    let mut user_mode = configured
        .get(NamespaceKind::User)
        .cloned()
        .unwrap_or_else(|| default_mode(NamespaceKind::User));
    let host_ids = id_mappings.host_uid_mapping && id_mappings.host_gid_mapping;
    let has_mappings = !id_mappings.is_empty() && !host_ids;
    if has_mappings && user_mode == NamespaceMode::Host {
        user_mode = NamespaceMode::New;
    }

    for kind in NamespaceKind::ALL {
        let mode = if kind == NamespaceKind::User {
            user_mode.clone()
        } else {
            configured.get(kind).cloned().unwrap_or_else(|| default_mode(kind))
        };
        match &mode {
            NamespaceMode::Host => continue,
            NamespaceMode::Path(path) => out.namespaces.push(namespace(kind, Some(path))?),
            NamespaceMode::New => out.namespaces.push(namespace(kind, None)?),
        }
        let new = mode == NamespaceMode::New;
        match kind {
            NamespaceKind::User => out.new_user = new,
            NamespaceKind::Network => out.new_net = new,
            NamespaceKind::Uts => out.new_uts = new,
            _ => {}
        }
    }

    if out.new_user {
        out.mappings = if has_mappings {
            id_mappings.mappings()
        } else {
            inherited_mappings()?
        };
    }

    if out.new_net && policy != NetworkPolicy::Disabled {
        let names: Vec<String> = if networks.is_empty() {
            vec![String::new()]
        } else {
            networks.to_vec()
        };
        out.attachments = names
            .into_iter()
            .enumerate()
            .map(|(i, network)| NetworkAttachment {
                network,
                interface: format!("eth{}", i),
            })
            .collect();
    }
    Ok(out)
}
