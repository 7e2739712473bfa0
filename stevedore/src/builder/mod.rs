//! Working containers and their persisted build state.
//!
//! A [`Builder`] pairs a store container with a `stevedore.json` record in
//! the container's scratch directory. The record carries the inherited
//! image's raw config and manifest, the decoded configs being edited, and
//! everything a later `run` or `commit` needs.
//!
//! ```text
//! new()/import_container() → save() → mount/config/add/run … → commit → delete()
//! ```

pub mod add;
pub mod config;
pub mod linked;
pub mod options;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stevedore_shared::constants::package::{STATE_FILE, STATE_TYPE};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing::{debug, info, warn};

pub use add::AddOptions;
pub use linked::LinkedLayer;
pub use options::{
    BuilderOptions, CommonBuildOptions, IdMappingOptions, NamespaceKind, NamespaceMode,
    NamespaceOption, NamespaceOptions,
};

use crate::idtools::IdMappings;
use crate::image::config::ImageConfig;
use crate::image::pull::{PullOptions, Puller, find_local_image};
use crate::image::reference::parse_named;
use crate::run::selinux;
use crate::storage::{CONFIG_KEY, ContainerOptions, ContainerRecord, MANIFEST_KEY, Store};
use crate::system::{Isolation, SystemContext};
use crate::util::fs::{atomic_write_json, read_json};

/// Base image name meaning "no base image".
pub const SCRATCH: &str = "scratch";

/// Highest numeric suffix tried when generating a container name.
const MAX_NAME_SUFFIX: u32 = 9999;

/// Persisted state of one working container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuilderState {
    /// Ownership marker; records without it belong to someone else.
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(rename = "FromImage", default)]
    pub from_image: String,
    #[serde(rename = "FromImageID", default)]
    pub from_image_id: String,
    /// Raw config blob of the base image.
    #[serde(rename = "Config", default, with = "base64_bytes")]
    pub source_config: Vec<u8>,
    /// Raw manifest of the base image.
    #[serde(rename = "Manifest", default, with = "base64_bytes")]
    pub source_manifest: Vec<u8>,
    #[serde(rename = "Container", default)]
    pub container: String,
    #[serde(rename = "ContainerID", default)]
    pub container_id: String,
    #[serde(rename = "MountPoint", default)]
    pub mount_point: Option<PathBuf>,
    #[serde(rename = "MountLabel", default)]
    pub mount_label: String,
    #[serde(rename = "ProcessLabel", default)]
    pub process_label: String,
    #[serde(rename = "ImageAnnotations", default)]
    pub image_annotations: BTreeMap<String, String>,
    #[serde(rename = "ImageCreatedBy", default)]
    pub created_by: String,
    #[serde(rename = "HistoryComment", default)]
    pub history_comment: String,
    #[serde(rename = "OCIv1", default)]
    pub oci_config: ImageConfig,
    #[serde(rename = "Docker", default)]
    pub docker_config: ImageConfig,
    #[serde(rename = "Links", default)]
    pub links: Vec<PathBuf>,
    #[serde(rename = "PrependedLinkedLayers", default)]
    pub prepended_linked_layers: Vec<LinkedLayer>,
    #[serde(rename = "AppendedLinkedLayers", default)]
    pub appended_linked_layers: Vec<LinkedLayer>,
    #[serde(rename = "CommonBuildOpts", default)]
    pub common_build_opts: CommonBuildOptions,
    #[serde(rename = "NamespaceOptions", default)]
    pub namespace_options: NamespaceOptions,
    #[serde(rename = "IDMappingOptions", default)]
    pub id_mapping_options: IdMappingOptions,
    #[serde(rename = "Isolation", default)]
    pub isolation: Isolation,
    #[serde(rename = "Capabilities", default)]
    pub capabilities: Vec<String>,
    #[serde(rename = "Networks", default)]
    pub networks: Vec<String>,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A working container being turned into an image.
pub struct Builder {
    context: SystemContext,
    store: Arc<dyn Store>,
    state: BuilderState,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("container", &self.state.container)
            .field("container_id", &self.state.container_id)
            .field("from_image", &self.state.from_image)
            .finish()
    }
}

impl Builder {
    /// Create a working container from `options.from`, pulling the base
    /// image per the pull policy.
    pub async fn new(
        context: &SystemContext,
        store: Arc<dyn Store>,
        options: BuilderOptions,
    ) -> StevedoreResult<Builder> {
        let mut state = BuilderState {
            typ: STATE_TYPE.to_string(),
            isolation: options.isolation.unwrap_or(context.isolation),
            capabilities: options
                .capabilities
                .clone()
                .unwrap_or_else(|| context.default_capabilities.clone()),
            common_build_opts: options.common.clone(),
            namespace_options: options.namespace_options.clone(),
            id_mapping_options: options.id_mapping_options.clone(),
            networks: options.networks.clone(),
            ..BuilderState::default()
        };

        let from = options.from.trim();
        let image_id = if from.is_empty() || from == SCRATCH {
            state.oci_config = ImageConfig::for_host();
            state.docker_config = ImageConfig::for_host();
            None
        } else {
            let puller = Puller::new(context.clone(), store.clone());
            let pull_options = PullOptions {
                policy: options.pull_policy,
                registry: options.registry.clone(),
                transport: options.transport.clone(),
                ..PullOptions::default()
            };
            let pulled = puller.pull(from, &pull_options).await?;
            state.from_image = pulled.local_name.clone();
            state.from_image_id = pulled.image.id.clone();
            install_source_image(store.as_ref(), &pulled.image.id, &mut state)?;
            Some(pulled.image.id)
        };

        let (process_label, mount_label) = selinux::generate_labels(&state.common_build_opts.label_opts)?;
        state.mount_label = mount_label;
        state.process_label = process_label;

        let container = create_named_container(
            store.as_ref(),
            &options,
            &state.from_image,
            image_id.as_deref(),
            state.id_mapping_options.mappings(),
        )?;
        state.container = container.names.first().cloned().unwrap_or_default();
        state.container_id = container.id.clone();

        let builder = Builder {
            context: context.clone(),
            store,
            state,
        };
        if let Err(e) = builder.save() {
            if let Err(cleanup) = builder.store.delete_container(&container.id) {
                warn!(container = %container.id, error = %cleanup, "Failed to remove container after save error");
            }
            return Err(e);
        }
        info!(
            container = %builder.state.container,
            id = %builder.state.container_id,
            from = %builder.state.from_image,
            "Created working container"
        );
        Ok(builder)
    }

    /// Open the builder for a container this system created.
    pub fn open(
        context: &SystemContext,
        store: Arc<dyn Store>,
        id_or_name: &str,
    ) -> StevedoreResult<Builder> {
        let record = store.container(id_or_name)?;
        let state_path = store.container_directory(&record.id)?.join(STATE_FILE);
        if !state_path.exists() {
            return Err(StevedoreError::NotOurContainer(id_or_name.to_string()));
        }
        let state: BuilderState = read_json(&state_path)
            .map_err(|_| StevedoreError::NotOurContainer(id_or_name.to_string()))?;
        if state.typ != STATE_TYPE || state.container_id != record.id {
            debug!(container = %record.id, typ = %state.typ, "State record is not ours");
            return Err(StevedoreError::NotOurContainer(id_or_name.to_string()));
        }
        Ok(Builder {
            context: context.clone(),
            store,
            state,
        })
    }

    /// Open every builder in the store, skipping foreign containers.
    pub fn open_all(context: &SystemContext, store: Arc<dyn Store>) -> StevedoreResult<Vec<Builder>> {
        let mut builders = Vec::new();
        for record in store.containers()? {
            match Builder::open(context, store.clone(), &record.id) {
                Ok(builder) => builders.push(builder),
                Err(StevedoreError::NotOurContainer(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(builders)
    }

    /// Adopt an existing container. A container we already track is
    /// simply opened.
    pub fn import_container(
        context: &SystemContext,
        store: Arc<dyn Store>,
        id_or_name: &str,
    ) -> StevedoreResult<Builder> {
        let record = store.container(id_or_name)?;
        let state_path = store.container_directory(&record.id)?.join(STATE_FILE);
        if state_path.exists() {
            return Builder::open(context, store, &record.id);
        }

        let mut state = BuilderState {
            typ: STATE_TYPE.to_string(),
            container: record.names.first().cloned().unwrap_or_else(|| record.id.clone()),
            container_id: record.id.clone(),
            isolation: context.isolation,
            capabilities: context.default_capabilities.clone(),
            id_mapping_options: IdMappingOptions {
                uid_map: record.id_mappings.uid_map.clone(),
                gid_map: record.id_mappings.gid_map.clone(),
                ..IdMappingOptions::default()
            },
            ..BuilderState::default()
        };
        import_base(store.as_ref(), &record, &mut state)?;
        let (process_label, mount_label) = selinux::generate_labels(&[])?;
        state.mount_label = mount_label;
        state.process_label = process_label;

        let builder = Builder {
            context: context.clone(),
            store,
            state,
        };
        builder.save()?;
        info!(container = %builder.state.container, "Imported container");
        Ok(builder)
    }

    /// A read-only builder over an image, with no container behind it.
    pub fn import_image(
        context: &SystemContext,
        store: Arc<dyn Store>,
        name: &str,
    ) -> StevedoreResult<Builder> {
        let image = find_local_image(store.as_ref(), name)?;
        let mut state = BuilderState {
            typ: STATE_TYPE.to_string(),
            from_image: image.names.first().cloned().unwrap_or_else(|| name.to_string()),
            from_image_id: image.id.clone(),
            isolation: context.isolation,
            capabilities: context.default_capabilities.clone(),
            ..BuilderState::default()
        };
        install_source_image(store.as_ref(), &image.id, &mut state)?;
        Ok(Builder {
            context: context.clone(),
            store,
            state,
        })
    }

    pub fn state(&self) -> &BuilderState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut BuilderState {
        &mut self.state
    }

    pub fn context(&self) -> &SystemContext {
        &self.context
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn container_id(&self) -> &str {
        &self.state.container_id
    }

    pub fn container_name(&self) -> &str {
        &self.state.container
    }

    pub fn from_image(&self) -> &str {
        &self.state.from_image
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.state.mount_point.as_deref()
    }

    pub fn id_mappings(&self) -> IdMappings {
        self.state.id_mapping_options.mappings()
    }

    /// Whether a store container backs this builder.
    pub fn has_container(&self) -> bool {
        !self.state.container_id.is_empty()
    }

    pub(crate) fn require_container(&self) -> StevedoreResult<&str> {
        if self.has_container() {
            Ok(&self.state.container_id)
        } else {
            Err(StevedoreError::InvalidArgument(format!(
                "builder for image {} has no container",
                self.state.from_image
            )))
        }
    }

    fn state_path(&self) -> StevedoreResult<PathBuf> {
        let id = self.require_container()?;
        Ok(self.store.container_directory(id)?.join(STATE_FILE))
    }

    /// Atomically rewrite the state record. Links whose symlink is gone are
    /// forgotten; the rest stay recorded so `delete` can remove them.
    pub fn save(&self) -> StevedoreResult<()> {
        let path = self.state_path()?;
        let mut state = self.state.clone();
        state.links.retain(|link| {
            fs::symlink_metadata(link).is_ok_and(|m| m.file_type().is_symlink())
        });
        atomic_write_json(&path, &state)?;
        debug!(container = %state.container_id, path = %path.display(), "Saved builder state");
        Ok(())
    }

    /// Remove every link, then the container. The state record goes with
    /// the container. Link failures are reported together after the
    /// container is gone.
    pub fn delete(&mut self) -> StevedoreResult<()> {
        let id = self.require_container()?.to_string();
        let mut errors = Vec::new();
        for link in std::mem::take(&mut self.state.links) {
            match fs::remove_file(&link) {
                Ok(()) => debug!(link = %link.display(), "Removed link"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(link = %link.display(), error = %e, "Failed to remove link");
                    errors.push(StevedoreError::io(
                        format!("Failed to remove link {}", link.display()),
                        e,
                    ));
                }
            }
        }

        if let Err(e) = self.store.unmount_container(&id, true) {
            debug!(container = %id, error = %e, "Unmount before delete failed");
        }
        self.store.delete_container(&id)?;
        self.state.mount_point = None;
        self.state.container_id.clear();
        info!(container = %self.state.container, id = %id, "Deleted working container");

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(StevedoreError::Multiple(errors)),
        }
    }

    /// Mount the container's rootfs and record where.
    pub fn mount(&mut self) -> StevedoreResult<PathBuf> {
        let id = self.require_container()?.to_string();
        let path = self.store.mount_container(&id)?;
        self.state.mount_point = Some(path.clone());
        self.save()?;
        debug!(container = %id, mount_point = %path.display(), "Mounted container");
        Ok(path)
    }

    pub fn unmount(&mut self) -> StevedoreResult<()> {
        let id = self.require_container()?.to_string();
        let still_mounted = self.store.unmount_container(&id, false)?;
        if !still_mounted {
            self.state.mount_point = None;
        }
        self.save()
    }

    /// The mount point, mounting first if needed.
    pub fn ensure_mounted(&mut self) -> StevedoreResult<PathBuf> {
        match &self.state.mount_point {
            Some(path) if path.is_dir() => Ok(path.clone()),
            _ => self.mount(),
        }
    }

    /// Create a symlink at `path` pointing at the mount point.
    pub fn link(&mut self, path: &Path) -> StevedoreResult<()> {
        let mount_point = self.ensure_mounted()?;
        if !is_live_link(path, Some(&mount_point)) {
            if fs::symlink_metadata(path).is_ok() {
                return Err(StevedoreError::InvalidArgument(format!(
                    "{} already exists",
                    path.display()
                )));
            }
            std::os::unix::fs::symlink(&mount_point, path).map_err(|e| {
                StevedoreError::io(format!("Failed to create link {}", path.display()), e)
            })?;
        }
        if !self.state.links.iter().any(|l| l == path) {
            self.state.links.push(path.to_path_buf());
        }
        self.save()
    }
}

fn is_live_link(link: &Path, mount_point: Option<&Path>) -> bool {
    match (fs::read_link(link), mount_point) {
        (Ok(target), Some(mount_point)) => target == mount_point,
        _ => false,
    }
}

/// Copy the image's stored manifest and config into `state`.
fn install_source_image(store: &dyn Store, image_id: &str, state: &mut BuilderState) -> StevedoreResult<()> {
    state.source_manifest = optional_big_data(store, image_id, MANIFEST_KEY)?;
    state.source_config = optional_big_data(store, image_id, CONFIG_KEY)?;
    let decoded = if state.source_config.is_empty() {
        ImageConfig::for_host()
    } else {
        ImageConfig::from_slice(&state.source_config)?
    };
    state.oci_config = decoded.to_oci();
    state.docker_config = decoded;
    Ok(())
}

fn optional_big_data(store: &dyn Store, image_id: &str, key: &str) -> StevedoreResult<Vec<u8>> {
    match store.image_big_data(image_id, key) {
        Ok(data) => Ok(data),
        Err(StevedoreError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn import_base(store: &dyn Store, record: &ContainerRecord, state: &mut BuilderState) -> StevedoreResult<()> {
    if record.image.is_empty() {
        state.oci_config = ImageConfig::for_host();
        state.docker_config = ImageConfig::for_host();
        return Ok(());
    }
    let image = store.image(&record.image)?;
    state.from_image = image.names.first().cloned().unwrap_or_else(|| image.id.clone());
    state.from_image_id = image.id.clone();
    install_source_image(store, &image.id, state)
}

/// `<base>-working-container` where base is the last path component of
/// the image's repository.
pub fn container_base_name(image_name: &str) -> String {
    let repository = match parse_named(image_name) {
        Ok(named) => named.repository().to_string(),
        Err(_) => String::new(),
    };
    match repository.rsplit('/').next() {
        Some(base) if !base.is_empty() && !image_name.starts_with('@') => {
            format!("{}-working-container", base)
        }
        _ => "working-container".to_string(),
    }
}

fn create_named_container(
    store: &dyn Store,
    options: &BuilderOptions,
    image_name: &str,
    image_id: Option<&str>,
    id_mappings: IdMappings,
) -> StevedoreResult<ContainerRecord> {
    let mut container_options = ContainerOptions {
        names: Vec::new(),
        image: image_id.map(str::to_string),
        metadata: STATE_TYPE.to_string(),
        id_mappings,
    };

    if let Some(name) = &options.container_name {
        container_options.names = vec![name.clone()];
        return store.create_container(&container_options);
    }

    let base = container_base_name(image_name);
    for suffix in 1..=MAX_NAME_SUFFIX {
        let name = match suffix {
            1 => base.clone(),
            n => format!("{}-{}", base, n),
        };
        container_options.names = vec![name.clone()];
        match store.create_container(&container_options) {
            Ok(record) => return Ok(record),
            Err(StevedoreError::NameInUse(_)) => {
                debug!(name = %name, "Container name taken, trying next suffix");
            }
            Err(e) => return Err(e),
        }
    }
    Err(StevedoreError::NameInUse(format!(
        "{} (tried {} suffixes)",
        base, MAX_NAME_SUFFIX
    )))
}
