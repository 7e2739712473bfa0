//! Mount list assembly for a run and teardown of what it created.
//!
//! Candidates are offered in precedence order: explicit mounts and `-v`
//! volumes, `--mount` directives, the runtime defaults, generated files,
//! then image volumes. The first mount at a destination wins and later
//! ones are dropped.

use std::collections::{BTreeMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use oci_spec::runtime::Mount;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::idtools::IdMappings;
use crate::image::pull::find_local_image;
use crate::run::cache;
use crate::run::mount_spec::{
    BindMount, CacheMount, Relabel, RunMount, SecretMount, SshMount, TmpfsMount, default_ssh_target,
};
use crate::run::secrets::{self, SecretSource};
use crate::run::selinux;
use crate::run::spec::mount;
use crate::run::ssh::{self, AgentSocket};
use crate::run::volumes::{builtin_volume, parse_volume_spec};
use crate::storage::Store;
use crate::system::FileLock;
use crate::util::fs::{remove_if_exists, secure_join};

/// Container paths whose new entries are left in place after a run.
const KEEP_PREFIXES: &[&str] = &["/etc", "/dev", "/sys", "/proc"];

/// Normalized form used to compare destinations.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Ordered mounts with unique destinations.
#[derive(Debug, Default)]
pub struct MountSet {
    mounts: Vec<Mount>,
    taken: HashSet<PathBuf>,
}

impl MountSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_taken(&self, destination: &Path) -> bool {
        self.taken.contains(&clean(destination))
    }

    /// Add `m` unless its destination is already used. Returns whether it
    /// was kept.
    pub fn offer(&mut self, m: Mount) -> bool {
        let dest = clean(m.destination());
        if !self.taken.insert(dest) {
            tracing::debug!(destination = %m.destination().display(), "Dropping shadowed mount");
            return false;
        }
        self.mounts.push(m);
        true
    }

    pub fn extend(&mut self, mounts: impl IntoIterator<Item = Mount>) {
        for m in mounts {
            self.offer(m);
        }
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn into_mounts(self) -> Vec<Mount> {
        self.mounts
    }
}

/// Resources a run's mounts hold until the command finishes.
#[derive(Debug, Default)]
pub struct RunMountArtifacts {
    /// Mount points created under the rootfs, outermost first.
    pub created_targets: Vec<PathBuf>,
    pub agents: Vec<AgentSocket>,
    /// Images mounted for `from=` binds.
    pub mounted_images: Vec<String>,
    pub secret_files: Vec<PathBuf>,
    pub locks: Vec<FileLock>,
    /// Private cache copies.
    pub scratch_dirs: Vec<PathBuf>,
    /// In-container path of the first ssh socket.
    pub ssh_auth_sock: Option<PathBuf>,
}

impl RunMountArtifacts {
    /// Release everything. Each failure is logged and collected; later
    /// steps still run.
    pub fn cleanup(self, store: &dyn Store) -> Vec<StevedoreError> {
        let mut errors = Vec::new();
        let mut record = |step: &str, result: StevedoreResult<()>| {
            if let Err(e) = result {
                tracing::warn!(step, error = %e, "Run mount cleanup failed");
                errors.push(e);
            }
        };

        for agent in self.agents {
            if let AgentSocket::Spawned(agent) = agent {
                record("ssh-agent", agent.shutdown());
            }
        }
        for image in &self.mounted_images {
            match store.unmount_image(image, false) {
                Ok(_) | Err(StevedoreError::ImageUnknown(_)) => {}
                Err(e) => record("unmount image", Err(e)),
            }
        }
        for target in self.created_targets.iter().rev() {
            record(
                "remove mount target",
                remove_if_exists(target)
                    .map_err(|e| StevedoreError::io(format!("Failed to remove {}", target.display()), e)),
            );
        }
        for file in &self.secret_files {
            record(
                "remove secret",
                remove_if_exists(file)
                    .map_err(|e| StevedoreError::io(format!("Failed to remove {}", file.display()), e)),
            );
        }
        for dir in &self.scratch_dirs {
            let result = match std::fs::remove_dir_all(dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    Err(StevedoreError::io(format!("Failed to remove {}", dir.display()), e))
                }
                _ => Ok(()),
            };
            record("remove cache copy", result);
        }
        drop(self.locks);
        errors
    }
}

/// Where `--mount` directives find their inputs.
#[derive(Debug)]
pub struct RunMountContext<'a> {
    pub rootfs: &'a Path,
    /// Per-run scratch directory on the host.
    pub run_dir: &'a Path,
    /// Base for relative bind sources.
    pub context_dir: Option<&'a Path>,
    pub store: &'a dyn Store,
    pub mappings: &'a IdMappings,
    pub mount_label: &'a str,
    pub secrets: &'a BTreeMap<String, SecretSource>,
    pub ssh_sources: &'a BTreeMap<String, Vec<PathBuf>>,
    pub ssh_agent: &'a str,
    pub ssh_add: &'a str,
}

/// Create the mount point for `target` inside the rootfs, recording every
/// path component that did not exist before.
fn ensure_target(
    rootfs: &Path,
    target: &Path,
    is_dir: bool,
    artifacts: &mut RunMountArtifacts,
) -> StevedoreResult<()> {
    let host = secure_join(rootfs, target)?;
    let relative = host.strip_prefix(rootfs).map_err(|_| {
        StevedoreError::InvalidMountSpec(format!("target {} escapes the rootfs", target.display()))
    })?;
    let keep = KEEP_PREFIXES
        .iter()
        .any(|p| Path::new("/").join(relative).starts_with(p));

    let count = relative.components().count();
    let mut current = rootfs.to_path_buf();
    for (i, comp) in relative.components().enumerate() {
        current.push(comp);
        if current.symlink_metadata().is_ok() {
            continue;
        }
        let last = i + 1 == count;
        let created = if last && !is_dir {
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&current)
                .map(|_| ())
        } else {
            std::fs::create_dir(&current)
        };
        created.map_err(|e| StevedoreError::io(format!("Failed to create mount point {}", current.display()), e))?;
        if !keep {
            artifacts.created_targets.push(current.clone());
        }
    }
    Ok(())
}

const SECRET_OPTIONS: &[&str] = &["rbind", "ro", "nosuid", "nodev", "noexec"];

fn secret_mount(
    ctx: &RunMountContext<'_>,
    m: &SecretMount,
    artifacts: &mut RunMountArtifacts,
) -> StevedoreResult<Option<Mount>> {
    let Some(file) = secrets::materialize(m, ctx.secrets, &ctx.run_dir.join("secrets"), ctx.mappings)? else {
        return Ok(None);
    };
    artifacts.secret_files.push(file.clone());
    ensure_target(ctx.rootfs, &m.target, false, artifacts)?;
    mount(&m.target.to_string_lossy(), "bind", &file.to_string_lossy(), SECRET_OPTIONS).map(Some)
}

fn ssh_mount(
    ctx: &RunMountContext<'_>,
    m: &SshMount,
    target: &Path,
    index: usize,
    artifacts: &mut RunMountArtifacts,
) -> StevedoreResult<Option<Mount>> {
    let dir = ctx.run_dir.join(format!("ssh-{}", index));
    let Some(agent) = ssh::open_agent(&m.id, ctx.ssh_sources, ctx.ssh_agent, ctx.ssh_add, &dir)? else {
        if m.required {
            return Err(StevedoreError::NotFound(format!("ssh source {:?}", m.id)));
        }
        tracing::debug!(id = %m.id, "Skipping optional ssh mount with no source");
        return Ok(None);
    };
    let socket = agent.path().to_path_buf();
    artifacts.agents.push(agent);

    if let Some(AgentSocket::Spawned(_)) = artifacts.agents.last() {
        std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(m.mode))
            .map_err(|e| StevedoreError::io(format!("Failed to chmod {}", socket.display()), e))?;
        let (uid, gid) = ctx.mappings.to_host(m.uid, m.gid)?;
        if let Err(e) = std::os::unix::fs::chown(&socket, Some(uid), Some(gid)) {
            tracing::warn!(socket = %socket.display(), uid, gid, error = %e, "Failed to chown agent socket");
        }
    }
    ensure_target(ctx.rootfs, target, false, artifacts)?;
    if artifacts.ssh_auth_sock.is_none() {
        artifacts.ssh_auth_sock = Some(target.to_path_buf());
    }
    mount(
        &target.to_string_lossy(),
        "bind",
        &socket.to_string_lossy(),
        &["rbind", "nosuid", "nodev", "noexec"],
    )
    .map(Some)
}

fn bind_source(ctx: &RunMountContext<'_>, m: &BindMount, artifacts: &mut RunMountArtifacts) -> StevedoreResult<PathBuf> {
    if let Some(from) = &m.from {
        let image = find_local_image(ctx.store, from)?;
        let root = ctx.store.mount_image(&image.id)?;
        artifacts.mounted_images.push(image.id);
        return secure_join(&root, &m.source);
    }
    if m.source.is_absolute() {
        return Ok(m.source.clone());
    }
    match ctx.context_dir {
        Some(dir) => secure_join(dir, &m.source),
        None => Err(StevedoreError::InvalidMountSpec(format!(
            "relative bind source {} needs a build context",
            m.source.display()
        ))),
    }
}

fn bind_mount(ctx: &RunMountContext<'_>, m: &BindMount, artifacts: &mut RunMountArtifacts) -> StevedoreResult<Mount> {
    let source = bind_source(ctx, m, artifacts)?;
    let meta = std::fs::metadata(&source)
        .map_err(|e| StevedoreError::io(format!("Bind source {}", source.display()), e))?;
    if let Some(relabel) = m.relabel {
        selinux::relabel(&source, ctx.mount_label, relabel == Relabel::Shared)?;
    }
    ensure_target(ctx.rootfs, &m.target, meta.is_dir(), artifacts)?;
    let mut options = vec!["rbind"];
    if !m.rw {
        options.push("ro");
    }
    mount(&m.target.to_string_lossy(), "bind", &source.to_string_lossy(), &options)
}

fn tmpfs_mount(ctx: &RunMountContext<'_>, m: &TmpfsMount, artifacts: &mut RunMountArtifacts) -> StevedoreResult<Mount> {
    ensure_target(ctx.rootfs, &m.target, true, artifacts)?;
    let mut options = vec!["nosuid".to_string(), "nodev".to_string()];
    if let Some(size) = &m.size {
        options.push(format!("size={}", size));
    }
    if let Some(mode) = m.mode {
        options.push(format!("mode={:o}", mode));
    }
    let options: Vec<&str> = options.iter().map(String::as_str).collect();
    mount(&m.target.to_string_lossy(), "tmpfs", "tmpfs", &options)
}

fn cache_mount(ctx: &RunMountContext<'_>, m: &CacheMount, artifacts: &mut RunMountArtifacts) -> StevedoreResult<Mount> {
    let prepared = cache::prepare(
        m,
        &ctx.store.cache_dir(),
        &ctx.store.locks_dir(),
        ctx.run_dir,
        ctx.mappings,
    )?;
    artifacts.locks.extend(prepared.lock);
    artifacts.scratch_dirs.extend(prepared.scratch);
    ensure_target(ctx.rootfs, &m.target, true, artifacts)?;
    let mut options = vec!["rbind"];
    if !m.rw {
        options.push("ro");
    }
    mount(&m.target.to_string_lossy(), "bind", &prepared.source.to_string_lossy(), &options)
}

/// Set up every `--mount` directive whose target is still free.
///
/// On error, whatever was acquired so far is already in `artifacts`.
pub fn add_run_mounts(
    ctx: &RunMountContext<'_>,
    run_mounts: &[RunMount],
    set: &mut MountSet,
    artifacts: &mut RunMountArtifacts,
) -> StevedoreResult<()> {
    let mut ssh_index = 0;
    for run_mount in run_mounts {
        let target = match run_mount {
            RunMount::Ssh(m) => {
                let t = m.target.clone().unwrap_or_else(|| default_ssh_target(ssh_index));
                ssh_index += 1;
                t
            }
            other => other.target().map(Path::to_path_buf).unwrap_or_default(),
        };
        if set.is_taken(&target) {
            tracing::debug!(target = %target.display(), "Mount target already taken");
            continue;
        }
        let mounted = match run_mount {
            RunMount::Secret(m) => secret_mount(ctx, m, artifacts)?,
            RunMount::Ssh(m) => ssh_mount(ctx, m, &target, ssh_index - 1, artifacts)?,
            RunMount::Bind(m) => Some(bind_mount(ctx, m, artifacts)?),
            RunMount::Tmpfs(m) => Some(tmpfs_mount(ctx, m, artifacts)?),
            RunMount::Cache(m) => Some(cache_mount(ctx, m, artifacts)?),
        };
        if let Some(m) = mounted {
            set.offer(m);
        }
    }
    Ok(())
}

/// Offer caller-supplied mounts, then `-v` volumes.
pub fn add_explicit_mounts(
    explicit: &[Mount],
    volumes: &[String],
    mount_label: &str,
    set: &mut MountSet,
) -> StevedoreResult<()> {
    set.extend(explicit.iter().cloned());
    for spec in volumes {
        let volume = parse_volume_spec(spec)?;
        if set.is_taken(&volume.destination) {
            continue;
        }
        if let Some(relabel) = volume.relabel {
            selinux::relabel(&volume.source, mount_label, relabel == Relabel::Shared)?;
        }
        set.offer(volume.to_mount()?);
    }
    Ok(())
}

/// Bind a persistent directory over each image volume nobody mounted.
pub fn add_image_volumes<'p>(
    rootfs: &Path,
    volumes_dir: &Path,
    paths: impl IntoIterator<Item = &'p String>,
    set: &mut MountSet,
) -> StevedoreResult<()> {
    for path in paths {
        if set.is_taken(Path::new(path)) {
            continue;
        }
        set.offer(builtin_volume(rootfs, volumes_dir, path)?);
    }
    Ok(())
}
