//! Running commands inside a working container.
//!
//! [`Builder::run`] turns the builder's state and a [`RunOptions`] into an
//! OCI runtime spec plus its mount list, then hands both to either an
//! external OCI runtime ([`oci`]) or the built-in chroot pipeline
//! ([`chroot`]). Everything acquired on the way is released through a
//! [`crate::cleanup::CleanupStack`] whether the command succeeds or not.

pub mod cache;
pub mod files;
pub mod mount_spec;
pub mod mounts;
pub mod network;
pub mod secrets;
pub mod selinux;
pub mod spec;
pub mod ssh;
pub mod user;
pub mod volumes;

#[cfg(target_os = "linux")]
pub mod chroot;
#[cfg(target_os = "linux")]
pub mod oci;
#[cfg(target_os = "linux")]
pub mod slirp;

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use oci_spec::runtime::{Hooks, Mount};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::builder::{Builder, NamespaceOptions};
use crate::system::Isolation;
use network::NetworkHook;
use secrets::SecretSource;
use spec::NetworkPolicy;
use spec::rlimits::{self, Ulimit};

/// Whether the command gets a terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TerminalPolicy {
    /// A terminal when stdin and stdout are both terminals and no stdio
    /// was redirected.
    #[default]
    Default,
    Enabled,
    Disabled,
}

/// Descriptors for the command's stdio. `None` inherits ours.
#[derive(Debug, Default)]
pub struct RunStdio {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl RunStdio {
    pub fn is_inherited(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }

    pub(crate) fn into_stdio(self) -> (Stdio, Stdio, Stdio) {
        let convert = |fd: Option<OwnedFd>| fd.map(Stdio::from).unwrap_or_else(Stdio::inherit);
        (convert(self.stdin), convert(self.stdout), convert(self.stderr))
    }
}

/// Per-run settings. Unset fields fall back to the builder's state and
/// then to the system context.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub terminal: TerminalPolicy,
    pub hostname: Option<String>,
    /// `user[:group]`; the image's configured user when unset.
    pub user: Option<String>,
    pub workdir: Option<String>,
    /// `KEY=VALUE` entries layered over the image's environment.
    pub env: Vec<String>,
    pub no_hosts: bool,
    pub add_host: Vec<String>,
    pub dns_servers: Vec<String>,
    pub dns_search: Vec<String>,
    pub dns_options: Vec<String>,
    pub no_pivot: bool,
    pub no_new_keyring: bool,
    /// OCI runtime binary; the system default when unset.
    pub runtime: Option<String>,
    pub runtime_args: Vec<String>,
    pub isolation: Option<Isolation>,
    pub mounts: Vec<Mount>,
    /// `-v host:container[:options]` volumes.
    pub volumes: Vec<String>,
    /// Unparsed `--mount` directives.
    pub run_mounts: Vec<String>,
    /// Base directory for relative bind sources.
    pub context_dir: Option<PathBuf>,
    pub secrets: BTreeMap<String, SecretSource>,
    pub ssh_sources: BTreeMap<String, Vec<PathBuf>>,
    /// Network names; the builder's configured list when empty.
    pub networks: Vec<String>,
    pub network_policy: NetworkPolicy,
    pub namespace_options: NamespaceOptions,
    pub add_capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
    pub ulimits: Vec<String>,
    /// Seccomp profile path or `unconfined`.
    pub seccomp_profile: Option<String>,
    pub hooks: Option<Hooks>,
    /// Replaces the CNI hook for privileged OCI runs.
    pub network_hook: Option<Arc<dyn NetworkHook>>,
    pub stdio: RunStdio,
}

fn is_terminal(fd: impl std::os::fd::AsFd) -> bool {
    nix::unistd::isatty(fd).unwrap_or(false)
}

pub(crate) fn wants_terminal(policy: TerminalPolicy, stdio: &RunStdio) -> bool {
    match policy {
        TerminalPolicy::Enabled => true,
        TerminalPolicy::Disabled => false,
        TerminalPolicy::Default => {
            stdio.is_inherited() && is_terminal(std::io::stdin()) && is_terminal(std::io::stdout())
        }
    }
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

/// Layer `overrides` over `base` by key, then add `defaults` for keys
/// neither defines.
pub(crate) fn merge_env(base: &[String], overrides: &[String], defaults: &[(&str, String)]) -> Vec<String> {
    let mut env: Vec<String> = base.to_vec();
    for entry in overrides {
        let key = env_key(entry);
        match env.iter_mut().find(|e| env_key(e) == key) {
            Some(existing) => *existing = entry.clone(),
            None => env.push(entry.clone()),
        }
    }
    for (key, value) in defaults {
        if !env.iter().any(|e| env_key(e) == *key) {
            env.push(format!("{}={}", key, value));
        }
    }
    env
}

/// Parse each layer of ulimits; a later layer replaces an earlier entry
/// for the same resource.
pub(crate) fn merge_ulimits(layers: &[&[String]]) -> StevedoreResult<Vec<Ulimit>> {
    let mut merged: Vec<Ulimit> = Vec::new();
    for layer in layers.iter().copied() {
        for limit in rlimits::parse_ulimits(layer)? {
            match merged.iter_mut().find(|u| u.typ == limit.typ) {
                Some(existing) => *existing = limit,
                None => merged.push(limit),
            }
        }
    }
    Ok(merged)
}

/// First non-empty list wins.
fn first_nonempty<'a>(lists: &[&'a [String]]) -> &'a [String] {
    lists.iter().copied().find(|l| !l.is_empty()).unwrap_or(&[])
}

fn cleanup_result(mut errors: Vec<StevedoreError>) -> StevedoreResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(StevedoreError::Multiple(errors)),
    }
}

#[cfg(not(target_os = "linux"))]
impl Builder {
    pub fn run(&mut self, _command: &[String], options: RunOptions) -> StevedoreResult<()> {
        let isolation = options.isolation.unwrap_or(self.state().isolation);
        Err(StevedoreError::Unsupported(format!(
            "{} isolation is only available on Linux",
            isolation
        )))
    }
}

#[cfg(target_os = "linux")]
impl Builder {
    /// Run `command` in the working container and wait for it.
    ///
    /// Returns `Ok(())` when it exits with status 0 and
    /// [`StevedoreError::RunFailed`] otherwise.
    pub fn run(&mut self, command: &[String], options: RunOptions) -> StevedoreResult<()> {
        use crate::cleanup::CleanupStack;
        use crate::util::fs::secure_join;
        use files::{FileInputs, NetworkMode};
        use mounts::{MountSet, RunMountArtifacts, RunMountContext};
        use stevedore_shared::constants::run::{DEFAULT_PATH, HOSTNAME_ID_LEN};

        if command.is_empty() {
            return Err(StevedoreError::InvalidArgument("no command given".into()));
        }
        let rootfs = self.ensure_mounted()?;
        let container_id = self.require_container()?.to_string();
        let state = self.state();
        let context = self.context();
        let store = Arc::clone(self.store());
        let isolation = options.isolation.unwrap_or(state.isolation);
        let rootless = crate::util::is_rootless();

        let networks = if options.networks.is_empty() {
            state.networks.as_slice()
        } else {
            options.networks.as_slice()
        };
        let namespaces = state.namespace_options.merged(&options.namespace_options);
        let plan = spec::namespaces::plan(
            &namespaces,
            &state.id_mapping_options,
            networks,
            options.network_policy,
        )?;

        let user_spec = options.user.as_deref().unwrap_or(self.user());
        let exec_user = user::lookup_user(&rootfs, user_spec)?;
        let workdir = options
            .workdir
            .clone()
            .filter(|w| !w.is_empty())
            .or_else(|| Some(self.workdir().to_string()).filter(|w| !w.is_empty()))
            .unwrap_or_else(|| "/".to_string());
        let host_workdir = secure_join(&rootfs, std::path::Path::new(&workdir))?;
        std::fs::create_dir_all(&host_workdir).map_err(|e| {
            StevedoreError::io(format!("Failed to create working directory {}", workdir), e)
        })?;

        let hostname = options
            .hostname
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| Some(self.hostname().to_string()).filter(|h| !h.is_empty()))
            .unwrap_or_else(|| container_id.chars().take(HOSTNAME_ID_LEN).collect());

        let capabilities = spec::capabilities::compute(
            if state.capabilities.is_empty() {
                &context.default_capabilities
            } else {
                &state.capabilities
            },
            &options.add_capabilities,
            &options.drop_capabilities,
        )?;
        let ulimits = merge_ulimits(&[
            &context.default_ulimits,
            &state.common_build_opts.ulimit,
            &options.ulimits,
        ])?;
        let seccomp_setting = options
            .seccomp_profile
            .clone()
            .or_else(|| state.common_build_opts.seccomp_profile_path.clone())
            .or_else(|| {
                context
                    .seccomp_profile
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
            });
        let seccomp = spec::seccomp::resolve(seccomp_setting.as_deref(), &capabilities)?;
        let shm_size = state.common_build_opts.shm_size.as_deref();
        if let Some(size) = shm_size {
            spec::validate_size(size)?;
        }

        let mut cleanup = CleanupStack::new();
        let run_id = crate::util::random_id();
        let run_dir = store
            .container_run_directory(&container_id)?
            .join(format!("run-{}", &run_id[..HOSTNAME_ID_LEN]));
        std::fs::create_dir_all(&run_dir)
            .map_err(|e| StevedoreError::io(format!("Failed to create {}", run_dir.display()), e))?;
        {
            let run_dir = run_dir.clone();
            cleanup.push("remove run directory", move || match std::fs::remove_dir_all(&run_dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StevedoreError::io(
                    format!("Failed to remove {}", run_dir.display()),
                    e,
                )),
                _ => Ok(()),
            });
        }

        // Mounts, highest precedence first; the first claim on a
        // destination wins.
        let common = &state.common_build_opts;
        let mut set = MountSet::new();
        let volumes: Vec<String> = common.volumes.iter().chain(&options.volumes).cloned().collect();
        mounts::add_explicit_mounts(&options.mounts, &volumes, &state.mount_label, &mut set)?;

        let run_mounts = options
            .run_mounts
            .iter()
            .map(|m| mount_spec::parse_run_mount(m))
            .collect::<StevedoreResult<Vec<_>>>()?;
        let mut artifacts = RunMountArtifacts::default();
        let ctx = RunMountContext {
            rootfs: &rootfs,
            run_dir: &run_dir,
            context_dir: options.context_dir.as_deref(),
            store: store.as_ref(),
            mappings: &plan.mappings,
            mount_label: &state.mount_label,
            secrets: &options.secrets,
            ssh_sources: &options.ssh_sources,
            ssh_agent: &context.ssh_agent,
            ssh_add: &context.ssh_add,
        };
        let added = mounts::add_run_mounts(&ctx, &run_mounts, &mut set, &mut artifacts);
        let ssh_auth_sock = artifacts.ssh_auth_sock.clone();
        {
            let store = Arc::clone(&store);
            cleanup.push("release run mounts", move || cleanup_result(artifacts.cleanup(store.as_ref())));
        }
        added?;

        set.extend(spec::default_mounts(&plan, shm_size)?);

        let network_mode = if !plan.new_net {
            NetworkMode::Host
        } else if rootless && plan.configure_network() && isolation == Isolation::Oci {
            NetworkMode::Slirp
        } else {
            NetworkMode::Private
        };
        let add_host: Vec<String> = common.add_host.iter().chain(&options.add_host).cloned().collect();
        let file_inputs = FileInputs {
            hosts_base: &context.hosts_file,
            resolv_base: &context.resolv_file,
            add_host: &add_host,
            hostname: &hostname,
            network: network_mode,
            dns_servers: first_nonempty(&[&options.dns_servers, &common.dns_servers, &context.dns_servers]),
            dns_search: first_nonempty(&[&options.dns_search, &common.dns_search, &context.dns_search]),
            dns_options: first_nonempty(&[&options.dns_options, &common.dns_options, &context.dns_options]),
            container_name: self.container_name(),
            container_id: &container_id,
            image: &state.from_image,
            image_id: &state.from_image_id,
            rootless,
        };
        let generated = files::generate(
            &run_dir,
            &file_inputs,
            options.no_hosts || common.no_hosts,
            |dest| set.is_taken(dest),
        )?;
        set.extend(generated);

        let volumes_dir = store.container_directory(&container_id)?.join("volumes");
        let image_volumes = self.volumes();
        mounts::add_image_volumes(&rootfs, &volumes_dir, &image_volumes, &mut set)?;

        let mut overrides = options.env.clone();
        if let Some(sock) = &ssh_auth_sock {
            overrides.push(format!("SSH_AUTH_SOCK={}", sock.display()));
        }
        let env = merge_env(
            self.env(),
            &overrides,
            &[
                ("PATH", DEFAULT_PATH.to_string()),
                ("HOME", exec_user.home.clone()),
                ("HOSTNAME", hostname.clone()),
            ],
        );

        let mut terminal = wants_terminal(options.terminal, &options.stdio);
        if terminal && isolation == Isolation::Oci {
            tracing::warn!("Terminal requests are not supported with oci isolation; using pipes");
            terminal = false;
        }

        let mut runtime_spec = spec::generate(spec::SpecInputs {
            rootfs: &rootfs,
            args: command.to_vec(),
            env,
            cwd: workdir,
            terminal,
            user: &exec_user,
            hostname,
            namespaces: &plan,
            capabilities,
            ulimits,
            seccomp,
            common,
            process_label: &state.process_label,
            mount_label: &state.mount_label,
            hooks: options.hooks.clone(),
            rootless,
        })?;
        runtime_spec.set_mounts(Some(set.into_mounts()));

        tracing::info!(
            container = %container_id,
            isolation = %isolation,
            command = ?command,
            "Running command"
        );
        let runtime = options.runtime.clone().unwrap_or_else(|| context.runtime.clone());
        let outcome = match isolation {
            Isolation::Oci => {
                let slirp_hook;
                let cni_hook;
                let hook: &dyn NetworkHook = if rootless {
                    slirp_hook = slirp::SlirpNetwork::new(context.slirp4netns.clone());
                    &slirp_hook
                } else if let Some(hook) = &options.network_hook {
                    hook.as_ref()
                } else {
                    cni_hook = network::CniNetwork::new(
                        context.cni_config_dir.clone(),
                        context.cni_plugin_dirs.clone(),
                    );
                    &cni_hook
                };
                let run = oci::OciRun {
                    runtime: &runtime,
                    runtime_args: &options.runtime_args,
                    bundle: &run_dir,
                    container_id: &run_id,
                    no_pivot: options.no_pivot,
                    no_new_keyring: options.no_new_keyring,
                    network: plan
                        .configure_network()
                        .then_some((hook, plan.attachments.as_slice())),
                };
                run.run(&runtime_spec, options.stdio)
            }
            Isolation::Chroot => {
                if plan.configure_network() {
                    tracing::warn!("Networks are not configured with chroot isolation; loopback only");
                }
                let payload = chroot::StagePayload {
                    spec: runtime_spec,
                    bundle: run_dir.clone(),
                    container_id: run_id.clone(),
                    newuidmap: context.newuidmap.clone(),
                    newgidmap: context.newgidmap.clone(),
                };
                chroot::run(&payload, options.stdio)
            }
        };

        let errors = cleanup.run();
        if !errors.is_empty() {
            tracing::warn!(count = errors.len(), "Run cleanup reported errors");
        }

        let status = outcome?;
        tracing::debug!(container = %container_id, %status, "Command finished");
        match status {
            stevedore_shared::errors::ChildStatus::Exited(0) => Ok(()),
            status => Err(StevedoreError::RunFailed {
                isolation: isolation.as_str().to_string(),
                runtime: (isolation == Isolation::Oci).then_some(runtime),
                status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::PosixRlimitType;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_env_overrides_and_defaults() {
        let base = strings(&["PATH=/bin", "LANG=C"]);
        let overrides = strings(&["LANG=en_US.UTF-8", "FOO=bar"]);
        let env = merge_env(
            &base,
            &overrides,
            &[("PATH", "/usr/bin".into()), ("HOME", "/root".into())],
        );
        assert_eq!(env, strings(&["PATH=/bin", "LANG=en_US.UTF-8", "FOO=bar", "HOME=/root"]));
    }

    #[test]
    fn test_merge_env_key_without_value() {
        let env = merge_env(&strings(&["EMPTY"]), &strings(&["EMPTY=now"]), &[]);
        assert_eq!(env, strings(&["EMPTY=now"]));
    }

    #[test]
    fn test_merge_ulimits_last_layer_wins() {
        let defaults = strings(&["nofile=1024:2048", "nproc=100"]);
        let per_run = strings(&["RLIMIT_NOFILE=4096"]);
        let merged = merge_ulimits(&[&defaults, &[], &per_run]).unwrap();
        assert_eq!(merged.len(), 2);
        let nofile = merged.iter().find(|u| u.typ == PosixRlimitType::RlimitNofile).unwrap();
        assert_eq!((nofile.soft, nofile.hard), (4096, 4096));
    }

    #[test]
    fn test_merge_ulimits_rejects_unknown() {
        assert!(merge_ulimits(&[&strings(&["bogus=1"])]).is_err());
    }

    #[test]
    fn test_terminal_policy() {
        assert!(wants_terminal(TerminalPolicy::Enabled, &RunStdio::default()));
        assert!(!wants_terminal(TerminalPolicy::Disabled, &RunStdio::default()));

        let (read, _write) = nix::unistd::pipe().unwrap();
        let redirected = RunStdio {
            stdin: Some(read),
            ..Default::default()
        };
        assert!(!redirected.is_inherited());
        assert!(!wants_terminal(TerminalPolicy::Default, &redirected));
    }

    #[test]
    fn test_first_nonempty() {
        let empty: Vec<String> = Vec::new();
        let dns = strings(&["1.1.1.1"]);
        assert_eq!(first_nonempty(&[&empty, &dns]), dns.as_slice());
        assert!(first_nonempty(&[&empty]).is_empty());
    }
}
