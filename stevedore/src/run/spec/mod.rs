//! OCI runtime spec generation for run commands.
//!
//! Produces the process, root, namespace, capability, rlimit, seccomp and
//! resource parts of the spec. Mounts are assembled separately by the mount
//! plumbing; [`default_mounts`] supplies the lowest-precedence set.

pub mod capabilities;
pub mod namespaces;
pub mod rlimits;
pub mod seccomp;

use std::path::Path;

use oci_spec::runtime::{
    Hooks, LinuxBuilder, LinuxCpuBuilder, LinuxMemoryBuilder, LinuxResources,
    LinuxResourcesBuilder, LinuxSeccomp, Mount, MountBuilder, ProcessBuilder, RootBuilder, Spec,
    SpecBuilder, UserBuilder,
};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::builder::CommonBuildOptions;
use crate::run::user::ExecUser;
use namespaces::NamespacePlan;
use rlimits::Ulimit;

pub use namespaces::{NetworkAttachment, NetworkPolicy};

/// OCI runtime-spec version we emit.
pub const OCI_VERSION: &str = "1.0.2";

pub const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
    "/sys/fs/selinux",
    "/sys/dev",
];

pub const READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Everything the spec is built from.
#[derive(Debug)]
pub struct SpecInputs<'a> {
    pub rootfs: &'a Path,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub terminal: bool,
    pub user: &'a ExecUser,
    pub hostname: String,
    pub namespaces: &'a NamespacePlan,
    pub capabilities: Vec<String>,
    pub ulimits: Vec<Ulimit>,
    pub seccomp: Option<LinuxSeccomp>,
    pub common: &'a CommonBuildOptions,
    pub process_label: &'a str,
    pub mount_label: &'a str,
    pub hooks: Option<Hooks>,
    pub rootless: bool,
}

pub(crate) fn mount(destination: &str, typ: &str, source: &str, options: &[&str]) -> StevedoreResult<Mount> {
    MountBuilder::default()
        .destination(destination)
        .typ(typ)
        .source(source)
        .options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build {} mount: {}", destination, e)))
}

/// Check a `--shm-size` value: digits with an optional b/k/m/g suffix.
pub fn validate_size(size: &str) -> StevedoreResult<()> {
    let digits = size.trim_end_matches(|c: char| "bBkKmMgG".contains(c));
    let suffix_len = size.len() - digits.len();
    if digits.is_empty() || suffix_len > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(StevedoreError::InvalidArgument(format!("invalid size {:?}", size)));
    }
    Ok(())
}

/// proc, dev, devpts, shm, mqueue, sysfs and cgroup. Without a private
/// network and user namespace sysfs cannot be mounted fresh, so the host's
/// is bound read-only instead.
pub fn default_mounts(plan: &NamespacePlan, shm_size: Option<&str>) -> StevedoreResult<Vec<Mount>> {
    let shm_size = format!("size={}", shm_size.unwrap_or("64m"));
    let mut mounts = vec![
        mount("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"])?,
        mount("/dev", "tmpfs", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"])?,
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        )?,
        mount("/dev/shm", "tmpfs", "shm", &["nosuid", "noexec", "nodev", "mode=1777", &shm_size])?,
        mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?,
    ];
    if plan.new_net && !plan.new_user {
        mounts.push(mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"])?);
    } else {
        mounts.push(mount("/sys", "bind", "/sys", &["rbind", "nosuid", "noexec", "nodev", "ro"])?);
    }
    mounts.push(mount(
        "/sys/fs/cgroup",
        "cgroup",
        "cgroup",
        &["nosuid", "noexec", "nodev", "relatime", "ro"],
    )?);
    Ok(mounts)
}

fn resources(common: &CommonBuildOptions) -> StevedoreResult<Option<LinuxResources>> {
    let wants_cpu = common.cpu_period.is_some()
        || common.cpu_quota.is_some()
        || common.cpu_shares.is_some()
        || common.cpuset_cpus.is_some()
        || common.cpuset_mems.is_some();
    let wants_memory = common.memory.is_some() || common.memory_swap.is_some();
    if !wants_cpu && !wants_memory {
        return Ok(None);
    }

    let mut builder = LinuxResourcesBuilder::default();
    if wants_memory {
        let mut memory = LinuxMemoryBuilder::default();
        if let Some(limit) = common.memory {
            memory = memory.limit(limit);
        }
        if let Some(swap) = common.memory_swap {
            memory = memory.swap(swap);
        }
        builder = builder.memory(
            memory
                .build()
                .map_err(|e| StevedoreError::Internal(format!("Failed to build memory limits: {}", e)))?,
        );
    }
    if wants_cpu {
        let mut cpu = LinuxCpuBuilder::default();
        if let Some(shares) = common.cpu_shares {
            cpu = cpu.shares(shares);
        }
        if let Some(quota) = common.cpu_quota {
            cpu = cpu.quota(quota);
        }
        if let Some(period) = common.cpu_period {
            cpu = cpu.period(period);
        }
        if let Some(cpus) = &common.cpuset_cpus {
            cpu = cpu.cpus(cpus.clone());
        }
        if let Some(mems) = &common.cpuset_mems {
            cpu = cpu.mems(mems.clone());
        }
        builder = builder.cpu(
            cpu.build()
                .map_err(|e| StevedoreError::Internal(format!("Failed to build cpu limits: {}", e)))?,
        );
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| StevedoreError::Internal(format!("Failed to build resources: {}", e)))
}

/// Build the spec. `mounts` is left empty for the caller to fill.
pub fn generate(inputs: SpecInputs<'_>) -> StevedoreResult<Spec> {
    let user = UserBuilder::default()
        .uid(inputs.user.uid)
        .gid(inputs.user.gid)
        .additional_gids(inputs.user.additional_gids.clone())
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build user spec: {}", e)))?;

    let mut process = ProcessBuilder::default()
        .terminal(inputs.terminal)
        .user(user)
        .args(inputs.args)
        .env(inputs.env)
        .cwd(inputs.cwd)
        .capabilities(capabilities::to_oci(&inputs.capabilities, inputs.user.uid)?)
        .rlimits(rlimits::to_oci(&inputs.ulimits)?)
        .no_new_privileges(false);
    if !inputs.process_label.is_empty() {
        process = process.selinux_label(inputs.process_label.to_string());
    }
    if let Some(profile) = &inputs.common.apparmor_profile {
        process = process.apparmor_profile(profile.clone());
    }
    let process = process
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build process spec: {}", e)))?;

    let root = RootBuilder::default()
        .path(inputs.rootfs)
        .readonly(false)
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build root spec: {}", e)))?;

    let mut linux = LinuxBuilder::default()
        .namespaces(inputs.namespaces.namespaces.clone())
        .masked_paths(MASKED_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
        .readonly_paths(READONLY_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>());
    if inputs.namespaces.new_user {
        linux = linux
            .uid_mappings(inputs.namespaces.uid_mappings()?)
            .gid_mappings(inputs.namespaces.gid_mappings()?);
    }
    let mut limited = false;
    match resources(inputs.common)? {
        Some(_) if inputs.rootless => {
            tracing::warn!("Ignoring cpu and memory limits for a rootless run");
        }
        Some(resources) => {
            linux = linux.resources(resources);
            limited = true;
        }
        None => {}
    }
    if let Some(seccomp) = inputs.seccomp {
        linux = linux.seccomp(seccomp);
    }
    if !inputs.mount_label.is_empty() {
        linux = linux.mount_label(inputs.mount_label.to_string());
    }
    // The builders fill unset fields from oci-spec's own defaults.
    let mut linux = linux
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build linux spec: {}", e)))?;
    if !limited {
        linux.set_resources(None);
    }

    let hostname = Some(inputs.hostname).filter(|h| inputs.namespaces.new_uts && !h.is_empty());
    let mut spec = SpecBuilder::default()
        .version(OCI_VERSION)
        .root(root)
        .mounts(Vec::<Mount>::new())
        .process(process)
        .linux(linux);
    if let Some(hooks) = inputs.hooks {
        spec = spec.hooks(hooks);
    }
    let mut spec = spec
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build OCI spec: {}", e)))?;
    spec.set_hostname(hostname);
    spec.set_annotations(None);
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{IdMappingOptions, NamespaceKind, NamespaceMode, NamespaceOptions};
    use oci_spec::runtime::PosixRlimitType;

    fn root_user() -> ExecUser {
        ExecUser {
            uid: 0,
            gid: 0,
            additional_gids: vec![10],
            home: "/root".into(),
        }
    }

    fn inputs<'a>(
        rootfs: &'a Path,
        user: &'a ExecUser,
        plan: &'a NamespacePlan,
        common: &'a CommonBuildOptions,
    ) -> SpecInputs<'a> {
        SpecInputs {
            rootfs,
            args: vec!["/bin/true".into()],
            env: vec!["PATH=/bin".into()],
            cwd: "/".into(),
            terminal: false,
            user,
            hostname: "myhost".into(),
            namespaces: plan,
            capabilities: vec!["CAP_CHOWN".into()],
            ulimits: rlimits::parse_ulimits(&["nofile=128:256"]).unwrap(),
            seccomp: None,
            common,
            process_label: "",
            mount_label: "",
            hooks: None,
            rootless: false,
        }
    }

    #[test]
    fn test_generate_basic_spec() {
        let plan = namespaces::plan(
            &NamespaceOptions::default(),
            &IdMappingOptions::default(),
            &[],
            NetworkPolicy::Default,
        )
        .unwrap();
        let user = root_user();
        let common = CommonBuildOptions::default();
        let spec = generate(inputs(Path::new("/rootfs"), &user, &plan, &common)).unwrap();

        assert_eq!(spec.hostname().as_deref(), Some("myhost"));
        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.user().additional_gids().as_deref(), Some(&[10u32][..]));
        let limits = process.rlimits().as_ref().unwrap();
        assert_eq!(limits[0].typ(), PosixRlimitType::RlimitNofile);
        assert_eq!(limits[0].soft(), 128);

        let linux = spec.linux().as_ref().unwrap();
        assert!(linux.masked_paths().as_ref().unwrap().contains(&"/proc/kcore".to_string()));
        assert!(linux.uid_mappings().is_none());
        assert!(linux.resources().is_none());
    }

    #[test]
    fn test_host_uts_keeps_hostname_unset() {
        let mut opts = NamespaceOptions::default();
        opts.set(NamespaceKind::Uts, NamespaceMode::Host);
        let plan = namespaces::plan(&opts, &IdMappingOptions::default(), &[], NetworkPolicy::Default).unwrap();
        let user = root_user();
        let common = CommonBuildOptions::default();
        let spec = generate(inputs(Path::new("/rootfs"), &user, &plan, &common)).unwrap();
        assert!(spec.hostname().is_none());
    }

    #[test]
    fn test_rootless_limits_and_empty_hostname_leave_fields_unset() {
        let plan = NamespacePlan {
            new_uts: true,
            ..NamespacePlan::default()
        };
        let user = root_user();
        let common = CommonBuildOptions {
            memory: Some(64 << 20),
            ..CommonBuildOptions::default()
        };
        let mut inputs = inputs(Path::new("/rootfs"), &user, &plan, &common);
        inputs.hostname = String::new();
        inputs.rootless = true;
        let spec = generate(inputs).unwrap();

        assert!(spec.hostname().is_none());
        assert!(spec.annotations().is_none());
        assert!(spec.linux().as_ref().unwrap().resources().is_none());
        let json = serde_json::to_string(&spec).unwrap();
        assert!(!json.contains("youki"), "{json}");
    }

    #[test]
    fn test_resources_from_common_options() {
        let plan = NamespacePlan::default();
        let user = root_user();
        let common = CommonBuildOptions {
            memory: Some(64 << 20),
            cpu_shares: Some(512),
            ..CommonBuildOptions::default()
        };
        let spec = generate(inputs(Path::new("/rootfs"), &user, &plan, &common)).unwrap();
        let resources = spec.linux().as_ref().unwrap().resources().as_ref().unwrap();
        assert_eq!(resources.memory().as_ref().unwrap().limit(), Some(64 << 20));
        assert_eq!(resources.cpu().as_ref().unwrap().shares(), Some(512));
    }

    #[test]
    fn test_default_mounts() {
        let plan = namespaces::plan(
            &NamespaceOptions::default(),
            &IdMappingOptions::default(),
            &[],
            NetworkPolicy::Default,
        )
        .unwrap();
        let mounts = default_mounts(&plan, Some("128m")).unwrap();
        let dests: Vec<_> = mounts.iter().map(|m| m.destination().to_string_lossy().into_owned()).collect();
        assert_eq!(
            dests,
            vec!["/proc", "/dev", "/dev/pts", "/dev/shm", "/dev/mqueue", "/sys", "/sys/fs/cgroup"]
        );
        let shm = &mounts[3];
        assert!(shm.options().as_ref().unwrap().contains(&"size=128m".to_string()));
    }

    #[test]
    fn test_validate_size() {
        assert!(validate_size("64m").is_ok());
        assert!(validate_size("1024").is_ok());
        assert!(validate_size("m").is_err());
        assert!(validate_size("12mb").is_err());
        assert!(validate_size("1x").is_err());
    }
}
