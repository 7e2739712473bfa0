//! Seccomp profiles for run commands.
//!
//! Three sources: `unconfined` (no filter), the built-in deny list, or a
//! Docker/OCI JSON profile whose rules are filtered by the capabilities
//! the command will hold. The result is an OCI [`LinuxSeccomp`]; the OCI
//! runtime consumes it directly, and the chroot isolator compiles it to BPF
//! with `seccompiler`.

use std::collections::BTreeSet;
use std::path::Path;

use oci_spec::runtime::{
    LinuxSeccomp, LinuxSeccompAction, LinuxSeccompArg, LinuxSeccompBuilder, LinuxSyscall,
    LinuxSyscallBuilder,
};
use serde::Deserialize;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

/// Profile name that disables filtering.
pub const UNCONFINED: &str = "unconfined";

/// Syscalls refused with `EPERM` by the built-in profile, each paired with
/// the capability that lifts the restriction. `None` means always refused.
const DEFAULT_DENIED: &[(&str, Option<&str>)] = &[
    ("mount", Some("CAP_SYS_ADMIN")),
    ("umount", Some("CAP_SYS_ADMIN")),
    ("umount2", Some("CAP_SYS_ADMIN")),
    ("pivot_root", Some("CAP_SYS_ADMIN")),
    ("setns", Some("CAP_SYS_ADMIN")),
    ("unshare", Some("CAP_SYS_ADMIN")),
    ("quotactl", Some("CAP_SYS_ADMIN")),
    ("quotactl_fd", Some("CAP_SYS_ADMIN")),
    ("swapon", Some("CAP_SYS_ADMIN")),
    ("swapoff", Some("CAP_SYS_ADMIN")),
    ("bpf", Some("CAP_SYS_ADMIN")),
    ("perf_event_open", Some("CAP_PERFMON")),
    ("chroot", Some("CAP_SYS_CHROOT")),
    ("ptrace", Some("CAP_SYS_PTRACE")),
    ("process_vm_readv", Some("CAP_SYS_PTRACE")),
    ("process_vm_writev", Some("CAP_SYS_PTRACE")),
    ("userfaultfd", Some("CAP_SYS_PTRACE")),
    ("init_module", Some("CAP_SYS_MODULE")),
    ("finit_module", Some("CAP_SYS_MODULE")),
    ("delete_module", Some("CAP_SYS_MODULE")),
    ("reboot", Some("CAP_SYS_BOOT")),
    ("kexec_load", Some("CAP_SYS_BOOT")),
    ("kexec_file_load", Some("CAP_SYS_BOOT")),
    ("acct", Some("CAP_SYS_PACCT")),
    ("keyctl", None),
    ("add_key", None),
    ("request_key", None),
];

#[derive(Debug, Default, Deserialize)]
struct RuleFilter {
    #[serde(default)]
    caps: Vec<String>,
    #[serde(default)]
    arches: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileSyscall {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    name: Option<String>,
    action: LinuxSeccompAction,
    #[serde(default)]
    errno_ret: Option<u32>,
    #[serde(default)]
    args: Option<Vec<LinuxSeccompArg>>,
    #[serde(default)]
    includes: RuleFilter,
    #[serde(default)]
    excludes: RuleFilter,
}

/// The subset of the Docker profile format we understand.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileFile {
    default_action: LinuxSeccompAction,
    #[serde(default)]
    default_errno_ret: Option<u32>,
    #[serde(default)]
    syscalls: Vec<ProfileSyscall>,
}

/// Architecture name as Docker profiles spell it.
fn docker_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

impl ProfileSyscall {
    fn applies(&self, caps: &BTreeSet<String>) -> bool {
        let arch = docker_arch();
        if !self.includes.caps.iter().all(|c| caps.contains(c)) {
            return false;
        }
        if self.excludes.caps.iter().any(|c| caps.contains(c)) {
            return false;
        }
        if !self.includes.arches.is_empty() && !self.includes.arches.iter().any(|a| a == arch) {
            return false;
        }
        !self.excludes.arches.iter().any(|a| a == arch)
    }
}

fn build_syscall(
    names: Vec<String>,
    action: LinuxSeccompAction,
    errno_ret: Option<u32>,
    args: Option<Vec<LinuxSeccompArg>>,
) -> StevedoreResult<LinuxSyscall> {
    let mut builder = LinuxSyscallBuilder::default().names(names).action(action);
    if let Some(errno) = errno_ret {
        builder = builder.errno_ret(errno);
    }
    if let Some(args) = args {
        builder = builder.args(args);
    }
    builder
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build seccomp rule: {}", e)))
}

/// The built-in profile: allow everything except [`DEFAULT_DENIED`]
/// syscalls not covered by `caps`.
pub fn default_profile(caps: &[String]) -> StevedoreResult<LinuxSeccomp> {
    let names: Vec<String> = DEFAULT_DENIED
        .iter()
        .filter(|(_, cap)| cap.is_none_or(|c| !caps.iter().any(|have| have == c)))
        .map(|(name, _)| name.to_string())
        .collect();
    let denied = build_syscall(
        names,
        LinuxSeccompAction::ScmpActErrno,
        Some(libc::EPERM as u32),
        None,
    )?;
    LinuxSeccompBuilder::default()
        .default_action(LinuxSeccompAction::ScmpActAllow)
        .syscalls(vec![denied])
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build seccomp profile: {}", e)))
}

/// Parse a Docker/OCI JSON profile, keeping only rules whose capability
/// and architecture conditions hold.
pub fn parse_profile(data: &[u8], caps: &[String]) -> StevedoreResult<LinuxSeccomp> {
    let file: ProfileFile = serde_json::from_slice(data)
        .map_err(|e| StevedoreError::Config(format!("Invalid seccomp profile: {}", e)))?;
    let held: BTreeSet<String> = caps.iter().cloned().collect();

    let mut syscalls = Vec::new();
    for rule in file.syscalls {
        if !rule.applies(&held) {
            continue;
        }
        let mut names = rule.names;
        names.extend(rule.name);
        if names.is_empty() {
            continue;
        }
        syscalls.push(build_syscall(names, rule.action, rule.errno_ret, rule.args)?);
    }

    let mut builder = LinuxSeccompBuilder::default()
        .default_action(file.default_action)
        .syscalls(syscalls);
    if let Some(errno) = file.default_errno_ret {
        builder = builder.default_errno_ret(errno);
    }
    builder
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build seccomp profile: {}", e)))
}

/// Resolve a profile setting. `None` or empty selects the built-in profile.
pub fn resolve(setting: Option<&str>, caps: &[String]) -> StevedoreResult<Option<LinuxSeccomp>> {
    match setting.map(str::trim) {
        Some(UNCONFINED) => Ok(None),
        None | Some("") => default_profile(caps).map(Some),
        Some(path) => {
            let data = std::fs::read(Path::new(path)).map_err(|e| {
                StevedoreError::io(format!("Failed to read seccomp profile {}", path), e)
            })?;
            parse_profile(&data, caps).map(Some)
        }
    }
}

/// BPF compilation for the chroot isolator.
#[cfg(target_os = "linux")]
pub mod bpf {
    use std::collections::{BTreeMap, HashMap};

    use oci_spec::runtime::{LinuxSeccomp, LinuxSeccompAction, LinuxSeccompArg, LinuxSeccompOperator};
    use seccompiler::{BpfProgram, TargetArch};
    use serde_json::{Value, json};
    use stevedore_shared::errors::{StevedoreError, StevedoreResult};

    fn target_arch() -> StevedoreResult<TargetArch> {
        TargetArch::try_from(std::env::consts::ARCH)
            .map_err(|e| StevedoreError::Unsupported(format!("seccomp on {}: {:?}", std::env::consts::ARCH, e)))
    }

    fn action(action: LinuxSeccompAction, errno: Option<u32>) -> StevedoreResult<Value> {
        #[allow(unreachable_patterns)]
        Ok(match action {
            LinuxSeccompAction::ScmpActAllow => json!("allow"),
            LinuxSeccompAction::ScmpActLog => json!("log"),
            LinuxSeccompAction::ScmpActErrno => json!({ "errno": errno.unwrap_or(libc::EPERM as u32) }),
            LinuxSeccompAction::ScmpActTrap => json!("trap"),
            LinuxSeccompAction::ScmpActTrace => json!({ "trace": errno.unwrap_or(0) }),
            LinuxSeccompAction::ScmpActKill => json!("kill_thread"),
            LinuxSeccompAction::ScmpActKillProcess => json!("kill_process"),
            other => {
                return Err(StevedoreError::Unsupported(format!(
                    "seccomp action {:?} in chroot isolation",
                    other
                )));
            }
        })
    }

    fn is_permissive(action: &Value) -> bool {
        action == "allow" || action == "log"
    }

    fn condition(arg: &LinuxSeccompArg) -> Value {
        let op = match arg.op() {
            LinuxSeccompOperator::ScmpCmpNe => json!("ne"),
            LinuxSeccompOperator::ScmpCmpLt => json!("lt"),
            LinuxSeccompOperator::ScmpCmpLe => json!("le"),
            LinuxSeccompOperator::ScmpCmpEq => json!("eq"),
            LinuxSeccompOperator::ScmpCmpGe => json!("ge"),
            LinuxSeccompOperator::ScmpCmpGt => json!("gt"),
            LinuxSeccompOperator::ScmpCmpMaskedEq => json!({ "masked_eq": arg.value() }),
        };
        let value = match arg.op() {
            LinuxSeccompOperator::ScmpCmpMaskedEq => arg.value_two().unwrap_or(0),
            _ => arg.value(),
        };
        json!({ "index": arg.index(), "type": "qword", "op": op, "val": value })
    }

    fn filter_json(mismatch: &Value, matched: &Value, rules: &[Value]) -> Value {
        json!({ "mismatch_action": mismatch, "match_action": matched, "filter": rules })
    }

    /// Whether `seccompiler` knows `name` on this architecture. Profiles
    /// list syscalls for every architecture, so unknown names are skipped.
    fn known_syscall(name: &str, arch: TargetArch) -> bool {
        let probe = json!({ "probe": filter_json(&json!("allow"), &json!({"errno": 1}), &[json!({"syscall": name})]) });
        seccompiler::compile_from_json(probe.to_string().as_bytes(), arch).is_ok()
    }

    /// Rules for one action. A name with an unconditional rule drops its
    /// conditional ones.
    #[derive(Default)]
    struct Group {
        action: Value,
        rules: BTreeMap<String, Vec<Vec<Value>>>,
    }

    impl Group {
        fn add(&mut self, name: &str, conditions: Vec<Value>) {
            let entry = self.rules.entry(name.to_string()).or_default();
            if entry.iter().any(Vec::is_empty) {
                return;
            }
            if conditions.is_empty() {
                entry.clear();
            }
            entry.push(conditions);
        }

        fn to_rules(&self) -> Vec<Value> {
            let mut out = Vec::new();
            for (name, alternatives) in &self.rules {
                for conditions in alternatives {
                    if conditions.is_empty() {
                        out.push(json!({ "syscall": name }));
                    } else {
                        out.push(json!({ "syscall": name, "args": conditions }));
                    }
                }
            }
            out
        }
    }

    /// Compile `profile` into programs to install in order. The kernel
    /// evaluates every installed filter and picks the most restrictive
    /// verdict, so each restrictive action gets its own allow-by-default
    /// filter and all permissive rules share one filter over the default.
    pub fn compile(profile: &LinuxSeccomp) -> StevedoreResult<Vec<BpfProgram>> {
        let arch = target_arch()?;
        let default = action(profile.default_action(), profile.default_errno_ret())?;

        let mut permissive = Group {
            action: json!("allow"),
            ..Group::default()
        };
        let mut restrictive: Vec<Group> = Vec::new();
        let mut known: HashMap<String, bool> = HashMap::new();

        for syscall in profile.syscalls().iter().flatten() {
            let act = action(syscall.action(), syscall.errno_ret())?;
            if act == default || (is_permissive(&act) && is_permissive(&default)) {
                continue;
            }
            let conditions: Vec<Value> = syscall.args().iter().flatten().map(condition).collect();
            let group = if is_permissive(&act) {
                &mut permissive
            } else {
                match restrictive.iter().position(|g| g.action == act) {
                    Some(i) => &mut restrictive[i],
                    None => {
                        restrictive.push(Group {
                            action: act.clone(),
                            ..Group::default()
                        });
                        let last = restrictive.len() - 1;
                        &mut restrictive[last]
                    }
                }
            };
            for name in syscall.names() {
                let is_known = *known
                    .entry(name.clone())
                    .or_insert_with(|| known_syscall(name, arch));
                if is_known {
                    group.add(name, conditions.clone());
                } else {
                    tracing::debug!(syscall = %name, "Skipping syscall unknown on this architecture");
                }
            }
        }

        let mut filters: Vec<Value> = Vec::new();
        if !is_permissive(&default) {
            if permissive.rules.is_empty() {
                return Err(StevedoreError::InvalidArgument(
                    "seccomp profile denies every syscall".into(),
                ));
            }
            filters.push(filter_json(&default, &permissive.action, &permissive.to_rules()));
        }
        for group in restrictive.iter().filter(|g| !g.rules.is_empty()) {
            filters.push(filter_json(&json!("allow"), &group.action, &group.to_rules()));
        }

        let mut document = serde_json::Map::new();
        for (i, filter) in filters.iter().enumerate() {
            document.insert(format!("f{:03}", i), filter.clone());
        }
        let mut compiled = seccompiler::compile_from_json(Value::Object(document).to_string().as_bytes(), arch)
            .map_err(|e| StevedoreError::Config(format!("Failed to compile seccomp profile: {}", e)))?;

        let mut programs = Vec::with_capacity(filters.len());
        for i in 0..filters.len() {
            if let Some(program) = compiled.remove(&format!("f{:03}", i)) {
                programs.push(program);
            }
        }
        Ok(programs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(profile: &LinuxSeccomp) -> Vec<String> {
        profile
            .syscalls()
            .iter()
            .flatten()
            .flat_map(|s| s.names().clone())
            .collect()
    }

    #[test]
    fn test_unconfined_disables() {
        assert!(resolve(Some("unconfined"), &[]).unwrap().is_none());
    }

    #[test]
    fn test_default_profile_respects_capabilities() {
        let profile = resolve(None, &[]).unwrap().unwrap();
        assert_eq!(profile.default_action(), LinuxSeccompAction::ScmpActAllow);
        let denied = names(&profile);
        assert!(denied.contains(&"mount".to_string()));
        assert!(denied.contains(&"keyctl".to_string()));
        assert!(!denied.contains(&"execve".to_string()));

        let profile = default_profile(&["CAP_SYS_ADMIN".to_string()]).unwrap();
        let denied = names(&profile);
        assert!(!denied.contains(&"mount".to_string()));
        assert!(denied.contains(&"ptrace".to_string()));
    }

    #[test]
    fn test_profile_filtered_by_caps() {
        let json = br#"{
            "defaultAction": "SCMP_ACT_ERRNO",
            "syscalls": [
                {"names": ["read", "write"], "action": "SCMP_ACT_ALLOW"},
                {"names": ["mount"], "action": "SCMP_ACT_ALLOW", "includes": {"caps": ["CAP_SYS_ADMIN"]}},
                {"names": ["chown"], "action": "SCMP_ACT_ALLOW", "excludes": {"caps": ["CAP_CHOWN"]}},
                {"name": "personality", "action": "SCMP_ACT_ALLOW",
                 "args": [{"index": 0, "value": 0, "op": "SCMP_CMP_EQ"}]}
            ]
        }"#;
        let profile = parse_profile(json, &["CAP_CHOWN".to_string()]).unwrap();
        let allowed = names(&profile);
        assert_eq!(allowed, vec!["read", "write", "personality"]);
        assert_eq!(profile.default_action(), LinuxSeccompAction::ScmpActErrno);
    }

    #[test]
    fn test_missing_profile_file() {
        assert!(resolve(Some("/nonexistent/seccomp.json"), &[]).is_err());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            resolve(Some(path.to_str().unwrap()), &[]),
            Err(StevedoreError::Config(_))
        ));
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_compile_default_profile() {
        let profile = default_profile(&[]).unwrap();
        let programs = bpf::compile(&profile).unwrap();
        assert_eq!(programs.len(), 1);
        assert!(!programs[0].is_empty());
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_compile_allow_list() {
        let json = br#"{
            "defaultAction": "SCMP_ACT_ERRNO",
            "syscalls": [
                {"names": ["read", "write", "no_such_syscall"], "action": "SCMP_ACT_ALLOW"},
                {"names": ["ptrace"], "action": "SCMP_ACT_KILL_PROCESS"}
            ]
        }"#;
        let profile = parse_profile(json, &[]).unwrap();
        let programs = bpf::compile(&profile).unwrap();
        assert_eq!(programs.len(), 2);
    }
}
