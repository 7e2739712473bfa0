//! Capability sets for run commands.

use std::collections::{BTreeSet, HashSet};

use oci_spec::runtime::{Capability, LinuxCapabilities, LinuxCapabilitiesBuilder};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

/// Every capability the kernel knows about, in number order.
pub const ALL_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// `chown`, `cap_chown` and `CAP_CHOWN` all name the same capability.
pub fn canonical(name: &str) -> StevedoreResult<String> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    };
    if ALL_CAPABILITIES.contains(&full.as_str()) {
        Ok(full)
    } else {
        Err(StevedoreError::InvalidArgument(format!("unknown capability {:?}", name)))
    }
}

fn is_all(name: &str) -> bool {
    name.eq_ignore_ascii_case("all")
}

/// Apply drops, then adds, to `defaults`. `all` is accepted on either
/// side: dropping all starts from nothing, adding all grants everything.
/// An explicit drop beats an explicit add.
pub fn compute(defaults: &[String], add: &[String], drop: &[String]) -> StevedoreResult<Vec<String>> {
    let drop_all = drop.iter().any(|d| is_all(d));
    let add_all = add.iter().any(|a| is_all(a));

    let mut set: BTreeSet<String> = if drop_all {
        BTreeSet::new()
    } else {
        defaults.iter().map(|c| canonical(c)).collect::<StevedoreResult<_>>()?
    };
    if add_all {
        set.extend(ALL_CAPABILITIES.iter().map(|c| c.to_string()));
    }
    for cap in add.iter().filter(|a| !is_all(a)) {
        set.insert(canonical(cap)?);
    }
    for cap in drop.iter().filter(|d| !is_all(d)) {
        set.remove(&canonical(cap)?);
    }
    Ok(set.into_iter().collect())
}

fn to_set(names: &[String]) -> StevedoreResult<HashSet<Capability>> {
    names
        .iter()
        .map(|name| {
            serde_json::from_value::<Capability>(serde_json::Value::String(name.clone())).map_err(|e| {
                StevedoreError::InvalidArgument(format!("capability {:?}: {}", name, e))
            })
        })
        .collect()
}

/// Bounding, effective and permitted sets. Inheritable and ambient sets are
/// filled only for root so non-root commands do not keep capabilities across
/// exec.
pub fn to_oci(names: &[String], uid: u32) -> StevedoreResult<LinuxCapabilities> {
    let set = to_set(names)?;
    let inherited = if uid == 0 { set.clone() } else { HashSet::new() };
    LinuxCapabilitiesBuilder::default()
        .bounding(set.clone())
        .effective(set.clone())
        .permitted(set)
        .inheritable(inherited.clone())
        .ambient(inherited)
        .build()
        .map_err(|e| StevedoreError::Internal(format!("Failed to build capabilities: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_add_and_drop() {
        let defaults = s(&["CAP_CHOWN", "CAP_KILL"]);
        let caps = compute(&defaults, &s(&["net_raw"]), &s(&["kill"])).unwrap();
        assert_eq!(caps, s(&["CAP_CHOWN", "CAP_NET_RAW"]));
    }

    #[test]
    fn test_all_keyword() {
        let defaults = s(&["CAP_CHOWN"]);
        let caps = compute(&defaults, &s(&["CAP_SETUID"]), &s(&["ALL"])).unwrap();
        assert_eq!(caps, s(&["CAP_SETUID"]));

        let caps = compute(&defaults, &s(&["all"]), &s(&["CAP_SYS_ADMIN"])).unwrap();
        assert_eq!(caps.len(), ALL_CAPABILITIES.len() - 1);
        assert!(!caps.contains(&"CAP_SYS_ADMIN".to_string()));
    }

    #[test]
    fn test_unknown_capability() {
        assert!(compute(&[], &s(&["CAP_FLY"]), &[]).is_err());
    }

    #[test]
    fn test_oci_sets() {
        let caps = to_oci(&s(&["CAP_CHOWN"]), 1000).unwrap();
        assert_eq!(caps.bounding().as_ref().map(|c| c.len()), Some(1));
        assert_eq!(caps.ambient().as_ref().map(|c| c.len()), Some(0));
        let caps = to_oci(&s(&["CAP_CHOWN"]), 0).unwrap();
        assert!(caps.ambient().as_ref().unwrap().contains(&Capability::Chown));
    }
}
