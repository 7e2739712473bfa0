//! `NAME=soft:hard` resource limits.

use oci_spec::runtime::{PosixRlimit, PosixRlimitBuilder, PosixRlimitType};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

/// A parsed ulimit. `u64::MAX` stands for unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ulimit {
    pub typ: PosixRlimitType,
    pub soft: u64,
    pub hard: u64,
}

const NAMES: &[(&str, PosixRlimitType)] = &[
    ("as", PosixRlimitType::RlimitAs),
    ("core", PosixRlimitType::RlimitCore),
    ("cpu", PosixRlimitType::RlimitCpu),
    ("data", PosixRlimitType::RlimitData),
    ("fsize", PosixRlimitType::RlimitFsize),
    ("locks", PosixRlimitType::RlimitLocks),
    ("memlock", PosixRlimitType::RlimitMemlock),
    ("msgqueue", PosixRlimitType::RlimitMsgqueue),
    ("nice", PosixRlimitType::RlimitNice),
    ("nofile", PosixRlimitType::RlimitNofile),
    ("nproc", PosixRlimitType::RlimitNproc),
    ("rss", PosixRlimitType::RlimitRss),
    ("rtprio", PosixRlimitType::RlimitRtprio),
    ("rttime", PosixRlimitType::RlimitRttime),
    ("sigpending", PosixRlimitType::RlimitSigpending),
    ("stack", PosixRlimitType::RlimitStack),
];

fn lookup(name: &str) -> Option<PosixRlimitType> {
    let lower = name.to_ascii_lowercase();
    let short = lower.strip_prefix("rlimit_").unwrap_or(&lower);
    NAMES.iter().find(|(n, _)| *n == short).map(|(_, t)| *t)
}

fn parse_value(value: &str, spec: &str) -> StevedoreResult<u64> {
    if value == "-1" || value.eq_ignore_ascii_case("unlimited") {
        return Ok(u64::MAX);
    }
    value
        .parse()
        .map_err(|_| StevedoreError::InvalidLimit(format!("{:?}: bad value {:?}", spec, value)))
}

/// Parse `nofile=1024:2048`, `RLIMIT_NPROC=100` or `core=unlimited`.
/// A single value sets both limits.
pub fn parse_ulimit(spec: &str) -> StevedoreResult<Ulimit> {
    let (name, values) = spec
        .split_once('=')
        .ok_or_else(|| StevedoreError::InvalidLimit(format!("{:?}: expected NAME=soft[:hard]", spec)))?;
    let typ = lookup(name.trim())
        .ok_or_else(|| StevedoreError::InvalidLimit(format!("unknown limit {:?}", name)))?;
    let (soft, hard) = match values.split_once(':') {
        Some((soft, hard)) => (parse_value(soft, spec)?, parse_value(hard, spec)?),
        None => {
            let v = parse_value(values, spec)?;
            (v, v)
        }
    };
    if soft > hard {
        return Err(StevedoreError::InvalidLimit(format!(
            "{:?}: soft limit exceeds hard limit",
            spec
        )));
    }
    Ok(Ulimit { typ, soft, hard })
}

/// Parse every spec; later entries replace earlier ones of the same type.
pub fn parse_ulimits<S: AsRef<str>>(specs: &[S]) -> StevedoreResult<Vec<Ulimit>> {
    let mut out: Vec<Ulimit> = Vec::new();
    for spec in specs {
        let limit = parse_ulimit(spec.as_ref())?;
        match out.iter_mut().find(|l| l.typ == limit.typ) {
            Some(existing) => *existing = limit,
            None => out.push(limit),
        }
    }
    Ok(out)
}

pub fn to_oci(limits: &[Ulimit]) -> StevedoreResult<Vec<PosixRlimit>> {
    limits
        .iter()
        .map(|l| {
            PosixRlimitBuilder::default()
                .typ(l.typ)
                .soft(l.soft)
                .hard(l.hard)
                .build()
                .map_err(|e| StevedoreError::Internal(format!("Failed to build rlimit: {}", e)))
        })
        .collect()
}

/// The `setrlimit` resource for an OCI limit type.
#[cfg(target_os = "linux")]
pub fn resource(typ: PosixRlimitType) -> Option<nix::sys::resource::Resource> {
    use nix::sys::resource::Resource;
    Some(match typ {
        PosixRlimitType::RlimitAs => Resource::RLIMIT_AS,
        PosixRlimitType::RlimitCore => Resource::RLIMIT_CORE,
        PosixRlimitType::RlimitCpu => Resource::RLIMIT_CPU,
        PosixRlimitType::RlimitData => Resource::RLIMIT_DATA,
        PosixRlimitType::RlimitFsize => Resource::RLIMIT_FSIZE,
        PosixRlimitType::RlimitLocks => Resource::RLIMIT_LOCKS,
        PosixRlimitType::RlimitMemlock => Resource::RLIMIT_MEMLOCK,
        PosixRlimitType::RlimitMsgqueue => Resource::RLIMIT_MSGQUEUE,
        PosixRlimitType::RlimitNice => Resource::RLIMIT_NICE,
        PosixRlimitType::RlimitNofile => Resource::RLIMIT_NOFILE,
        PosixRlimitType::RlimitNproc => Resource::RLIMIT_NPROC,
        PosixRlimitType::RlimitRss => Resource::RLIMIT_RSS,
        PosixRlimitType::RlimitRtprio => Resource::RLIMIT_RTPRIO,
        PosixRlimitType::RlimitRttime => Resource::RLIMIT_RTTIME,
        PosixRlimitType::RlimitSigpending => Resource::RLIMIT_SIGPENDING,
        PosixRlimitType::RlimitStack => Resource::RLIMIT_STACK,
        #[allow(unreachable_patterns)]
        _ => return None,
    })
}

#[cfg(target_os = "linux")]
fn to_rlim(value: u64) -> libc::rlim_t {
    if value == u64::MAX {
        libc::RLIM_INFINITY
    } else {
        value as libc::rlim_t
    }
}

/// First pass, before privileges are dropped: raise each hard limit as far
/// as allowed so the final values can be set later. Failures are ignored.
#[cfg(target_os = "linux")]
pub fn raise_limits(limits: &[PosixRlimit]) {
    use nix::sys::resource::{getrlimit, setrlimit};
    for limit in limits {
        let Some(res) = resource(limit.typ()) else { continue };
        let Ok((soft, hard)) = getrlimit(res) else { continue };
        let wanted = to_rlim(limit.hard());
        if wanted > hard {
            let _ = setrlimit(res, soft.min(wanted), wanted);
        }
    }
}

/// Final pass: set exactly the requested values.
#[cfg(target_os = "linux")]
pub fn apply_limits(limits: &[PosixRlimit]) -> Result<(), (PosixRlimitType, nix::Error)> {
    use nix::sys::resource::setrlimit;
    for limit in limits {
        let Some(res) = resource(limit.typ()) else { continue };
        setrlimit(res, to_rlim(limit.soft()), to_rlim(limit.hard())).map_err(|e| (limit.typ(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_forms() {
        let l = parse_ulimit("nofile=128:256").unwrap();
        assert_eq!((l.typ, l.soft, l.hard), (PosixRlimitType::RlimitNofile, 128, 256));
        let l = parse_ulimit("RLIMIT_NPROC=100").unwrap();
        assert_eq!((l.typ, l.soft, l.hard), (PosixRlimitType::RlimitNproc, 100, 100));
        let l = parse_ulimit("core=unlimited").unwrap();
        assert_eq!(l.hard, u64::MAX);
    }

    #[test]
    fn test_errors_are_invalid_limit() {
        for bad in ["bogus=1", "nofile", "nofile=a:b", "nofile=10:5"] {
            assert!(
                matches!(parse_ulimit(bad), Err(StevedoreError::InvalidLimit(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_later_entry_wins() {
        let limits = parse_ulimits(&["nofile=10:20", "nproc=5", "nofile=30:40"]).unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].soft, 30);
        assert_eq!(to_oci(&limits).unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn prop_soft_hard_roundtrip(soft in 0u64..1_000_000, extra in 0u64..1_000_000) {
            let hard = soft + extra;
            let l = parse_ulimit(&format!("nofile={}:{}", soft, hard)).unwrap();
            prop_assert_eq!((l.soft, l.hard), (soft, hard));
        }

        #[test]
        fn prop_unknown_names_rejected(name in "[a-z]{3,10}") {
            prop_assume!(lookup(&name).is_none());
            let is_invalid_limit = matches!(
                parse_ulimit(&format!("{}=1", name)),
                Err(StevedoreError::InvalidLimit(_))
            );
            prop_assert!(is_invalid_limit);
        }
    }
}
