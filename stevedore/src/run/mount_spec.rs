//! `--mount=type=…,key=value` parsing.

use std::path::PathBuf;

use stevedore_shared::constants::run::{SECRETS_DIR, SSH_DIR};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

/// SELinux relabeling requested for a bind source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relabel {
    /// Label usable by every container (`z`).
    Shared,
    /// Label private to this container (`Z`).
    Private,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheSharing {
    #[default]
    Shared,
    Private,
    Locked,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretMount {
    pub id: String,
    pub target: PathBuf,
    pub required: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshMount {
    pub id: String,
    /// `None` picks a numbered socket under the default directory.
    pub target: Option<PathBuf>,
    pub required: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Image whose root the source is relative to.
    pub from: Option<String>,
    pub rw: bool,
    pub relabel: Option<Relabel>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TmpfsMount {
    pub target: PathBuf,
    pub size: Option<String>,
    pub mode: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheMount {
    /// Cache name; the target path when not given.
    pub id: String,
    pub target: PathBuf,
    pub rw: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub sharing: CacheSharing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunMount {
    Secret(SecretMount),
    Ssh(SshMount),
    Bind(BindMount),
    Tmpfs(TmpfsMount),
    Cache(CacheMount),
}

impl RunMount {
    pub fn target(&self) -> Option<&std::path::Path> {
        match self {
            RunMount::Secret(m) => Some(&m.target),
            RunMount::Ssh(m) => m.target.as_deref(),
            RunMount::Bind(m) => Some(&m.target),
            RunMount::Tmpfs(m) => Some(&m.target),
            RunMount::Cache(m) => Some(&m.target),
        }
    }
}

fn invalid(spec: &str, why: impl std::fmt::Display) -> StevedoreError {
    StevedoreError::InvalidMountSpec(format!("{:?}: {}", spec, why))
}

fn parse_bool(spec: &str, key: &str, value: Option<&str>) -> StevedoreResult<bool> {
    match value {
        None | Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(invalid(spec, format_args!("{} expects a boolean, got {:?}", key, other))),
    }
}

fn parse_mode(spec: &str, value: &str) -> StevedoreResult<u32> {
    let mode = u32::from_str_radix(value.trim_start_matches("0o"), 8)
        .map_err(|_| invalid(spec, format_args!("mode {:?} is not octal", value)))?;
    if mode > 0o7777 {
        return Err(invalid(spec, format_args!("mode {:o} out of range", mode)));
    }
    Ok(mode)
}

fn parse_id(spec: &str, key: &str, value: &str) -> StevedoreResult<u32> {
    value
        .parse()
        .map_err(|_| invalid(spec, format_args!("{} {:?} is not a number", key, value)))
}

fn absolute_target(spec: &str, target: &str) -> StevedoreResult<PathBuf> {
    if !target.starts_with('/') {
        return Err(invalid(spec, format_args!("target {:?} must be absolute", target)));
    }
    if target.split('/').any(|c| c == "..") {
        return Err(invalid(spec, format_args!("target {:?} may not contain ..", target)));
    }
    Ok(PathBuf::from(target))
}

#[derive(Default)]
struct Fields<'a> {
    typ: Option<&'a str>,
    id: Option<&'a str>,
    source: Option<&'a str>,
    target: Option<&'a str>,
    from: Option<&'a str>,
    required: Option<bool>,
    rw: Option<bool>,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<&'a str>,
    sharing: Option<CacheSharing>,
    relabel: Option<Relabel>,
}

/// Parse one `--mount` value. The type defaults to `bind`.
pub fn parse_run_mount(spec: &str) -> StevedoreResult<RunMount> {
    let mut f = Fields::default();
    for field in spec.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        let (key, value) = match field.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (field, None),
        };
        let need = || value.ok_or_else(|| invalid(spec, format_args!("{} needs a value", key)));
        match key {
            "type" => f.typ = Some(need()?),
            "id" => f.id = Some(need()?),
            "source" | "src" => f.source = Some(need()?),
            "target" | "dst" | "destination" => f.target = Some(need()?),
            "from" => f.from = Some(need()?),
            "required" => f.required = Some(parse_bool(spec, key, value)?),
            "rw" | "readwrite" => f.rw = Some(parse_bool(spec, key, value)?),
            "ro" | "readonly" => f.rw = Some(!parse_bool(spec, key, value)?),
            "mode" => f.mode = Some(parse_mode(spec, need()?)?),
            "uid" => f.uid = Some(parse_id(spec, key, need()?)?),
            "gid" => f.gid = Some(parse_id(spec, key, need()?)?),
            "size" | "tmpfs-size" => f.size = Some(need()?),
            "sharing" => {
                f.sharing = Some(match need()? {
                    "shared" => CacheSharing::Shared,
                    "private" => CacheSharing::Private,
                    "locked" => CacheSharing::Locked,
                    other => return Err(invalid(spec, format_args!("unknown sharing {:?}", other))),
                })
            }
            "relabel" => {
                f.relabel = Some(match need()? {
                    "shared" | "z" => Relabel::Shared,
                    "private" | "Z" => Relabel::Private,
                    other => return Err(invalid(spec, format_args!("unknown relabel {:?}", other))),
                })
            }
            "z" => f.relabel = Some(Relabel::Shared),
            "Z" => f.relabel = Some(Relabel::Private),
            other => return Err(invalid(spec, format_args!("unknown option {:?}", other))),
        }
    }

    let reject = |present: bool, key: &str, typ: &str| -> StevedoreResult<()> {
        if present {
            Err(invalid(spec, format_args!("{} is not valid for type={}", key, typ)))
        } else {
            Ok(())
        }
    };

    match f.typ.unwrap_or("bind") {
        "secret" => {
            reject(f.source.is_some(), "source", "secret")?;
            reject(f.from.is_some(), "from", "secret")?;
            let id = match (f.id, f.target) {
                (Some(id), _) => id.to_string(),
                (None, Some(target)) => target.rsplit('/').next().unwrap_or_default().to_string(),
                (None, None) => return Err(invalid(spec, "secret mounts need an id")),
            };
            if id.is_empty() || id.contains('/') {
                return Err(invalid(spec, format_args!("bad secret id {:?}", id)));
            }
            let target = match f.target {
                Some(t) => absolute_target(spec, t)?,
                None => PathBuf::from(SECRETS_DIR).join(&id),
            };
            Ok(RunMount::Secret(SecretMount {
                id,
                target,
                required: f.required.unwrap_or(false),
                mode: f.mode.unwrap_or(0o400),
                uid: f.uid.unwrap_or(0),
                gid: f.gid.unwrap_or(0),
            }))
        }
        "ssh" => {
            reject(f.source.is_some(), "source", "ssh")?;
            reject(f.from.is_some(), "from", "ssh")?;
            Ok(RunMount::Ssh(SshMount {
                id: f.id.unwrap_or("default").to_string(),
                target: f.target.map(|t| absolute_target(spec, t)).transpose()?,
                required: f.required.unwrap_or(false),
                mode: f.mode.unwrap_or(0o600),
                uid: f.uid.unwrap_or(0),
                gid: f.gid.unwrap_or(0),
            }))
        }
        "bind" => {
            reject(f.sharing.is_some(), "sharing", "bind")?;
            let source = f.source.ok_or_else(|| invalid(spec, "bind mounts need a source"))?;
            let target = absolute_target(spec, f.target.unwrap_or(source))?;
            Ok(RunMount::Bind(BindMount {
                source: PathBuf::from(source),
                target,
                from: f.from.map(str::to_string),
                rw: f.rw.unwrap_or(false),
                relabel: f.relabel,
            }))
        }
        "tmpfs" => {
            reject(f.source.is_some(), "source", "tmpfs")?;
            reject(f.from.is_some(), "from", "tmpfs")?;
            let target = f.target.ok_or_else(|| invalid(spec, "tmpfs mounts need a target"))?;
            if let Some(size) = f.size {
                crate::run::spec::validate_size(size).map_err(|_| invalid(spec, format_args!("bad size {:?}", size)))?;
            }
            Ok(RunMount::Tmpfs(TmpfsMount {
                target: absolute_target(spec, target)?,
                size: f.size.map(str::to_string),
                mode: f.mode,
            }))
        }
        "cache" => {
            reject(f.source.is_some(), "source", "cache")?;
            reject(f.from.is_some(), "from", "cache")?;
            let target = f.target.ok_or_else(|| invalid(spec, "cache mounts need a target"))?;
            let target = absolute_target(spec, target)?;
            Ok(RunMount::Cache(CacheMount {
                id: f
                    .id
                    .map(str::to_string)
                    .unwrap_or_else(|| target.to_string_lossy().into_owned()),
                target,
                rw: f.rw.unwrap_or(true),
                mode: f.mode.unwrap_or(0o755),
                uid: f.uid.unwrap_or(0),
                gid: f.gid.unwrap_or(0),
                sharing: f.sharing.unwrap_or_default(),
            }))
        }
        other => Err(invalid(spec, format_args!("unknown mount type {:?}", other))),
    }
}

/// Default in-container path for the `index`th ssh mount.
pub fn default_ssh_target(index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", SSH_DIR, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_secret_defaults() {
        let m = parse_run_mount("type=secret,id=x").unwrap();
        let RunMount::Secret(s) = m else { panic!("not a secret") };
        assert_eq!(s.target, PathBuf::from("/run/secrets/x"));
        assert_eq!(s.mode, 0o400);
        assert!(!s.required);

        let m = parse_run_mount("type=secret,target=/etc/token,required").unwrap();
        let RunMount::Secret(s) = m else { panic!("not a secret") };
        assert_eq!(s.id, "token");
        assert!(s.required);
    }

    #[test]
    fn test_bind_and_from() {
        let m = parse_run_mount("type=bind,source=/src,target=/dst,from=builder,rw=true,relabel=private").unwrap();
        assert_eq!(
            m,
            RunMount::Bind(BindMount {
                source: PathBuf::from("/src"),
                target: PathBuf::from("/dst"),
                from: Some("builder".into()),
                rw: true,
                relabel: Some(Relabel::Private),
            })
        );
        let RunMount::Bind(b) = parse_run_mount("src=/data").unwrap() else { panic!() };
        assert_eq!(b.target, PathBuf::from("/data"));
        assert!(!b.rw);
    }

    #[test]
    fn test_cache_and_tmpfs() {
        let RunMount::Cache(c) = parse_run_mount("type=cache,target=/root/.cache,sharing=locked,mode=0700,uid=1000").unwrap() else {
            panic!()
        };
        assert_eq!(c.id, "/root/.cache");
        assert_eq!(c.sharing, CacheSharing::Locked);
        assert_eq!((c.mode, c.uid), (0o700, 1000));

        let RunMount::Tmpfs(t) = parse_run_mount("type=tmpfs,target=/scratch,size=64m").unwrap() else { panic!() };
        assert_eq!(t.size.as_deref(), Some("64m"));
    }

    #[test]
    fn test_ssh_defaults() {
        let RunMount::Ssh(s) = parse_run_mount("type=ssh").unwrap() else { panic!() };
        assert_eq!(s.id, "default");
        assert!(s.target.is_none());
        assert_eq!(default_ssh_target(0), PathBuf::from("/run/buildkit/ssh_agent.0"));
    }

    #[test]
    fn test_invalid_specs() {
        for bad in [
            "type=volume,target=/x",
            "type=bind,target=/x",
            "type=secret",
            "type=tmpfs",
            "type=cache,target=relative",
            "type=cache,target=/x,sharing=sometimes",
            "type=secret,id=x,mode=999",
            "type=bind,source=/a,target=/b/../c",
            "type=tmpfs,target=/t,source=/s",
            "type=bind,source=/a,bogus=1",
        ] {
            assert!(
                matches!(parse_run_mount(bad), Err(StevedoreError::InvalidMountSpec(_))),
                "{}",
                bad
            );
        }
    }

    proptest! {
        #[test]
        fn prop_tmpfs_target_preserved(target in "(/[a-z0-9_]{1,8}){1,4}") {
            let RunMount::Tmpfs(t) = parse_run_mount(&format!("type=tmpfs,target={}", target)).unwrap() else {
                panic!("not tmpfs")
            };
            prop_assert_eq!(t.target, PathBuf::from(target));
        }

        #[test]
        fn prop_never_panics(spec in "[a-z=,/0-9]{0,40}") {
            let _ = parse_run_mount(&spec);
        }
    }
}
