//! `-v host:container[:options]` volumes and image-declared volumes.

use std::path::{Path, PathBuf};

use oci_spec::runtime::Mount;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::run::mount_spec::Relabel;
use crate::run::spec::mount;
use crate::util::fs::{copy_tree, dir_is_empty};

const PROPAGATION: &[&str] = &[
    "private", "rprivate", "shared", "rshared", "slave", "rslave", "unbindable", "runbindable",
];
const FLAGS: &[&str] = &["nosuid", "suid", "nodev", "dev", "noexec", "exec"];

/// A parsed `-v` volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeSpec {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub options: Vec<String>,
    pub relabel: Option<Relabel>,
}

impl VolumeSpec {
    pub fn to_mount(&self) -> StevedoreResult<Mount> {
        let options: Vec<&str> = self.options.iter().map(String::as_str).collect();
        mount(
            &self.destination.to_string_lossy(),
            "bind",
            &self.source.to_string_lossy(),
            &options,
        )
    }
}

fn invalid(spec: &str, why: impl std::fmt::Display) -> StevedoreError {
    StevedoreError::InvalidMountSpec(format!("volume {:?}: {}", spec, why))
}

/// Parse `host:container[:opt,opt…]`.
pub fn parse_volume_spec(spec: &str) -> StevedoreResult<VolumeSpec> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, destination, opts) = match parts.as_slice() {
        [s, d] => (*s, *d, ""),
        [s, d, o] => (*s, *d, *o),
        _ => return Err(invalid(spec, "expected host:container[:options]")),
    };
    if !source.starts_with('/') {
        return Err(invalid(spec, "host path must be absolute"));
    }
    if !destination.starts_with('/') {
        return Err(invalid(spec, "container path must be absolute"));
    }

    let mut rw = None;
    let mut relabel = None;
    let mut recursive = true;
    let mut options = Vec::new();
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "ro" | "rw" => {
                if rw.replace(opt == "rw").is_some() {
                    return Err(invalid(spec, "ro and rw given more than once"));
                }
            }
            "z" | "Z" => {
                if relabel.is_some() {
                    return Err(invalid(spec, "z and Z are exclusive"));
                }
                relabel = Some(if opt == "z" { Relabel::Shared } else { Relabel::Private });
            }
            "bind" => recursive = false,
            "rbind" => recursive = true,
            o if PROPAGATION.contains(&o) || FLAGS.contains(&o) => options.push(o.to_string()),
            other => return Err(invalid(spec, format_args!("unknown option {:?}", other))),
        }
    }
    options.insert(0, if recursive { "rbind" } else { "bind" }.to_string());
    if rw == Some(false) {
        options.push("ro".to_string());
    }

    Ok(VolumeSpec {
        source: PathBuf::from(source),
        destination: PathBuf::from(destination),
        options,
        relabel,
    })
}

/// Directory name for an image volume path.
fn volume_dir_name(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.replace('/', "_")
    }
}

/// Back an image-declared volume with a directory under `volumes_dir`.
///
/// The directory is primed from the rootfs contents at `path` the first
/// time it is used and kept across runs.
pub fn builtin_volume(rootfs: &Path, volumes_dir: &Path, path: &str) -> StevedoreResult<Mount> {
    let host = volumes_dir.join(volume_dir_name(path));
    if !host.exists() {
        let in_image = rootfs.join(path.trim_start_matches('/'));
        if in_image.is_dir() && !dir_is_empty(&in_image) {
            copy_tree(&in_image, &host)?;
        } else {
            std::fs::create_dir_all(&host)
                .map_err(|e| StevedoreError::io(format!("Failed to create {}", host.display()), e))?;
        }
        tracing::debug!(volume = %path, dir = %host.display(), "Primed image volume");
    }
    mount(path, "bind", &host.to_string_lossy(), &["rbind", "rw"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volume_defaults() {
        let v = parse_volume_spec("/srv/data:/data").unwrap();
        assert_eq!(v.source, PathBuf::from("/srv/data"));
        assert_eq!(v.destination, PathBuf::from("/data"));
        assert_eq!(v.options, vec!["rbind"]);
        assert_eq!(v.relabel, None);
    }

    #[test]
    fn test_parse_volume_options() {
        let v = parse_volume_spec("/a:/b:ro,Z,rprivate,nosuid").unwrap();
        assert_eq!(v.options, vec!["rbind", "rprivate", "nosuid", "ro"]);
        assert_eq!(v.relabel, Some(Relabel::Private));
        let m = v.to_mount().unwrap();
        assert_eq!(m.typ().as_deref(), Some("bind"));
    }

    #[test]
    fn test_parse_volume_errors() {
        assert!(parse_volume_spec("relative:/b").is_err());
        assert!(parse_volume_spec("/a:relative").is_err());
        assert!(parse_volume_spec("/a").is_err());
        assert!(parse_volume_spec("/a:/b:ro,rw").is_err());
        assert!(parse_volume_spec("/a:/b:z,Z").is_err());
        assert!(parse_volume_spec("/a:/b:O").is_err());
    }

    #[test]
    fn test_builtin_volume_primed_once() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("var/lib/db")).unwrap();
        std::fs::write(rootfs.join("var/lib/db/seed"), b"1").unwrap();
        let volumes = dir.path().join("volumes");

        let m = builtin_volume(&rootfs, &volumes, "/var/lib/db").unwrap();
        let host = m.source().clone().unwrap();
        assert_eq!(host, volumes.join("var_lib_db"));
        assert_eq!(std::fs::read(host.join("seed")).unwrap(), b"1");

        std::fs::write(rootfs.join("var/lib/db/seed"), b"2").unwrap();
        std::fs::write(host.join("seed"), b"kept").unwrap();
        builtin_volume(&rootfs, &volumes, "/var/lib/db").unwrap();
        assert_eq!(std::fs::read(host.join("seed")).unwrap(), b"kept");
    }

    #[test]
    fn test_builtin_volume_without_content() {
        let dir = tempfile::tempdir().unwrap();
        let m = builtin_volume(dir.path(), &dir.path().join("v"), "/cache").unwrap();
        assert_eq!(m.destination(), Path::new("/cache"));
        assert!(dir.path().join("v/cache").is_dir());
    }
}
