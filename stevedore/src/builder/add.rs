//! Copying host content into the working container.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing::{debug, info};

use super::Builder;
use crate::archive::{ApplyOptions, Compression, apply_layer, tar_directory};
use crate::idtools::IdMappings;
use crate::run::user::lookup_owner;

/// How `add`/`copy` place content.
#[derive(Clone, Debug, Default)]
pub struct AddOptions {
    /// `user[:group]`, resolved against the container's passwd/group files.
    pub chown: Option<String>,
    /// Permission bits for every copied entry.
    pub chmod: Option<u32>,
    /// Unpack local tar archives instead of copying them.
    pub extract: bool,
}

/// Offset of the `ustar` magic in a tar header.
const TAR_MAGIC_OFFSET: usize = 257;

impl Builder {
    /// Copy `sources` into the rootfs at `destination`, unpacking local
    /// archives.
    pub fn add(&mut self, destination: &str, sources: &[PathBuf], options: &AddOptions) -> StevedoreResult<()> {
        let options = AddOptions {
            extract: true,
            ..options.clone()
        };
        self.copy_in(destination, sources, &options)
    }

    /// Copy `sources` into the rootfs at `destination` verbatim.
    pub fn copy(&mut self, destination: &str, sources: &[PathBuf], options: &AddOptions) -> StevedoreResult<()> {
        let options = AddOptions {
            extract: false,
            ..options.clone()
        };
        self.copy_in(destination, sources, &options)
    }

    fn copy_in(&mut self, destination: &str, sources: &[PathBuf], options: &AddOptions) -> StevedoreResult<()> {
        if sources.is_empty() {
            return Err(StevedoreError::InvalidArgument("no source given".into()));
        }
        for source in sources {
            let text = source.to_string_lossy();
            if text.contains("://") {
                return Err(StevedoreError::InvalidArgument(format!(
                    "remote source {} is not supported",
                    text
                )));
            }
        }

        let rootfs = self.ensure_mounted()?;
        let owner = match &options.chown {
            Some(spec) => lookup_owner(&rootfs, spec)?,
            None => (0, 0),
        };
        let apply_options = ApplyOptions {
            id_mappings: self.id_mappings(),
            chown: Some(owner),
            chmod: options.chmod,
            ignore_whiteouts: true,
        };

        let target = container_path(&rootfs, self.workdir(), destination)?;
        let into_dir = destination.ends_with('/') || sources.len() > 1 || target.is_dir();

        for source in sources {
            let meta = fs::metadata(source).map_err(|e| {
                StevedoreError::io(format!("Failed to stat {}", source.display()), e)
            })?;
            if meta.is_dir() {
                copy_directory(source, &target, &apply_options)?;
            } else if options.extract && is_archive(source)? {
                let file = File::open(source)
                    .map_err(|e| StevedoreError::io(format!("Failed to open {}", source.display()), e))?;
                let stats = apply_layer(file, &target, &apply_options)?;
                debug!(source = %source.display(), entries = stats.entries, "Extracted archive");
            } else {
                let name = source.file_name().ok_or_else(|| {
                    StevedoreError::InvalidArgument(format!("{} has no file name", source.display()))
                })?;
                let dest = if into_dir { target.join(name) } else { target.clone() };
                copy_file(source, &dest, &apply_options)?;
            }
        }
        info!(
            container = %self.container_name(),
            destination,
            sources = sources.len(),
            extract = options.extract,
            "Copied content into container"
        );
        Ok(())
    }
}

/// Resolve a destination inside the rootfs; relative paths are taken from
/// the working directory. `..` never escapes the root.
pub fn container_path(rootfs: &Path, workdir: &str, destination: &str) -> StevedoreResult<PathBuf> {
    let joined = if destination.starts_with('/') {
        PathBuf::from(destination)
    } else {
        Path::new("/").join(workdir).join(destination)
    };
    let mut relative = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::ParentDir => {
                relative.pop();
            }
            _ => {}
        }
    }
    Ok(rootfs.join(relative))
}

fn is_archive(path: &Path) -> StevedoreResult<bool> {
    let mut header = [0u8; 512];
    let mut file = File::open(path)
        .map_err(|e| StevedoreError::io(format!("Failed to open {}", path.display()), e))?;
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => return Err(StevedoreError::io(format!("Failed to read {}", path.display()), e)),
        }
    }
    if Compression::detect(&header[..filled]) != Compression::None {
        return Ok(true);
    }
    Ok(filled >= TAR_MAGIC_OFFSET + 5 && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar")
}

/// Pack the directory's contents and unpack them at `target`.
fn copy_directory(source: &Path, target: &Path, options: &ApplyOptions) -> StevedoreResult<()> {
    let staging = tempfile::tempfile()
        .map_err(|e| StevedoreError::io("Failed to create staging file", e))?;
    let mut staging = tar_directory(source, &IdMappings::default(), staging)?;
    staging
        .seek(SeekFrom::Start(0))
        .map_err(|e| StevedoreError::io("Failed to rewind staging file", e))?;
    apply_layer(staging, target, options)?;
    Ok(())
}

fn copy_file(source: &Path, dest: &Path, options: &ApplyOptions) -> StevedoreResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| StevedoreError::io(format!("Failed to create {}", parent.display()), e))?;
    }
    if fs::symlink_metadata(dest).is_ok_and(|m| m.is_dir()) {
        return Err(StevedoreError::InvalidArgument(format!(
            "{} is a directory",
            dest.display()
        )));
    }
    fs::copy(source, dest).map_err(|e| {
        StevedoreError::io(
            format!("Failed to copy {} to {}", source.display(), dest.display()),
            e,
        )
    })?;
    if let Some(mode) = options.chmod {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(mode)).map_err(|e| {
            StevedoreError::io(format!("Failed to chmod {}", dest.display()), e)
        })?;
    }
    let (uid, gid) = options.id_mappings.to_host(
        options.chown.map(|(u, _)| u).unwrap_or(0),
        options.chown.map(|(_, g)| g).unwrap_or(0),
    )?;
    match std::os::unix::fs::lchown(dest, Some(uid), Some(gid)) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EPERM) && !nix::unistd::geteuid().is_root() => {
            debug!(path = %dest.display(), uid, gid, "Ignoring chown failure (rootless)");
            Ok(())
        }
        Err(e) => Err(StevedoreError::io(format!("Failed to chown {}", dest.display()), e)),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::super::tests::{scratch_builder, setup};
    use super::*;
    use crate::archive::apply::tests::{TestEntry, build_tar};

    #[test]
    fn test_container_path_stays_inside_root() {
        let root = Path::new("/r");
        assert_eq!(container_path(root, "", "/etc/x").unwrap(), PathBuf::from("/r/etc/x"));
        assert_eq!(container_path(root, "/app", "bin").unwrap(), PathBuf::from("/r/app/bin"));
        assert_eq!(container_path(root, "", "../../etc").unwrap(), PathBuf::from("/r/etc"));
        assert_eq!(container_path(root, "", "/").unwrap(), PathBuf::from("/r"));
    }

    #[tokio::test]
    async fn test_copy_file_with_chmod() {
        let (dir, context, store) = setup();
        let mut builder = scratch_builder(&context, &store).await;
        let source = dir.path().join("hello.txt");
        fs::write(&source, b"hi").unwrap();

        let options = AddOptions {
            chmod: Some(0o600),
            ..AddOptions::default()
        };
        builder.copy("/opt/", &[source.clone()], &options).unwrap();
        let dest = builder.mount_point().unwrap().join("opt/hello.txt");
        assert_eq!(fs::read(&dest).unwrap(), b"hi");
        assert_eq!(fs::metadata(&dest).unwrap().permissions().mode() & 0o777, 0o600);

        builder.copy("/renamed", &[source], &AddOptions::default()).unwrap();
        assert!(builder.mount_point().unwrap().join("renamed").is_file());
    }

    #[tokio::test]
    async fn test_add_extracts_archive_but_copy_does_not() {
        let (dir, context, store) = setup();
        let mut builder = scratch_builder(&context, &store).await;
        let tarball = dir.path().join("bundle.tar");
        fs::write(
            &tarball,
            build_tar(&[TestEntry::Dir("pkg"), TestEntry::File("pkg/a", b"aaa")]),
        )
        .unwrap();

        builder.add("/srv", &[tarball.clone()], &AddOptions::default()).unwrap();
        let root = builder.mount_point().unwrap().to_path_buf();
        assert_eq!(fs::read(root.join("srv/pkg/a")).unwrap(), b"aaa");

        builder.copy("/raw/", &[tarball], &AddOptions::default()).unwrap();
        assert!(root.join("raw/bundle.tar").is_file());
    }

    #[tokio::test]
    async fn test_copy_directory_contents() {
        let (dir, context, store) = setup();
        let mut builder = scratch_builder(&context, &store).await;
        let src = dir.path().join("tree");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/f"), b"x").unwrap();

        builder.copy("/dst", &[src], &AddOptions::default()).unwrap();
        assert!(builder.mount_point().unwrap().join("dst/sub/f").is_file());
    }

    #[tokio::test]
    async fn test_url_source_rejected() {
        let (_dir, context, store) = setup();
        let mut builder = scratch_builder(&context, &store).await;
        let err = builder
            .add("/", &[PathBuf::from("https://example.com/x.tar")], &AddOptions::default())
            .unwrap_err();
        assert!(matches!(err, StevedoreError::InvalidArgument(_)));
    }
}
