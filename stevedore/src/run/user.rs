//! Resolve `user[:group]` against the container's own passwd and group
//! files.

use std::fs;
use std::path::Path;

use stevedore_shared::errors::{StevedoreError, StevedoreResult};

/// Identity a command runs as, in container IDs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub home: String,
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
}

struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

fn read_passwd(rootfs: &Path) -> Vec<PasswdEntry> {
    let content = fs::read_to_string(rootfs.join("etc/passwd")).unwrap_or_default();
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[5].to_string(),
            })
        })
        .collect()
}

fn read_group(rootfs: &Path) -> Vec<GroupEntry> {
    let content = fs::read_to_string(rootfs.join("etc/group")).unwrap_or_default();
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                return None;
            }
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members: fields
                    .get(3)
                    .map(|m| m.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Resolve `spec` (`""`, `name`, `uid`, `name:group`, `uid:gid`).
///
/// An empty spec is root. A numeric UID without a passwd entry keeps GID 0
/// and home `/`. Names that cannot be found are an error.
pub fn lookup_user(rootfs: &Path, spec: &str) -> StevedoreResult<ExecUser> {
    let (user, group) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };
    let user = if user.is_empty() { "0" } else { user };

    let passwd = read_passwd(rootfs);
    let (uid, mut gid, home, name) = match user.parse::<u32>() {
        Ok(uid) => match passwd.iter().find(|e| e.uid == uid) {
            Some(e) => (e.uid, e.gid, e.home.clone(), Some(e.name.clone())),
            None => (uid, 0, "/".to_string(), None),
        },
        Err(_) => {
            let e = passwd.iter().find(|e| e.name == user).ok_or_else(|| {
                StevedoreError::InvalidArgument(format!("user {:?} not found in container", user))
            })?;
            (e.uid, e.gid, e.home.clone(), Some(e.name.clone()))
        }
    };

    let groups = read_group(rootfs);
    if let Some(group) = group.filter(|g| !g.is_empty()) {
        gid = match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => groups
                .iter()
                .find(|g| g.name == group)
                .map(|g| g.gid)
                .ok_or_else(|| {
                    StevedoreError::InvalidArgument(format!("group {:?} not found in container", group))
                })?,
        };
    }

    let additional_gids = match (&name, group) {
        (Some(name), None) => groups
            .iter()
            .filter(|g| g.gid != gid && g.members.iter().any(|m| m == name))
            .map(|g| g.gid)
            .collect(),
        _ => Vec::new(),
    };

    Ok(ExecUser {
        uid,
        gid,
        additional_gids,
        home: if home.is_empty() { "/".to_string() } else { home },
    })
}

/// Container (uid, gid) for an `add --chown` spec.
pub fn lookup_owner(rootfs: &Path, spec: &str) -> StevedoreResult<(u32, u32)> {
    let user = lookup_user(rootfs, spec)?;
    Ok((user.uid, user.gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rootfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nwww:x:33:33:www:/var/www:/sbin/nologin\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("etc/group"),
            "root:x:0:\nwww:x:33:\nadm:x:4:www,root\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_root_by_default() {
        let root = rootfs();
        let user = lookup_user(root.path(), "").unwrap();
        assert_eq!((user.uid, user.gid), (0, 0));
        assert_eq!(user.home, "/root");
    }

    #[test]
    fn test_named_user_with_supplementary_groups() {
        let root = rootfs();
        let user = lookup_user(root.path(), "www").unwrap();
        assert_eq!((user.uid, user.gid), (33, 33));
        assert_eq!(user.additional_gids, vec![4]);
        assert_eq!(user.home, "/var/www");
    }

    #[test]
    fn test_explicit_group() {
        let root = rootfs();
        assert_eq!(lookup_owner(root.path(), "www:adm").unwrap(), (33, 4));
        assert_eq!(lookup_owner(root.path(), "1000:1000").unwrap(), (1000, 1000));
    }

    #[test]
    fn test_unknown_numeric_uid_and_missing_names() {
        let root = rootfs();
        let user = lookup_user(root.path(), "4242").unwrap();
        assert_eq!((user.uid, user.gid, user.home.as_str()), (4242, 0, "/"));
        assert!(lookup_user(root.path(), "nobody").is_err());
        assert!(lookup_owner(root.path(), "www:nogroup").is_err());
    }
}
