//! UID/GID mapping between the host and a container's user namespace.

use std::path::Path;

use serde::{Deserialize, Serialize};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

/// One contiguous range: container IDs `[container_id, container_id+size)`
/// map to host IDs `[host_id, host_id+size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    fn container_to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        (offset < self.size).then(|| self.host_id + offset)
    }

    fn host_to_container(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.host_id)?;
        (offset < self.size).then(|| self.container_id + offset)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappings {
    #[serde(default)]
    pub uid_map: Vec<IdMap>,
    #[serde(default)]
    pub gid_map: Vec<IdMap>,
}

impl IdMappings {
    pub fn new(uid_map: Vec<IdMap>, gid_map: Vec<IdMap>) -> Self {
        Self { uid_map, gid_map }
    }

    pub fn is_empty(&self) -> bool {
        self.uid_map.is_empty() && self.gid_map.is_empty()
    }

    /// Translate a container (uid, gid) pair to host IDs. Empty maps are
    /// the identity.
    pub fn to_host(&self, uid: u32, gid: u32) -> StevedoreResult<(u32, u32)> {
        Ok((
            translate(&self.uid_map, uid, IdMap::container_to_host, "uid")?,
            translate(&self.gid_map, gid, IdMap::container_to_host, "gid")?,
        ))
    }

    /// Translate a host (uid, gid) pair to container IDs.
    pub fn to_container(&self, uid: u32, gid: u32) -> StevedoreResult<(u32, u32)> {
        Ok((
            translate(&self.uid_map, uid, IdMap::host_to_container, "uid")?,
            translate(&self.gid_map, gid, IdMap::host_to_container, "gid")?,
        ))
    }

    /// Host IDs that own the container's root user.
    pub fn root_pair(&self) -> (u32, u32) {
        self.to_host(0, 0).unwrap_or_else(|_| {
            (
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            )
        })
    }
}

fn translate(
    maps: &[IdMap],
    id: u32,
    f: fn(&IdMap, u32) -> Option<u32>,
    what: &str,
) -> StevedoreResult<u32> {
    if maps.is_empty() {
        return Ok(id);
    }
    maps.iter().find_map(|m| f(m, id)).ok_or_else(|| {
        StevedoreError::InvalidArgument(format!("{} {} is not mapped", what, id))
    })
}

/// Parse `container:host:size[,container:host:size...]`.
pub fn parse_id_map(spec: &str) -> StevedoreResult<Vec<IdMap>> {
    spec.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let fields: Vec<&str> = part.trim().split(':').collect();
            let [c, h, s] = fields.as_slice() else {
                return Err(StevedoreError::InvalidArgument(format!(
                    "invalid ID mapping {:?}, expected container:host:size",
                    part
                )));
            };
            let num = |v: &str| {
                v.parse::<u32>().map_err(|e| {
                    StevedoreError::InvalidArgument(format!(
                        "invalid ID mapping {:?}: {}",
                        part, e
                    ))
                })
            };
            Ok(IdMap::new(num(*c)?, num(*h)?, num(*s)?))
        })
        .collect()
}

/// Parse the kernel's `/proc/<pid>/uid_map` format
/// (`<inside> <outside> <count>` per line).
pub fn parse_proc_map(content: &str) -> Vec<IdMap> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace().map(|f| f.parse::<u64>().ok());
            let inside = fields.next()??;
            let outside = fields.next()??;
            let count = fields.next()??;
            Some(IdMap::new(
                inside as u32,
                outside as u32,
                count.min(u32::MAX as u64) as u32,
            ))
        })
        .collect()
}

/// Mappings of the current process, read from `/proc/self/{uid,gid}_map`.
pub fn current_process_mappings() -> StevedoreResult<IdMappings> {
    let read = |path: &str| {
        std::fs::read_to_string(path)
            .map(|c| parse_proc_map(&c))
            .map_err(|e| StevedoreError::io(format!("Failed to read {}", path), e))
    };
    Ok(IdMappings::new(
        read("/proc/self/uid_map")?,
        read("/proc/self/gid_map")?,
    ))
}

/// Subordinate ID ranges for `user` (name or numeric ID) from an
/// `/etc/subuid`-style file.
pub fn subordinate_ranges(file: &Path, user: &str, numeric_id: u32) -> Vec<(u32, u32)> {
    let Ok(content) = std::fs::read_to_string(file) else {
        return Vec::new();
    };
    let numeric = numeric_id.to_string();
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split(':');
            let owner = fields.next()?;
            if owner != user && owner != numeric {
                return None;
            }
            let start = fields.next()?.parse().ok()?;
            let count = fields.next()?.parse().ok()?;
            Some((start, count))
        })
        .collect()
}

/// Default rootless mappings: container root is the caller, and container
/// IDs from 1 upward use the caller's subordinate ranges.
pub fn rootless_default_mappings() -> IdMappings {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let user = nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string());

    let build = |own: u32, file: &str| {
        let mut maps = vec![IdMap::new(0, own, 1)];
        let mut next = 1u32;
        for (start, count) in subordinate_ranges(Path::new(file), &user, own) {
            maps.push(IdMap::new(next, start, count));
            next = next.saturating_add(count);
        }
        maps
    };

    IdMappings::new(build(uid, "/etc/subuid"), build(gid, "/etc/subgid"))
}

/// Render a map as the kernel's `uid_map` file content.
pub fn format_proc_map(maps: &[IdMap]) -> String {
    maps.iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_both_ways() {
        let maps = IdMappings::new(
            vec![IdMap::new(0, 1000, 1), IdMap::new(1, 100000, 65536)],
            vec![IdMap::new(0, 1000, 1), IdMap::new(1, 100000, 65536)],
        );
        assert_eq!(maps.to_host(0, 0).unwrap(), (1000, 1000));
        assert_eq!(maps.to_host(33, 33).unwrap(), (100032, 100032));
        assert_eq!(maps.to_container(100032, 1000).unwrap(), (33, 0));
        assert!(maps.to_host(70000, 0).is_err());
        assert_eq!(maps.root_pair(), (1000, 1000));
    }

    #[test]
    fn test_empty_mapping_is_identity() {
        let maps = IdMappings::default();
        assert_eq!(maps.to_host(5, 6).unwrap(), (5, 6));
        assert_eq!(maps.to_container(5, 6).unwrap(), (5, 6));
    }

    #[test]
    fn test_parse_id_map() {
        let maps = parse_id_map("0:1000:1,1:100000:65536").unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[1], IdMap::new(1, 100000, 65536));
        assert!(parse_id_map("0:1000").is_err());
        assert!(parse_id_map("a:b:c").is_err());
    }

    #[test]
    fn test_parse_proc_map() {
        let maps = parse_proc_map("         0          0 4294967295\n");
        assert_eq!(maps, vec![IdMap::new(0, 0, u32::MAX)]);
        assert_eq!(format_proc_map(&[IdMap::new(0, 1000, 1)]), "0 1000 1\n");
    }

    #[test]
    fn test_subordinate_ranges() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("subuid");
        std::fs::write(&file, "alice:100000:65536\nbob:200000:1000\n1001:300000:10\n").unwrap();
        assert_eq!(
            subordinate_ranges(&file, "alice", 1000),
            vec![(100000, 65536)]
        );
        assert_eq!(subordinate_ranges(&file, "carol", 1001), vec![(300000, 10)]);
        assert!(subordinate_ranges(&file, "dave", 5).is_empty());
    }

    #[test]
    fn test_current_process_mappings_readable() {
        let maps = current_process_mappings().unwrap();
        assert!(!maps.uid_map.is_empty());
    }
}
