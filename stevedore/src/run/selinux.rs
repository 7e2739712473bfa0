//! SELinux process and mount labels for working containers.

use std::path::Path;

use rand::Rng;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

const PROCESS_BASE: &str = "system_u:system_r:container_t";
const MOUNT_BASE: &str = "system_u:object_r:container_file_t";
const CATEGORY_RANGE: u32 = 1024;
const SELINUX_XATTR: &str = "security.selinux";

pub fn is_enabled() -> bool {
    Path::new("/sys/fs/selinux/enforce").exists()
}

/// Generate a `(process_label, mount_label)` pair sharing one MCS level.
///
/// `label_opts` accepts `disable`, `level:<mcs>`, `type:<process type>`,
/// `user:<user>` and `role:<role>`. Both labels are empty when SELinux is
/// off or labeling is disabled.
pub fn generate_labels(label_opts: &[String]) -> StevedoreResult<(String, String)> {
    if !is_enabled() {
        return Ok((String::new(), String::new()));
    }
    labels_for(label_opts)
}

fn labels_for(label_opts: &[String]) -> StevedoreResult<(String, String)> {
    let mut level = None;
    let mut process_type = None;
    let mut user = None;
    let mut role = None;
    for opt in label_opts {
        if opt == "disable" {
            return Ok((String::new(), String::new()));
        }
        let (key, value) = opt.split_once(':').ok_or_else(|| {
            StevedoreError::InvalidArgument(format!("bad SELinux label option {:?}", opt))
        })?;
        match key {
            "level" => level = Some(value.to_string()),
            "type" => process_type = Some(value.to_string()),
            "user" => user = Some(value.to_string()),
            "role" => role = Some(value.to_string()),
            "filetype" => {}
            other => {
                return Err(StevedoreError::InvalidArgument(format!(
                    "unknown SELinux label option {:?}",
                    other
                )));
            }
        }
    }

    let level = level.unwrap_or_else(random_level);
    let mut process: Vec<String> = PROCESS_BASE.split(':').map(str::to_string).collect();
    if let Some(user) = user {
        process[0] = user;
    }
    if let Some(role) = role {
        process[1] = role;
    }
    if let Some(process_type) = process_type {
        process[2] = process_type;
    }
    Ok((
        format!("{}:{}", process.join(":"), level),
        format!("{}:{}", MOUNT_BASE, level),
    ))
}

/// Label `path` and everything under it with `mount_label`. A shared
/// relabel drops the MCS categories so every container can read it.
pub fn relabel(path: &Path, mount_label: &str, shared: bool) -> StevedoreResult<()> {
    if mount_label.is_empty() || !is_enabled() {
        return Ok(());
    }
    let label = if shared { shared_label(mount_label) } else { mount_label.to_string() };
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            StevedoreError::Storage(format!("Failed to walk {}: {}", path.display(), e))
        })?;
        xattr::set(entry.path(), SELINUX_XATTR, label.as_bytes()).map_err(|e| {
            StevedoreError::io(format!("Failed to relabel {}", entry.path().display()), e)
        })?;
    }
    tracing::debug!(path = %path.display(), label = %label, "Relabeled");
    Ok(())
}

fn shared_label(mount_label: &str) -> String {
    let mut parts: Vec<&str> = mount_label.splitn(4, ':').collect();
    if parts.len() == 4 {
        parts[3] = "s0";
    }
    parts.join(":")
}

fn random_level() -> String {
    let mut rng = rand::rng();
    let a = rng.random_range(0..CATEGORY_RANGE);
    let mut b = rng.random_range(0..CATEGORY_RANGE);
    while b == a {
        b = rng.random_range(0..CATEGORY_RANGE);
    }
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    format!("s0:c{},c{}", low, high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_share_level() {
        let (process, mount) = labels_for(&[]).unwrap();
        let level = process.splitn(4, ':').nth(3).unwrap();
        assert!(mount.ends_with(level));
        assert!(process.starts_with("system_u:system_r:container_t:s0:c"));
    }

    #[test]
    fn test_label_options() {
        let opts = vec!["level:s0:c1,c2".to_string(), "type:spc_t".to_string()];
        let (process, mount) = labels_for(&opts).unwrap();
        assert_eq!(process, "system_u:system_r:spc_t:s0:c1,c2");
        assert_eq!(mount, "system_u:object_r:container_file_t:s0:c1,c2");

        assert_eq!(labels_for(&["disable".into()]).unwrap(), (String::new(), String::new()));
        assert!(labels_for(&["bogus".into()]).is_err());
    }

    #[test]
    fn test_shared_label_drops_categories() {
        assert_eq!(
            shared_label("system_u:object_r:container_file_t:s0:c1,c2"),
            "system_u:object_r:container_file_t:s0"
        );
    }
}
