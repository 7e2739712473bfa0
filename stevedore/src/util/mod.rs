//! Small helpers shared across modules: logging setup, binary lookup,
//! terminal size, digests and filesystem utilities.

pub mod digest;
pub mod fs;
pub mod process;

use std::path::{Path, PathBuf};

use stevedore_shared::constants::env as env_vars;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber.
///
/// Logs go to stderr unless `log_dir` (or `$STEVEDORE_LOG_DIR`) names a
/// directory, in which case a daily-rotated `stevedore.log` is written there.
/// The returned guard flushes the background writer on drop and must be
/// kept alive for the life of the process.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"));
    let Ok(env_filter) = env_filter else {
        return None;
    };

    let dir = log_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(env_vars::LOG_DIR).map(PathBuf::from));

    match dir {
        Some(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(&dir, "stevedore.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            register_to_tracing(non_blocking, env_filter, false);
            Some(guard)
        }
        _ => {
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
            register_to_tracing(non_blocking, env_filter, true);
            Some(guard)
        }
    }
}

fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter, ansi: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(ansi),
        )
        .try_init();
}

/// Find a helper binary (runc, slirp4netns, ssh-agent, newuidmap...).
///
/// Absolute or relative paths containing a slash are checked as given;
/// bare names are looked up in `$PATH`.
pub fn find_binary(binary_name: &str) -> StevedoreResult<PathBuf> {
    if binary_name.contains('/') {
        let candidate = PathBuf::from(binary_name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
        return Err(StevedoreError::NotFound(format!(
            "Binary '{}' does not exist or is not executable",
            binary_name
        )));
    }

    let path = std::env::var_os("PATH").unwrap_or_default();
    let candidates: Vec<PathBuf> = std::env::split_paths(&path)
        .map(|dir| dir.join(binary_name))
        .collect();

    for candidate in &candidates {
        if is_executable(candidate) {
            tracing::debug!(binary = %candidate.display(), "Found binary");
            return Ok(candidate.clone());
        }
    }

    let locations = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(StevedoreError::NotFound(format!(
        "Binary '{}' not found.\nSearched locations:\n{}",
        binary_name, locations
    )))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Terminal size of the controlling terminal as (rows, cols), defaulting
/// to 24x80 when stdout is not a terminal.
pub fn get_terminal_size() -> (u16, u16) {
    if let Some((cols, rows)) = term_size::dimensions() {
        (rows as u16, cols as u16)
    } else {
        (24, 80)
    }
}

/// Whether the current process runs without real root privileges.
pub fn is_rootless() -> bool {
    nix::unistd::geteuid().as_raw() != 0
}

/// Generate a random 64-hex-digit identifier, the format used for
/// container and layer IDs.
pub fn random_id() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_binary_in_path() {
        let sh = find_binary("sh").unwrap();
        assert!(sh.is_absolute());
        assert!(sh.ends_with("sh"));
    }

    #[test]
    fn test_find_binary_missing() {
        let err = find_binary("definitely-not-a-real-binary-xyz").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_find_binary_explicit_path() {
        assert!(find_binary("/bin/sh").is_ok());
        assert!(find_binary("/nonexistent/bin/tool").is_err());
    }

    #[test]
    fn test_random_id_format() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
