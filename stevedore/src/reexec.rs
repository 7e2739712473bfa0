//! Single-binary re-exec trampoline.
//!
//! Entry points register themselves at compile time with
//! `inventory::submit!`. On startup, [`init`] compares `argv[0]` against
//! the registered names; a match runs the entry and exits the process with
//! its return code. No match returns `false` and `main` proceeds.
//!
//! The table is built once, on first use, and is never mutated afterwards.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

/// Entry function for a re-exec'd process. Returns the process exit code.
pub type EntryFn = fn() -> i32;

/// Registration submitted by modules that need a re-exec entry point.
pub struct Registration {
    pub name: &'static str,
    pub entry: EntryFn,
}

inventory::collect!(Registration);

static TABLE: OnceLock<HashMap<&'static str, EntryFn>> = OnceLock::new();

fn table() -> &'static HashMap<&'static str, EntryFn> {
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        for registration in inventory::iter::<Registration> {
            if table.insert(registration.name, registration.entry).is_some() {
                tracing::warn!(name = registration.name, "Duplicate re-exec registration");
            }
        }
        table
    })
}

/// Look up the entry registered for an `argv[0]` value. Both the exact
/// string and its final path component are tried.
pub fn lookup(argv0: &str) -> Option<EntryFn> {
    let table = table();
    if let Some(entry) = table.get(argv0) {
        return Some(*entry);
    }
    Path::new(argv0)
        .file_name()
        .and_then(OsStr::to_str)
        .and_then(|base| table.get(base).copied())
}

/// Whether `name` is a registered entry point.
pub fn is_registered(name: &str) -> bool {
    table().contains_key(name)
}

/// Names of all registered entry points.
pub fn registered_names() -> Vec<&'static str> {
    let mut names: Vec<_> = table().keys().copied().collect();
    names.sort_unstable();
    names
}

/// Probe `argv[0]` and dispatch.
///
/// Must be called first thing in `main`, before any threads or async
/// runtime exist. When `argv[0]` matches, the entry runs and the process
/// exits with its code; this function does not return in that case.
/// Otherwise returns `false`.
pub fn init() -> bool {
    let Some(argv0) = std::env::args_os().next() else {
        return false;
    };
    let Some(entry) = argv0.to_str().and_then(lookup) else {
        return false;
    };
    let code = entry();
    std::process::exit(code)
}

/// A command that re-executes the current binary with `argv[0]` set to
/// `name`, so that [`init`] dispatches to the registered entry.
pub fn command(name: &str) -> Command {
    let mut cmd = Command::new("/proc/self/exe");
    cmd.arg0(name);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> i32 {
        7
    }

    inventory::submit! {
        Registration { name: "stevedore-reexec-test-entry", entry: sample_entry }
    }

    #[test]
    fn test_registered_entry_is_found() {
        assert!(is_registered("stevedore-reexec-test-entry"));
        let entry = lookup("stevedore-reexec-test-entry").unwrap();
        assert_eq!(entry(), 7);
    }

    #[test]
    fn test_lookup_by_basename() {
        assert!(lookup("/some/dir/stevedore-reexec-test-entry").is_some());
    }

    #[test]
    fn test_unknown_name_not_dispatched() {
        assert!(lookup("stevedore").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn test_chroot_stages_registered() {
        let names = registered_names();
        assert!(names.contains(&crate::run::chroot::STAGE1_NAME));
        assert!(names.contains(&crate::run::chroot::STAGE2_NAME));
        assert!(names.contains(&crate::run::chroot::STAGE3_NAME));
    }

    #[test]
    fn test_command_sets_argv0() {
        let cmd = command("stevedore-reexec-test-entry");
        assert_eq!(cmd.get_program(), "/proc/self/exe");
    }
}
