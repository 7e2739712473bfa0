#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

/// Image used by tests that run commands (pulled once per test binary).
pub const TEST_IMAGE: &str = stevedore_test_utils::TEST_IMAGE;

// Tests sharing the image root must not race on the store.
static TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static SHARED_ROOT: OnceLock<TempDir> = OnceLock::new();

pub struct TestContext {
    pub cmd: Command,
    pub root: PathBuf,
    _dir: Option<TempDir>,
    _guard: Option<MutexGuard<'static, ()>>,
}

fn write_policy(dir: &Path) -> PathBuf {
    let policy = dir.join("policy.json");
    std::fs::write(&policy, r#"{"default": [{"type": "insecureAcceptAnything"}]}"#)
        .expect("Failed to write policy");
    policy
}

fn command_for(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_stevedore"));
    cmd.timeout(Duration::from_secs(120));
    cmd.arg("--root")
        .arg(root.join("storage"))
        .arg("--runroot")
        .arg(root.join("run"))
        .arg("--signature-policy")
        .arg(root.join("policy.json"));
    cmd.env_remove("STEVEDORE_ISOLATION");
    cmd
}

impl TestContext {
    pub fn new_cmd(&self) -> Command {
        command_for(&self.root)
    }

    /// Run `args` and return trimmed stdout, failing the test on error.
    pub fn output(&self, args: &[&str]) -> String {
        let out = self.new_cmd().args(args).assert().success().get_output().stdout.clone();
        String::from_utf8_lossy(&out).trim().to_string()
    }

    pub fn cleanup_all(&self) {
        let _ = self.new_cmd().args(["rm", "--all"]).ok();
    }
}

/// A context with its own empty store.
pub fn stevedore() -> TestContext {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let root = dir.path().to_path_buf();
    write_policy(&root);
    TestContext {
        cmd: command_for(&root),
        root,
        _dir: Some(dir),
        _guard: None,
    }
}

/// A context sharing one store that already holds [`TEST_IMAGE`].
pub fn with_image() -> TestContext {
    let lock = TEST_LOCK.get_or_init(|| Mutex::new(()));
    let guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    let shared = SHARED_ROOT.get_or_init(|| {
        let dir = TempDir::new().expect("Failed to create temp dir");
        write_policy(dir.path());
        eprintln!("Pulling {}...", TEST_IMAGE);
        let status = command_for(dir.path())
            .args(["pull", "--policy", "missing", TEST_IMAGE])
            .ok();
        if status.is_err() {
            eprintln!("  pull failed, tests will pull on demand");
        }
        dir
    });

    let root = shared.path().to_path_buf();
    TestContext {
        cmd: command_for(&root),
        root,
        _dir: None,
        _guard: Some(guard),
    }
}
