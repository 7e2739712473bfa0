//! SSH agent sockets for `--mount=type=ssh`.
//!
//! A source is either an existing agent socket, forwarded as is, or a list
//! of private key files loaded into an `ssh-agent` started for this run.

use std::collections::BTreeMap;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::util::find_binary;

const AGENT_START_TIMEOUT: Duration = Duration::from_secs(5);
const AGENT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// An `ssh-agent` owned by one run.
#[derive(Debug)]
pub struct SshAgent {
    child: Child,
    socket: PathBuf,
    dir: PathBuf,
}

impl SshAgent {
    /// Start `ssh-agent -D` listening in `dir` and load `keys` into it.
    pub fn spawn(ssh_agent: &str, ssh_add: &str, keys: &[PathBuf], dir: &Path) -> StevedoreResult<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StevedoreError::io(format!("Failed to create {}", dir.display()), e))?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| StevedoreError::io(format!("Failed to chmod {}", dir.display()), e))?;
        let socket = dir.join("agent.sock");

        let agent_bin = find_binary(ssh_agent)?;
        let child = Command::new(&agent_bin)
            .arg("-D")
            .arg("-a")
            .arg(&socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| StevedoreError::io(format!("Failed to start {}", agent_bin.display()), e))?;
        let mut agent = SshAgent {
            child,
            socket,
            dir: dir.to_path_buf(),
        };

        let deadline = Instant::now() + AGENT_START_TIMEOUT;
        while !agent.socket.exists() {
            if let Ok(Some(status)) = agent.child.try_wait() {
                return Err(StevedoreError::Runtime {
                    runtime: ssh_agent.to_string(),
                    exit_code: status.code().unwrap_or(-1),
                    stderr: "agent exited before creating its socket".into(),
                });
            }
            if Instant::now() > deadline {
                let _ = agent.stop();
                return Err(StevedoreError::Resource(format!(
                    "ssh-agent did not create {} in time",
                    agent.socket.display()
                )));
            }
            std::thread::sleep(AGENT_POLL_INTERVAL);
        }

        let add_bin = find_binary(ssh_add)?;
        for key in keys {
            let output = Command::new(&add_bin)
                .arg(key)
                .env("SSH_AUTH_SOCK", &agent.socket)
                .env_remove("SSH_ASKPASS")
                .stdin(Stdio::null())
                .output()
                .map_err(|e| StevedoreError::io(format!("Failed to run {}", add_bin.display()), e))?;
            if !output.status.success() {
                let _ = agent.stop();
                return Err(StevedoreError::Runtime {
                    runtime: ssh_add.to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        }
        tracing::debug!(socket = %agent.socket.display(), keys = keys.len(), "Started ssh-agent");
        Ok(agent)
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn stop(&mut self) -> StevedoreResult<()> {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        self.child
            .wait()
            .map_err(|e| StevedoreError::io("Failed to reap ssh-agent", e))?;
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StevedoreError::io(format!("Failed to remove {}", self.dir.display()), e)),
        }
    }

    /// Stop the agent and remove its socket directory.
    pub fn shutdown(mut self) -> StevedoreResult<()> {
        self.stop()?;
        tracing::debug!(socket = %self.socket.display(), "Stopped ssh-agent");
        Ok(())
    }
}

impl Drop for SshAgent {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// A socket ready to bind into the container.
#[derive(Debug)]
pub enum AgentSocket {
    /// Someone else's agent, bound as is.
    Forwarded(PathBuf),
    /// An agent started for this run.
    Spawned(SshAgent),
}

impl AgentSocket {
    pub fn path(&self) -> &Path {
        match self {
            AgentSocket::Forwarded(path) => path,
            AgentSocket::Spawned(agent) => agent.socket(),
        }
    }
}

fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

/// Parse `id=path[,path…]` or `default` style `--ssh` values.
pub fn parse_ssh_sources<S: AsRef<str>>(specs: &[S]) -> StevedoreResult<BTreeMap<String, Vec<PathBuf>>> {
    let mut out: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for spec in specs {
        let spec = spec.as_ref();
        let (id, paths) = match spec.split_once('=') {
            Some((id, paths)) => (id, paths),
            None => (spec, ""),
        };
        if id.is_empty() {
            return Err(StevedoreError::InvalidArgument(format!("ssh source {:?} has no id", spec)));
        }
        out.entry(id.to_string())
            .or_default()
            .extend(paths.split(',').filter(|p| !p.is_empty()).map(PathBuf::from));
    }
    Ok(out)
}

/// Resolve the agent for mount `id`. `default` with no configured paths
/// falls back to `$SSH_AUTH_SOCK`. `Ok(None)` means nothing is available.
pub fn open_agent(
    id: &str,
    sources: &BTreeMap<String, Vec<PathBuf>>,
    ssh_agent: &str,
    ssh_add: &str,
    dir: &Path,
) -> StevedoreResult<Option<AgentSocket>> {
    let paths: Vec<PathBuf> = match sources.get(id) {
        Some(paths) if !paths.is_empty() => paths.clone(),
        Some(_) | None if id == "default" => match std::env::var_os("SSH_AUTH_SOCK") {
            Some(sock) if !sock.is_empty() => vec![PathBuf::from(sock)],
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };

    if paths.len() == 1 && is_socket(&paths[0]) {
        return Ok(Some(AgentSocket::Forwarded(paths[0].clone())));
    }
    if let Some(socket) = paths.iter().find(|p| is_socket(p)) {
        return Err(StevedoreError::InvalidArgument(format!(
            "ssh source {} mixes the socket {} with key files",
            id,
            socket.display()
        )));
    }
    for key in &paths {
        if !key.is_file() {
            return Err(StevedoreError::NotFound(format!("ssh key {}", key.display())));
        }
    }
    SshAgent::spawn(ssh_agent, ssh_add, &paths, dir).map(|a| Some(AgentSocket::Spawned(a)))
}
