//! Network setup for a run's private network namespace.
//!
//! The hook is called once the container process exists. [`CniNetwork`]
//! drives CNI plugins from `*.conflist` files; rootless runs use
//! [`SlirpNetwork`](crate::run::slirp::SlirpNetwork) instead.

use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;
use serde_json::{Map, Value};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::run::spec::NetworkAttachment;

/// Undo for a completed network setup.
pub type Teardown = Box<dyn FnOnce() -> StevedoreResult<()> + Send>;

pub trait NetworkHook: Send + Sync + std::fmt::Debug {
    /// Attach the network namespace of `pid` to `attachments`.
    fn setup(&self, container_id: &str, pid: u32, attachments: &[NetworkAttachment]) -> StevedoreResult<Teardown>;
}

/// Open `/proc/<pid>/ns/net` so the namespace outlives the process.
pub fn hold_netns(pid: u32) -> StevedoreResult<File> {
    let path = format!("/proc/{}/ns/net", pid);
    File::open(&path).map_err(|e| StevedoreError::io(format!("Failed to open {}", path), e))
}

/// A parsed `.conflist`.
#[derive(Clone, Debug, Deserialize)]
pub struct NetworkConfigList {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub plugins: Vec<Map<String, Value>>,
}

impl NetworkConfigList {
    pub fn from_slice(data: &[u8], origin: &Path) -> StevedoreResult<Self> {
        let list: Self = serde_json::from_slice(data)
            .map_err(|e| StevedoreError::Config(format!("{}: {}", origin.display(), e)))?;
        if list.plugins.is_empty() {
            return Err(StevedoreError::Config(format!("{}: no plugins", origin.display())));
        }
        for plugin in &list.plugins {
            if !plugin.get("type").is_some_and(Value::is_string) {
                return Err(StevedoreError::Config(format!(
                    "{}: plugin without a type",
                    origin.display()
                )));
            }
        }
        Ok(list)
    }

    /// Stdin for one plugin invocation.
    fn plugin_config(&self, index: usize, prev_result: Option<&Value>) -> Value {
        let mut conf = self.plugins[index].clone();
        conf.insert("cniVersion".into(), Value::String(self.cni_version.clone()));
        conf.insert("name".into(), Value::String(self.name.clone()));
        if let Some(prev) = prev_result {
            conf.insert("prevResult".into(), prev.clone());
        }
        Value::Object(conf)
    }

    fn plugin_type(&self, index: usize) -> &str {
        self.plugins[index]
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Error object a CNI plugin prints on failure.
#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CniCommand {
    Add,
    Del,
}

impl CniCommand {
    fn as_str(self) -> &'static str {
        match self {
            CniCommand::Add => "ADD",
            CniCommand::Del => "DEL",
        }
    }
}

/// Network setup through CNI plugins.
#[derive(Clone, Debug)]
pub struct CniNetwork {
    config_dir: PathBuf,
    plugin_dirs: Vec<PathBuf>,
}

/// One attachment whose plugin chain ran to completion.
struct Attached {
    list: NetworkConfigList,
    interface: String,
    result: Option<Value>,
}

impl CniNetwork {
    pub fn new(config_dir: impl Into<PathBuf>, plugin_dirs: Vec<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            plugin_dirs,
        }
    }

    /// All conflists in the config directory, sorted by file name.
    pub fn config_lists(&self) -> StevedoreResult<Vec<NetworkConfigList>> {
        let entries = match std::fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StevedoreError::io(
                    format!("Failed to read {}", self.config_dir.display()),
                    e,
                ));
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "conflist"))
            .collect();
        paths.sort();
        paths
            .iter()
            .map(|p| {
                let data = std::fs::read(p)
                    .map_err(|e| StevedoreError::io(format!("Failed to read {}", p.display()), e))?;
                NetworkConfigList::from_slice(&data, p)
            })
            .collect()
    }

    /// The list for `name`; the empty name picks the first one.
    pub fn find(&self, name: &str) -> StevedoreResult<NetworkConfigList> {
        let lists = self.config_lists()?;
        let found = if name.is_empty() {
            lists.into_iter().next()
        } else {
            lists.into_iter().find(|l| l.name == name)
        };
        found.ok_or_else(|| {
            StevedoreError::NotFound(format!(
                "CNI network {:?} in {}",
                if name.is_empty() { "default" } else { name },
                self.config_dir.display()
            ))
        })
    }

    fn plugin_path(&self, typ: &str) -> StevedoreResult<PathBuf> {
        self.plugin_dirs
            .iter()
            .map(|d| d.join(typ))
            .find(|p| p.is_file())
            .ok_or_else(|| StevedoreError::NotFound(format!("CNI plugin {:?}", typ)))
    }

    fn invoke(
        &self,
        command: CniCommand,
        list: &NetworkConfigList,
        index: usize,
        prev_result: Option<&Value>,
        container_id: &str,
        netns: &str,
        interface: &str,
    ) -> StevedoreResult<Option<Value>> {
        let typ = list.plugin_type(index);
        let binary = self.plugin_path(typ)?;
        let stdin = serde_json::to_vec(&list.plugin_config(index, prev_result))?;
        let cni_path = std::env::join_paths(&self.plugin_dirs)
            .map_err(|e| StevedoreError::Config(format!("bad CNI plugin path: {}", e)))?;

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command.as_str())
            .env("CNI_CONTAINERID", container_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", interface)
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StevedoreError::io(format!("Failed to run {}", binary.display()), e))?;
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(&stdin)
                .map_err(|e| StevedoreError::io(format!("Failed to write to {}", typ), e))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| StevedoreError::io(format!("Failed to wait for {}", typ), e))?;

        if !output.status.success() {
            let message = match serde_json::from_slice::<PluginError>(&output.stdout) {
                Ok(err) if !err.details.is_empty() => format!("{} (code {}): {}", err.msg, err.code, err.details),
                Ok(err) => format!("{} (code {})", err.msg, err.code),
                Err(_) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            return Err(StevedoreError::Runtime {
                runtime: format!("CNI plugin {} {}", typ, command.as_str()),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: message,
            });
        }
        tracing::debug!(plugin = typ, command = command.as_str(), interface, "CNI plugin succeeded");
        if command == CniCommand::Del || output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&output.stdout).map(Some).map_err(|e| {
            StevedoreError::Serialization(format!("CNI plugin {} printed a bad result: {}", typ, e))
        })
    }

    fn add(&self, list: &NetworkConfigList, container_id: &str, netns: &str, interface: &str) -> StevedoreResult<Option<Value>> {
        let mut result = None;
        for index in 0..list.plugins.len() {
            result = self.invoke(CniCommand::Add, list, index, result.as_ref(), container_id, netns, interface)?;
        }
        Ok(result)
    }

    fn del(&self, attached: &Attached, container_id: &str, netns: &str) -> StevedoreResult<()> {
        let mut errors = Vec::new();
        for index in (0..attached.list.plugins.len()).rev() {
            if let Err(e) = self.invoke(
                CniCommand::Del,
                &attached.list,
                index,
                attached.result.as_ref(),
                container_id,
                netns,
                &attached.interface,
            ) {
                tracing::warn!(network = %attached.list.name, error = %e, "CNI DEL failed");
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(StevedoreError::Multiple(errors)),
        }
    }

    fn teardown_all(&self, attached: &[Attached], container_id: &str, netns: &str) -> StevedoreResult<()> {
        let mut errors = Vec::new();
        for a in attached.iter().rev() {
            if let Err(e) = self.del(a, container_id, netns) {
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(StevedoreError::Multiple(errors)),
        }
    }
}

impl NetworkHook for CniNetwork {
    fn setup(&self, container_id: &str, pid: u32, attachments: &[NetworkAttachment]) -> StevedoreResult<Teardown> {
        let netns_file = hold_netns(pid)?;
        let netns = format!("/proc/{}/fd/{}", std::process::id(), netns_file.as_raw_fd());

        let mut attached: Vec<Attached> = Vec::new();
        for attachment in attachments {
            let step = self
                .find(&attachment.network)
                .and_then(|list| {
                    let result = self.add(&list, container_id, &netns, &attachment.interface);
                    match result {
                        Ok(result) => Ok(Attached {
                            list,
                            interface: attachment.interface.clone(),
                            result,
                        }),
                        Err(e) => {
                            let partial = Attached {
                                list,
                                interface: attachment.interface.clone(),
                                result: None,
                            };
                            let _ = self.del(&partial, container_id, &netns);
                            Err(e)
                        }
                    }
                });
            match step {
                Ok(a) => {
                    tracing::info!(network = %a.list.name, interface = %a.interface, pid, "Attached network");
                    attached.push(a);
                }
                Err(e) => {
                    let _ = self.teardown_all(&attached, container_id, &netns);
                    return Err(e);
                }
            }
        }

        let hook = self.clone();
        let container_id = container_id.to_string();
        Ok(Box::new(move || {
            let result = hook.teardown_all(&attached, &container_id, &netns);
            drop(netns_file);
            result
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const BRIDGE: &str = r#"{
        "cniVersion": "1.0.0",
        "name": "podman",
        "plugins": [
            {"type": "recorder", "bridge": "cni0"},
            {"type": "recorder", "capabilities": {"portMappings": true}}
        ]
    }"#;

    /// A fake plugin that appends its command and stdin to a log and
    /// prints a fixed result.
    fn install_recorder(dir: &Path, log: &Path) {
        let script = format!(
            "#!/bin/sh\necho \"$CNI_COMMAND $CNI_IFNAME $(cat)\" >> {}\necho '{{\"cniVersion\":\"1.0.0\",\"interfaces\":[]}}'\n",
            log.display()
        );
        let path = dir.join("recorder");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_find_lists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("10-podman.conflist"), BRIDGE).unwrap();
        std::fs::write(
            dir.path().join("20-other.conflist"),
            BRIDGE.replace("podman", "other"),
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.conf"), "{}").unwrap();
        let cni = CniNetwork::new(dir.path(), vec![]);
        assert_eq!(cni.config_lists().unwrap().len(), 2);
        assert_eq!(cni.find("").unwrap().name, "podman");
        assert_eq!(cni.find("other").unwrap().name, "other");
        assert!(matches!(cni.find("missing"), Err(StevedoreError::NotFound(_))));
    }

    #[test]
    fn test_bad_list() {
        let path = Path::new("x.conflist");
        assert!(NetworkConfigList::from_slice(br#"{"cniVersion":"1.0.0","name":"n","plugins":[]}"#, path).is_err());
        assert!(NetworkConfigList::from_slice(br#"{"cniVersion":"1.0.0","name":"n","plugins":[{}]}"#, path).is_err());
    }

    #[test]
    fn test_plugin_config_chains_prev_result() {
        let list = NetworkConfigList::from_slice(BRIDGE.as_bytes(), Path::new("x")).unwrap();
        let prev = serde_json::json!({"ips": []});
        let conf = list.plugin_config(1, Some(&prev));
        assert_eq!(conf["name"], "podman");
        assert_eq!(conf["cniVersion"], "1.0.0");
        assert_eq!(conf["prevResult"], prev);
        assert!(list.plugin_config(0, None).get("prevResult").is_none());
    }

    #[test]
    fn test_setup_runs_add_then_del_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("net.d");
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&conf).unwrap();
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(conf.join("10-podman.conflist"), BRIDGE).unwrap();
        let log = dir.path().join("log");
        install_recorder(&bin, &log);

        let cni = CniNetwork::new(&conf, vec![bin]);
        let attachments = vec![NetworkAttachment {
            network: String::new(),
            interface: "eth0".into(),
        }];
        let teardown = cni.setup("abc", std::process::id(), &attachments).unwrap();
        teardown().unwrap();

        let log = std::fs::read_to_string(&log).unwrap();
        let commands: Vec<&str> = log.lines().map(|l| l.split(' ').next().unwrap()).collect();
        assert_eq!(commands, vec!["ADD", "ADD", "DEL", "DEL"]);
        let lines: Vec<&str> = log.lines().collect();
        assert!(lines[1].contains("prevResult"));
        assert!(lines[2].contains("portMappings"));
        assert!(lines[3].contains("cni0"));
    }
}
