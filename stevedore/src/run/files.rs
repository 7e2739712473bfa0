//! Per-run `/etc/hosts`, `/etc/resolv.conf`, `/etc/hostname` and
//! `/run/.containerenv`, written into the run directory and bound in.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use oci_spec::runtime::Mount;
use stevedore_shared::constants::package::ENGINE;
use stevedore_shared::constants::run::{HOST_CONTAINERS_INTERNAL, SLIRP_DNS};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

use crate::run::spec::mount;
use crate::util::fs::atomic_write;

pub const HOSTS: &str = "/etc/hosts";
pub const RESOLV_CONF: &str = "/etc/resolv.conf";
pub const HOSTNAME: &str = "/etc/hostname";
pub const CONTAINERENV: &str = "/run/.containerenv";

/// Gateway address slirp4netns gives the host.
const SLIRP_HOST_GATEWAY: &str = "10.0.2.2";
const FALLBACK_NAMESERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];

/// How the run reaches the network, as far as the generated files care.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkMode {
    /// Shares the host's network namespace.
    Host,
    /// Private namespace configured through CNI, or loopback only.
    Private,
    /// Private namespace behind slirp4netns.
    Slirp,
}

/// Everything the generated files are composed from.
#[derive(Clone, Debug)]
pub struct FileInputs<'a> {
    pub hosts_base: &'a Path,
    pub resolv_base: &'a Path,
    pub add_host: &'a [String],
    pub hostname: &'a str,
    pub network: NetworkMode,
    pub dns_servers: &'a [String],
    pub dns_search: &'a [String],
    pub dns_options: &'a [String],
    pub container_name: &'a str,
    pub container_id: &'a str,
    pub image: &'a str,
    pub image_id: &'a str,
    pub rootless: bool,
}

fn parse_add_host(entry: &str) -> StevedoreResult<(String, IpAddr)> {
    let (name, ip) = entry.split_once(':').ok_or_else(|| {
        StevedoreError::InvalidArgument(format!("add-host {:?} is not name:ip", entry))
    })?;
    let ip = if ip == "host-gateway" { "127.0.0.1" } else { ip };
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| StevedoreError::InvalidArgument(format!("add-host {:?} has a bad address", entry)))?;
    if name.is_empty() {
        return Err(StevedoreError::InvalidArgument(format!("add-host {:?} has no name", entry)));
    }
    Ok((name.to_string(), ip))
}

fn names_in(hosts: &str) -> impl Iterator<Item = &str> {
    hosts
        .lines()
        .map(|l| l.split('#').next().unwrap_or_default())
        .flat_map(|l| l.split_whitespace().skip(1))
}

/// Compose `/etc/hosts` from the base file's content.
pub fn hosts_content(base: &str, inputs: &FileInputs<'_>) -> StevedoreResult<String> {
    let mut out = String::new();
    for entry in inputs.add_host {
        let (name, ip) = parse_add_host(entry)?;
        out.push_str(&format!("{}\t{}\n", ip, name));
    }
    out.push_str(base);
    if !base.is_empty() && !base.ends_with('\n') {
        out.push('\n');
    }

    let gateway = match inputs.network {
        NetworkMode::Host => Some("127.0.0.1"),
        NetworkMode::Slirp => Some(SLIRP_HOST_GATEWAY),
        NetworkMode::Private => None,
    };
    if let Some(gateway) = gateway {
        if !names_in(&out).any(|n| n == HOST_CONTAINERS_INTERNAL) {
            out.push_str(&format!("{}\t{}\n", gateway, HOST_CONTAINERS_INTERNAL));
        }
    }
    if !inputs.hostname.is_empty() && !names_in(&out).any(|n| n == inputs.hostname) {
        out.push_str(&format!("127.0.0.1\t{}\n", inputs.hostname));
    }
    Ok(out)
}

fn is_loopback(server: &str) -> bool {
    server
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Compose `/etc/resolv.conf`. Explicit servers, search domains and
/// options replace the base file's. Loopback resolvers are unreachable
/// from a private network namespace and are dropped there.
pub fn resolv_content(base: &str, inputs: &FileInputs<'_>) -> String {
    let mut servers = Vec::new();
    let mut search = Vec::new();
    let mut options = Vec::new();
    for line in base.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => servers.extend(fields.next().map(str::to_string)),
            Some("search") | Some("domain") => search = fields.map(str::to_string).collect(),
            Some("options") => options.extend(fields.map(str::to_string)),
            _ => {}
        }
    }

    if !inputs.dns_servers.is_empty() {
        servers = inputs.dns_servers.to_vec();
    } else if inputs.network != NetworkMode::Host {
        servers.retain(|s| !is_loopback(s));
        if servers.is_empty() && inputs.network == NetworkMode::Private {
            servers = FALLBACK_NAMESERVERS.iter().map(|s| s.to_string()).collect();
        }
    }
    if inputs.network == NetworkMode::Slirp && !servers.iter().any(|s| s == SLIRP_DNS) {
        servers.insert(0, SLIRP_DNS.to_string());
    }
    if !inputs.dns_search.is_empty() {
        search = inputs.dns_search.iter().filter(|s| *s != ".").cloned().collect();
    }
    if !inputs.dns_options.is_empty() {
        options = inputs.dns_options.to_vec();
    }

    let mut out = String::new();
    if !search.is_empty() {
        out.push_str(&format!("search {}\n", search.join(" ")));
    }
    for server in &servers {
        out.push_str(&format!("nameserver {}\n", server));
    }
    if !options.is_empty() {
        out.push_str(&format!("options {}\n", options.join(" ")));
    }
    out
}

pub fn containerenv_content(inputs: &FileInputs<'_>) -> String {
    format!(
        "engine=\"{}\"\nname=\"{}\"\nid=\"{}\"\nimage=\"{}\"\nimageid=\"{}\"\nrootless={}\n",
        ENGINE,
        inputs.container_name,
        inputs.container_id,
        inputs.image,
        inputs.image_id,
        u8::from(inputs.rootless)
    )
}

fn read_base(path: &Path) -> StevedoreResult<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(StevedoreError::io(format!("Failed to read {}", path.display()), e)),
    }
}

/// Write the files into `dir` and return their mounts. `skip` reports
/// whether a destination is already taken.
pub fn generate(
    dir: &Path,
    inputs: &FileInputs<'_>,
    no_hosts: bool,
    skip: impl Fn(&Path) -> bool,
) -> StevedoreResult<Vec<Mount>> {
    let mut mounts = Vec::new();
    let mut emit = |dest: &str, name: &str, content: String, options: &[&str]| -> StevedoreResult<()> {
        let source: PathBuf = dir.join(name);
        atomic_write(&source, content.as_bytes())?;
        mounts.push(mount(dest, "bind", &source.to_string_lossy(), options)?);
        Ok(())
    };

    if !no_hosts && !skip(Path::new(HOSTS)) {
        let base = read_base(inputs.hosts_base)?;
        emit(HOSTS, "hosts", hosts_content(&base, inputs)?, &["rbind", "rprivate"])?;
    }
    if !skip(Path::new(RESOLV_CONF)) {
        let base = read_base(inputs.resolv_base)?;
        emit(RESOLV_CONF, "resolv.conf", resolv_content(&base, inputs), &["rbind", "rprivate"])?;
    }
    if !inputs.hostname.is_empty() && !skip(Path::new(HOSTNAME)) {
        emit(HOSTNAME, "hostname", format!("{}\n", inputs.hostname), &["rbind", "rprivate"])?;
    }
    if !skip(Path::new(CONTAINERENV)) {
        emit(CONTAINERENV, ".containerenv", containerenv_content(inputs), &["rbind", "rprivate", "ro"])?;
    }
    tracing::debug!(dir = %dir.display(), count = mounts.len(), "Generated run files");
    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(network: NetworkMode) -> FileInputs<'static> {
        FileInputs {
            hosts_base: Path::new("/nonexistent/hosts"),
            resolv_base: Path::new("/nonexistent/resolv.conf"),
            add_host: &[],
            hostname: "box",
            network,
            dns_servers: &[],
            dns_search: &[],
            dns_options: &[],
            container_name: "alpine-working-container",
            container_id: "abc123",
            image: "docker.io/library/alpine:latest",
            image_id: "deadbeef",
            rootless: false,
        }
    }

    #[test]
    fn test_hosts_entries() {
        let add = vec!["db:10.1.2.3".to_string()];
        let mut i = inputs(NetworkMode::Slirp);
        i.add_host = &add;
        let hosts = hosts_content("127.0.0.1 localhost\n", &i).unwrap();
        let lines: Vec<&str> = hosts.lines().collect();
        assert_eq!(lines[0], "10.1.2.3\tdb");
        assert!(lines.contains(&"10.0.2.2\thost.containers.internal"));
        assert!(lines.contains(&"127.0.0.1\tbox"));
    }

    #[test]
    fn test_hosts_does_not_duplicate_names() {
        let hosts = hosts_content("127.0.0.1 localhost box\n", &inputs(NetworkMode::Private)).unwrap();
        assert_eq!(hosts.matches("box").count(), 1);
        assert!(!hosts.contains(HOST_CONTAINERS_INTERNAL));
    }

    #[test]
    fn test_bad_add_host() {
        let add = vec!["nocolon".to_string()];
        let mut i = inputs(NetworkMode::Host);
        i.add_host = &add;
        assert!(hosts_content("", &i).is_err());
    }

    #[test]
    fn test_resolv_drops_loopback_in_private_network() {
        let base = "nameserver 127.0.0.53\nsearch lan\noptions edns0\n";
        let out = resolv_content(base, &inputs(NetworkMode::Private));
        assert_eq!(out, "search lan\nnameserver 8.8.8.8\nnameserver 8.8.4.4\noptions edns0\n");
        let host = resolv_content(base, &inputs(NetworkMode::Host));
        assert!(host.contains("nameserver 127.0.0.53"));
    }

    #[test]
    fn test_resolv_slirp_and_overrides() {
        let servers = vec!["1.1.1.1".to_string()];
        let search = vec![".".to_string()];
        let mut i = inputs(NetworkMode::Slirp);
        i.dns_servers = &servers;
        i.dns_search = &search;
        let out = resolv_content("nameserver 9.9.9.9\nsearch corp\n", &i);
        assert_eq!(out, "nameserver 10.0.2.3\nnameserver 1.1.1.1\n");
    }

    #[test]
    fn test_containerenv() {
        let env = containerenv_content(&inputs(NetworkMode::Host));
        assert!(env.starts_with("engine=\"stevedore-"));
        assert!(env.contains("id=\"abc123\"\n"));
        assert!(env.ends_with("rootless=0\n"));
    }

    #[test]
    fn test_generate_respects_taken_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let i = inputs(NetworkMode::Host);
        let mounts = generate(dir.path(), &i, false, |p| p == Path::new(RESOLV_CONF)).unwrap();
        let dests: Vec<_> = mounts.iter().map(|m| m.destination().clone()).collect();
        assert_eq!(
            dests,
            vec![PathBuf::from(HOSTS), PathBuf::from(HOSTNAME), PathBuf::from(CONTAINERENV)]
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("hostname")).unwrap(), "box\n");

        let mounts = generate(dir.path(), &i, true, |_| false).unwrap();
        assert!(mounts.iter().all(|m| m.destination() != Path::new(HOSTS)));
    }
}
