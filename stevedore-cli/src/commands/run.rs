use std::path::PathBuf;

use clap::Args;
use stevedore::builder::{NamespaceOption, NamespaceOptions};
use stevedore::run::secrets::parse_secrets;
use stevedore::run::spec::NetworkPolicy;
use stevedore::run::ssh::parse_ssh_sources;
use stevedore::{Isolation, RunOptions, TerminalPolicy};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Name or ID of the working container
    pub container: String,

    /// Command and its arguments
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Allocate a terminal
    #[arg(short = 't', long, conflicts_with = "no_tty")]
    pub tty: bool,

    /// Never allocate a terminal
    #[arg(long)]
    pub no_tty: bool,

    #[arg(long)]
    pub hostname: Option<String>,

    /// `user[:group]` to run as
    #[arg(short, long)]
    pub user: Option<String>,

    #[arg(long)]
    pub workingdir: Option<String>,

    /// Environment entry, `KEY=VALUE` (repeatable)
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Bind volume, `host:container[:options]` (repeatable)
    #[arg(short, long = "volume")]
    pub volumes: Vec<String>,

    /// Build mount, e.g. `type=cache,target=/root/.cache` (repeatable)
    #[arg(long = "mount")]
    pub mounts: Vec<String>,

    /// Secret, `id=env:NAME` or `id=file:/path` (repeatable)
    #[arg(long = "secret")]
    pub secrets: Vec<String>,

    /// SSH agent source, `default` or `id=path[,path]` (repeatable)
    #[arg(long = "ssh")]
    pub ssh: Vec<String>,

    /// Directory relative bind sources are resolved against
    #[arg(long)]
    pub context_dir: Option<PathBuf>,

    /// Isolation for this run (oci, chroot)
    #[arg(long)]
    pub isolation: Option<Isolation>,

    /// OCI runtime binary
    #[arg(long)]
    pub runtime: Option<String>,

    /// Global flag passed to the OCI runtime (repeatable)
    #[arg(long = "runtime-flag")]
    pub runtime_flags: Vec<String>,

    #[arg(long)]
    pub no_pivot: bool,

    #[arg(long)]
    pub no_new_keyring: bool,

    /// Namespace setting, `kind=host|private|/path` (repeatable)
    #[arg(long = "ns")]
    pub namespaces: Vec<String>,

    /// Network to join (repeatable)
    #[arg(long = "network")]
    pub networks: Vec<String>,

    /// Keep a new network namespace to loopback only
    #[arg(long)]
    pub no_network_setup: bool,

    #[arg(long = "cap-add")]
    pub cap_add: Vec<String>,

    #[arg(long = "cap-drop")]
    pub cap_drop: Vec<String>,

    /// `NAME=soft[:hard]` (repeatable)
    #[arg(long = "ulimit")]
    pub ulimits: Vec<String>,

    /// Seccomp profile path, or `unconfined`
    #[arg(long)]
    pub seccomp_profile: Option<String>,

    /// Do not generate /etc/hosts
    #[arg(long)]
    pub no_hosts: bool,

    /// Extra hosts entry, `name:ip` (repeatable)
    #[arg(long = "add-host")]
    pub add_host: Vec<String>,

    #[arg(long = "dns")]
    pub dns: Vec<String>,

    #[arg(long = "dns-search")]
    pub dns_search: Vec<String>,

    #[arg(long = "dns-option")]
    pub dns_option: Vec<String>,
}

impl RunArgs {
    fn terminal(&self) -> TerminalPolicy {
        if self.tty {
            TerminalPolicy::Enabled
        } else if self.no_tty {
            TerminalPolicy::Disabled
        } else {
            TerminalPolicy::Default
        }
    }

    fn into_options(self) -> anyhow::Result<(String, Vec<String>, RunOptions)> {
        let terminal = self.terminal();
        let namespace_options = NamespaceOptions(
            self.namespaces
                .iter()
                .map(|spec| NamespaceOption::parse(spec))
                .collect::<Result<Vec<_>, _>>()?,
        );
        let options = RunOptions {
            terminal,
            hostname: self.hostname,
            user: self.user,
            workdir: self.workingdir,
            env: self.env,
            no_hosts: self.no_hosts,
            add_host: self.add_host,
            dns_servers: self.dns,
            dns_search: self.dns_search,
            dns_options: self.dns_option,
            no_pivot: self.no_pivot,
            no_new_keyring: self.no_new_keyring,
            runtime: self.runtime,
            runtime_args: self.runtime_flags,
            isolation: self.isolation,
            volumes: self.volumes,
            run_mounts: self.mounts,
            context_dir: self.context_dir,
            secrets: parse_secrets(&self.secrets)?,
            ssh_sources: parse_ssh_sources(&self.ssh)?,
            networks: self.networks,
            network_policy: if self.no_network_setup {
                NetworkPolicy::Disabled
            } else {
                NetworkPolicy::Default
            },
            namespace_options,
            add_capabilities: self.cap_add,
            drop_capabilities: self.cap_drop,
            ulimits: self.ulimits,
            seccomp_profile: self.seccomp_profile,
            ..RunOptions::default()
        };
        Ok((self.container, self.command, options))
    }
}

pub fn execute(args: RunArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let (container, command, options) = args.into_options()?;
    let mut builder = global.builder(&container)?;
    builder.run(&command, options)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    #[test]
    fn test_run_args_to_options() {
        let harness = Harness::try_parse_from([
            "run",
            "--isolation",
            "chroot",
            "-e",
            "A=1",
            "--secret",
            "token=env:TOKEN",
            "--ns",
            "net=host",
            "--no-tty",
            "work",
            "sh",
            "-c",
            "exit 3",
        ])
        .unwrap();
        let (container, command, options) = harness.run.into_options().unwrap();
        assert_eq!(container, "work");
        assert_eq!(command, vec!["sh", "-c", "exit 3"]);
        assert_eq!(options.isolation, Some(Isolation::Chroot));
        assert_eq!(options.terminal, TerminalPolicy::Disabled);
        assert_eq!(options.env, vec!["A=1"]);
        assert!(options.secrets.contains_key("token"));
        assert_eq!(options.namespace_options.0.len(), 1);
    }

    #[test]
    fn test_bad_secret_rejected() {
        let harness = Harness::try_parse_from(["run", "--secret", "nope", "work", "true"]).unwrap();
        assert!(harness.run.into_options().is_err());
    }
}
