use clap::Args;
use stevedore::builder::{IdMappingOptions, NamespaceOption, NamespaceOptions};
use stevedore::{Builder, BuilderOptions, CommonBuildOptions, Isolation, PullPolicy};

#[derive(Args, Debug)]
pub struct FromArgs {
    /// Base image, or `scratch`
    pub image: String,

    /// Name for the working container
    #[arg(long)]
    pub name: Option<String>,

    /// When to pull the base image (missing, always, never)
    #[arg(long, default_value = "missing")]
    pub pull: PullPolicy,

    /// Isolation used by later runs (oci, chroot)
    #[arg(long)]
    pub isolation: Option<Isolation>,

    /// Namespace setting, `kind=host|private|/path` (repeatable)
    #[arg(long = "ns")]
    pub namespaces: Vec<String>,

    /// Container-to-host UID mapping, `container:host:size[,…]`
    #[arg(long)]
    pub userns_uid_map: Option<String>,

    /// Container-to-host GID mapping, `container:host:size[,…]`
    #[arg(long)]
    pub userns_gid_map: Option<String>,

    /// Network to join on runs (repeatable)
    #[arg(long = "network")]
    pub networks: Vec<String>,

    /// Bind volume applied to every run, `host:container[:options]`
    #[arg(short, long = "volume")]
    pub volumes: Vec<String>,

    /// Default ulimit for runs, `NAME=soft[:hard]`
    #[arg(long = "ulimit")]
    pub ulimits: Vec<String>,

    /// Size of /dev/shm
    #[arg(long)]
    pub shm_size: Option<String>,

    /// Seccomp profile path, or `unconfined`
    #[arg(long)]
    pub seccomp_profile: Option<String>,
}

pub async fn execute(args: FromArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let context = global.context()?;
    let store = global.store(&context)?;

    let namespace_options = NamespaceOptions(
        args.namespaces
            .iter()
            .map(|spec| NamespaceOption::parse(spec))
            .collect::<Result<Vec<_>, _>>()?,
    );
    let options = BuilderOptions {
        from: args.image,
        pull_policy: args.pull,
        container_name: args.name,
        isolation: args.isolation,
        namespace_options,
        id_mapping_options: IdMappingOptions::from_specs(
            args.userns_uid_map.as_deref(),
            args.userns_gid_map.as_deref(),
        )?,
        common: CommonBuildOptions {
            volumes: args.volumes,
            ulimit: args.ulimits,
            shm_size: args.shm_size,
            seccomp_profile_path: args.seccomp_profile,
            ..CommonBuildOptions::default()
        },
        networks: args.networks,
        ..BuilderOptions::default()
    };
    let builder = Builder::new(&context, store, options).await?;
    println!("{}", builder.container_name());
    Ok(())
}
