use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use stevedore::{Builder, Isolation, LocalStore, Store, SystemContext};

use crate::commands;

#[derive(Parser, Debug)]
#[command(name = "stevedore", version, about = "Build OCI images without a daemon")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Storage root directory
    #[arg(long, global = true, env = "STEVEDORE_ROOT")]
    pub root: Option<PathBuf>,

    /// Volatile state directory
    #[arg(long, global = true, env = "STEVEDORE_RUNROOT")]
    pub runroot: Option<PathBuf>,

    /// Default isolation for new working containers (oci, chroot)
    #[arg(long, global = true, env = "STEVEDORE_ISOLATION")]
    pub isolation: Option<Isolation>,

    /// Signature policy file
    #[arg(long, global = true)]
    pub signature_policy: Option<PathBuf>,

    /// Write logs to this directory instead of stderr
    #[arg(long, global = true, env = "STEVEDORE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl GlobalFlags {
    pub fn context(&self) -> anyhow::Result<SystemContext> {
        let mut context = SystemContext::load()?;
        if let Some(root) = &self.root {
            context.root = root.clone();
        }
        if let Some(run_root) = &self.runroot {
            context.run_root = run_root.clone();
        }
        if let Some(isolation) = self.isolation {
            context.isolation = isolation;
        }
        if let Some(policy) = &self.signature_policy {
            context = context.with_signature_policy(policy.clone());
        }
        Ok(context)
    }

    pub fn store(&self, context: &SystemContext) -> anyhow::Result<Arc<dyn Store>> {
        Ok(Arc::new(LocalStore::open(context.layout())?))
    }

    /// Open the working container `name`.
    pub fn builder(&self, name: &str) -> anyhow::Result<Builder> {
        let context = self.context()?;
        let store = self.store(&context)?;
        Ok(Builder::open(&context, store, name)?)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a working container from an image
    From(commands::from::FromArgs),
    /// Run a command inside a working container
    Run(commands::run::RunArgs),
    /// Update a working container's image configuration
    Config(commands::config::ConfigArgs),
    /// Copy content into a working container, unpacking archives
    Add(commands::copy::CopyArgs),
    /// Copy content into a working container verbatim
    Copy(commands::copy::CopyArgs),
    /// Write a working container out as an image
    Commit(commands::commit::CommitArgs),
    /// Copy an image into local storage
    Pull(commands::pull::PullArgs),
    /// Copy a local image to another location
    Push(commands::push::PushArgs),
    /// Remove working containers
    Rm(commands::rm::RmArgs),
    /// List working containers
    Containers(commands::containers::ContainersArgs),
    /// List local images
    Images(commands::images::ImagesArgs),
    /// Mount a working container's root filesystem
    Mount(commands::mount::MountArgs),
    /// Unmount a working container's root filesystem
    Umount(commands::mount::MountArgs),
}
