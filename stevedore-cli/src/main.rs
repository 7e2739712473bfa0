mod cli;
mod commands;

use clap::Parser;
use stevedore::StevedoreError;

use crate::cli::{Cli, Commands};

fn main() {
    // Chroot isolation stages re-execute this binary; they never return.
    if stevedore::reexec::init() {
        return;
    }

    let cli = Cli::parse();
    let _log_guard = stevedore::util::init_logging(cli.global.log_dir.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        let code = e
            .downcast_ref::<StevedoreError>()
            .map(StevedoreError::exit_code)
            .unwrap_or(1);
        // A failed command already told the user what went wrong.
        if !matches!(e.downcast_ref::<StevedoreError>(), Some(StevedoreError::RunFailed { .. })) {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let global = &cli.global;
    match cli.command {
        Commands::From(args) => commands::from::execute(args, global).await,
        Commands::Run(args) => commands::run::execute(args, global),
        Commands::Config(args) => commands::config::execute(args, global),
        Commands::Add(args) => commands::copy::execute(args, global, true),
        Commands::Copy(args) => commands::copy::execute(args, global, false),
        Commands::Commit(args) => commands::commit::execute(args, global).await,
        Commands::Pull(args) => commands::pull::execute(args, global).await,
        Commands::Push(args) => commands::push::execute(args, global).await,
        Commands::Rm(args) => commands::rm::execute(args, global),
        Commands::Containers(args) => commands::containers::execute(args, global),
        Commands::Images(args) => commands::images::execute(args, global),
        Commands::Mount(args) => commands::mount::mount(args, global),
        Commands::Umount(args) => commands::mount::unmount(args, global),
    }
}
