use clap::Args;
use stevedore::PullPolicy;
use stevedore::image::pull::{PullOptions, Puller};

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image reference, optionally transport-qualified
    pub image: String,

    /// When to contact the source (missing, always, never)
    #[arg(long, default_value = "always")]
    pub policy: PullPolicy,

    /// Pull every instance of a manifest list
    #[arg(long)]
    pub all_platforms: bool,
}

pub async fn execute(args: PullArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let context = global.context()?;
    let store = global.store(&context)?;
    let puller = Puller::new(context, store);
    let pulled = puller
        .pull(
            &args.image,
            &PullOptions {
                policy: args.policy,
                all_instances: args.all_platforms,
                ..PullOptions::default()
            },
        )
        .await?;
    println!("{}", pulled.image.id);
    Ok(())
}
