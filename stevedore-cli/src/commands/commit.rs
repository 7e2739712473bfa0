use clap::Args;
use stevedore::archive::Compression;
use stevedore::commit::{CommitOptions, parse_destination};
use stevedore::image::manifest::ManifestType;

#[derive(Args, Debug)]
pub struct CommitArgs {
    /// Name or ID of the working container
    pub container: String,

    /// Image name or transport-qualified destination
    pub image: String,

    /// Manifest format (oci, docker)
    #[arg(short, long, default_value = "oci")]
    pub format: ManifestType,

    /// Layer compression when writing outside local storage
    #[arg(long)]
    pub compression: Option<Compression>,

    /// Leave history out of the image config
    #[arg(long)]
    pub omit_history: bool,

    /// Fixed creation time, in seconds since the epoch
    #[arg(long)]
    pub timestamp: Option<i64>,

    /// Additional tag (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Flatten every layer into one
    #[arg(long)]
    pub squash: bool,

    /// Remove the working container afterwards
    #[arg(long)]
    pub rm: bool,
}

pub async fn execute(args: CommitArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut builder = global.builder(&args.container)?;
    let destination = parse_destination(&args.image)?;
    let history_timestamp = match args.timestamp {
        Some(secs) => Some(
            chrono::DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| anyhow::anyhow!("timestamp {} is out of range", secs))?,
        ),
        None => None,
    };
    let options = CommitOptions {
        manifest_type: args.format,
        compression: args.compression.unwrap_or_default(),
        omit_history: args.omit_history,
        history_timestamp,
        squash: args.squash,
        additional_tags: args.tags,
        ..CommitOptions::default()
    };
    let result = builder.commit(&destination, &options).await?;
    if args.rm {
        builder.delete()?;
    }
    println!("{}", result.image_id);
    Ok(())
}
