use clap::Args;
use stevedore::ImageReference;
use stevedore::image::copy::{CopyOptions, copy_image};
use stevedore::image::manifest::ManifestType;
use stevedore::image::policy::Policy;
use stevedore::image::pull::find_local_image;
use stevedore::image::transports::{open_destination, open_source};

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Local image name or ID
    pub image: String,

    /// Transport-qualified destination, e.g. `oci:/tmp/out:latest`
    pub destination: String,

    /// Manifest format written to the destination (oci, docker)
    #[arg(short, long)]
    pub format: Option<ManifestType>,

    /// Write the image's digest to this file
    #[arg(long)]
    pub digestfile: Option<std::path::PathBuf>,
}

pub async fn execute(args: PushArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let context = global.context()?;
    let store = global.store(&context)?;
    let image = find_local_image(store.as_ref(), &args.image)?;

    let source_ref = ImageReference::storage(&image.id)?;
    let destination = ImageReference::parse(&args.destination)?;
    let source = open_source(&source_ref, &context, &store)?;
    let target = open_destination(&destination, &context, &store)?;
    let policy = Policy::from_file(&context.policy_path())?;
    let report = copy_image(
        &policy,
        source.as_ref(),
        target.as_ref(),
        &CopyOptions {
            manifest_type: args.format,
            scratch: Some(store.tmp_dir()),
            ..CopyOptions::default()
        },
    )
    .await?;

    if let Some(path) = &args.digestfile {
        std::fs::write(path, &report.manifest_digest)?;
    }
    println!("{}", report.manifest_digest);
    Ok(())
}
