use clap::Args;

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Name or ID of the working container
    pub container: String,
}

pub fn mount(args: MountArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut builder = global.builder(&args.container)?;
    let path = builder.mount()?;
    println!("{}", path.display());
    Ok(())
}

pub fn unmount(args: MountArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut builder = global.builder(&args.container)?;
    builder.unmount()?;
    println!("{}", builder.container_id());
    Ok(())
}
