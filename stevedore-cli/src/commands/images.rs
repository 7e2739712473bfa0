use clap::Args;
use comfy_table::{Table, presets::NOTHING};

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Print only image IDs
    #[arg(short, long)]
    pub quiet: bool,
}

pub fn execute(args: ImagesArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let context = global.context()?;
    let store = global.store(&context)?;
    let mut images = store.images()?;
    images.sort_by(|a, b| b.created.cmp(&a.created));

    if args.quiet {
        for image in &images {
            println!("{}", image.id);
        }
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(vec!["IMAGE ID", "NAMES", "CREATED"]);
    for image in &images {
        let names = if image.names.is_empty() {
            "<none>".to_string()
        } else {
            image.names.join(", ")
        };
        table.add_row(vec![
            image.id.chars().take(12).collect::<String>(),
            names,
            image.created.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{}", table);
    Ok(())
}
