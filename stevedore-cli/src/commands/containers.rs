use clap::Args;
use comfy_table::{Table, presets::NOTHING};
use stevedore::Builder;

#[derive(Args, Debug)]
pub struct ContainersArgs {
    /// Print only container IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Print JSON instead of a table
    #[arg(long, conflicts_with = "quiet")]
    pub json: bool,
}

pub fn execute(args: ContainersArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let context = global.context()?;
    let store = global.store(&context)?;
    let builders = Builder::open_all(&context, store)?;

    if args.quiet {
        for builder in &builders {
            println!("{}", builder.container_id());
        }
        return Ok(());
    }
    if args.json {
        let states: Vec<_> = builders.iter().map(|b| b.state()).collect();
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(vec!["CONTAINER ID", "IMAGE ID", "IMAGE NAME", "CONTAINER NAME"]);
    for builder in &builders {
        let image_id: String = builder.state().from_image_id.chars().take(12).collect();
        table.add_row(vec![
            builder.container_id().chars().take(12).collect::<String>(),
            image_id,
            builder.from_image().to_string(),
            builder.container_name().to_string(),
        ]);
    }
    println!("{}", table);
    Ok(())
}
