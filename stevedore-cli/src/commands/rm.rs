use clap::Args;
use stevedore::Builder;

#[derive(Args, Debug)]
pub struct RmArgs {
    /// Remove every working container
    #[arg(short, long, conflicts_with = "targets")]
    pub all: bool,

    /// Name or ID of the working container(s) to remove
    #[arg(required_unless_present = "all", num_args = 1..)]
    pub targets: Vec<String>,
}

pub fn execute(args: RmArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let context = global.context()?;
    let store = global.store(&context)?;

    let mut builders = Vec::new();
    let mut errors = Vec::new();
    if args.all {
        builders = Builder::open_all(&context, store)?;
    } else {
        for target in &args.targets {
            match Builder::open(&context, store.clone(), target) {
                Ok(builder) => builders.push(builder),
                Err(e) => {
                    eprintln!("Error: {}: {}", target, e);
                    errors.push(format!("{}: {}", target, e));
                }
            }
        }
    }

    for mut builder in builders {
        let name = builder.container_name().to_string();
        let id = builder.container_id().to_string();
        match builder.delete() {
            Ok(()) => println!("{}", id),
            Err(e) => {
                eprintln!("Error removing '{}': {}", name, e);
                errors.push(format!("{}: {}", name, e));
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("Failed to remove {} container(s)\nErrors:\n  {}", errors.len(), errors.join("\n  "));
    }
    Ok(())
}
