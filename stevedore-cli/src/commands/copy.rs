use std::path::PathBuf;

use clap::Args;
use stevedore::builder::AddOptions;

#[derive(Args, Debug)]
pub struct CopyArgs {
    /// Name or ID of the working container
    pub container: String,

    /// Sources followed by the destination inside the container
    #[arg(required = true, num_args = 2..)]
    pub paths: Vec<String>,

    /// Owner of copied content, `user[:group]`
    #[arg(long)]
    pub chown: Option<String>,

    /// Permission bits of copied content, in octal
    #[arg(long, value_parser = parse_mode)]
    pub chmod: Option<u32>,
}

fn parse_mode(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value, 8).map_err(|e| format!("invalid octal mode {:?}: {}", value, e))
}

pub fn execute(args: CopyArgs, global: &crate::cli::GlobalFlags, extract: bool) -> anyhow::Result<()> {
    let mut builder = global.builder(&args.container)?;
    let Some((destination, sources)) = args.paths.split_last() else {
        anyhow::bail!("no destination given");
    };
    let sources: Vec<PathBuf> = sources.iter().map(PathBuf::from).collect();
    let options = AddOptions {
        chown: args.chown,
        chmod: args.chmod,
        extract,
    };
    if extract {
        builder.add(destination, &sources, &options)?;
    } else {
        builder.copy(destination, &sources, &options)?;
    }
    builder.save()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755"), Ok(0o755));
        assert!(parse_mode("9").is_err());
    }
}
