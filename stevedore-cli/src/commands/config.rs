use clap::Args;

use super::split_pair;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Name or ID of the working container
    pub container: String,

    /// Set an environment variable, `KEY=VALUE`; `KEY-` removes it
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Default command, as a JSON array or a shell string
    #[arg(long)]
    pub cmd: Option<String>,

    /// Entrypoint, as a JSON array or a shell string
    #[arg(long)]
    pub entrypoint: Option<String>,

    #[arg(long)]
    pub workingdir: Option<String>,

    #[arg(short, long)]
    pub user: Option<String>,

    #[arg(long)]
    pub hostname: Option<String>,

    /// Set a label, `KEY=VALUE`; `KEY-` removes it
    #[arg(short, long = "label")]
    pub labels: Vec<String>,

    /// Set an annotation, `KEY=VALUE`; `KEY-` removes it
    #[arg(short, long = "annotation")]
    pub annotations: Vec<String>,

    /// Expose a port, `PORT[/PROTO]`; `PORT-` removes it
    #[arg(short, long = "port")]
    pub ports: Vec<String>,

    /// Declare a volume; `PATH-` removes it
    #[arg(short, long = "volume")]
    pub volumes: Vec<String>,

    /// Description recorded in the layer's history entry
    #[arg(long)]
    pub created_by: Option<String>,

    #[arg(long)]
    pub author: Option<String>,
}

/// A JSON array is taken as is; anything else runs through `/bin/sh -c`.
pub(crate) fn command_line(value: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(value) {
        Ok(args) => args,
        Err(_) => vec!["/bin/sh".into(), "-c".into(), value.into()],
    }
}

pub fn execute(args: ConfigArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut builder = global.builder(&args.container)?;

    for entry in &args.env {
        match entry.strip_suffix('-') {
            Some(key) if !entry.contains('=') => builder.unset_env(key),
            _ => {
                let (key, value) = split_pair(entry);
                builder.set_env(key, value);
            }
        }
    }
    if let Some(cmd) = &args.cmd {
        builder.set_cmd(command_line(cmd));
    }
    if let Some(entrypoint) = &args.entrypoint {
        builder.set_entrypoint(command_line(entrypoint));
    }
    if let Some(dir) = &args.workingdir {
        builder.set_workdir(dir);
    }
    if let Some(user) = &args.user {
        builder.set_user(user);
    }
    if let Some(hostname) = &args.hostname {
        builder.set_hostname(hostname);
    }
    for entry in &args.labels {
        match entry.strip_suffix('-') {
            Some(key) if !entry.contains('=') => builder.unset_label(key),
            _ => {
                let (key, value) = split_pair(entry);
                builder.set_label(key, value);
            }
        }
    }
    for entry in &args.annotations {
        match entry.strip_suffix('-') {
            Some(key) if !entry.contains('=') => builder.unset_annotation(key),
            _ => {
                let (key, value) = split_pair(entry);
                builder.set_annotation(key, value);
            }
        }
    }
    for port in &args.ports {
        match port.strip_suffix('-') {
            Some(port) => builder.unset_port(port)?,
            None => builder.set_port(port)?,
        }
    }
    for volume in &args.volumes {
        match volume.strip_suffix('-') {
            Some(path) => builder.remove_volume(path),
            None => builder.add_volume(volume),
        }
    }
    if let Some(created_by) = &args.created_by {
        builder.set_created_by(created_by);
    }
    if let Some(author) = &args.author {
        builder.set_maintainer(author);
    }
    builder.save()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_forms() {
        assert_eq!(command_line(r#"["echo","hi"]"#), vec!["echo", "hi"]);
        assert_eq!(command_line("echo hi"), vec!["/bin/sh", "-c", "echo hi"]);
    }
}
