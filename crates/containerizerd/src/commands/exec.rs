use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use libcontainerizer::process::ContainerProcess;
use libcontainerizer::process_builder::ProcessSpec;

use super::StdioArgs;
use crate::backend::Backend;

/// Run a process inside a running container
#[derive(Parser, Debug)]
pub struct Exec {
    #[clap(required = true)]
    pub handle: String,
    /// Process id, generated when unset
    #[clap(long)]
    pub id: Option<String>,
    /// JSON process spec, used instead of the trailing command
    #[clap(short, long)]
    pub process: Option<PathBuf>,
    #[clap(short, long)]
    pub user: Option<String>,
    #[clap(long)]
    pub cwd: Option<String>,
    /// Environment variable as KEY=VALUE
    #[clap(short, long)]
    pub env: Vec<String>,
    /// Print the process id instead of waiting for the exit code
    #[clap(short, long)]
    pub detach: bool,
    #[clap(flatten)]
    pub stdio: StdioArgs,
    #[clap(trailing_var_arg = true)]
    pub command: Vec<String>,
}

fn process_spec(args: &Exec) -> Result<ProcessSpec> {
    let mut spec = match &args.process {
        Some(path) => {
            let contents =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_slice(&contents)
                .with_context(|| format!("failed to parse process spec {}", path.display()))?
        }
        None => {
            let Some((path, rest)) = args.command.split_first() else {
                bail!("either --process or a command is required");
            };
            ProcessSpec {
                path: path.clone(),
                args: rest.to_vec(),
                ..Default::default()
            }
        }
    };

    if let Some(id) = &args.id {
        spec.id = id.clone();
    }
    if let Some(user) = &args.user {
        spec.user = user.clone();
    }
    if let Some(cwd) = &args.cwd {
        spec.dir = cwd.clone();
    }
    spec.env.extend(args.env.iter().cloned());
    Ok(spec)
}

/// Returns the exit code of the process, or zero when detached.
pub fn exec(args: Exec, backend: &Backend) -> Result<i32> {
    let spec = process_spec(&args)?;
    let process = backend
        .containerizer
        .exec(&args.handle, &spec, args.stdio.into_io())
        .with_context(|| format!("failed to exec in container {}", args.handle))?;

    if args.detach {
        println!("{}", process.id());
        return Ok(0);
    }

    let exit_code = process
        .wait()
        .with_context(|| format!("failed to wait for process {}", process.id()))?;
    tracing::debug!(handle = %args.handle, process_id = %process.id(), exit_code, "process exited");
    Ok(exit_code)
}
