use anyhow::{Context, Result};
use clap::Parser;

use crate::backend::Backend;

/// Show cgroup metrics of a container
#[derive(Parser, Debug)]
pub struct Stats {
    #[clap(required = true)]
    pub handle: String,
}

pub fn stats(args: Stats, backend: &Backend) -> Result<()> {
    let metrics = backend
        .containerizer
        .stats(&args.handle)
        .with_context(|| format!("failed to collect metrics of {}", args.handle))?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
