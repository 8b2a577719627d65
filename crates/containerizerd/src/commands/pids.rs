use anyhow::{Context, Result};
use clap::Parser;

use crate::backend::Backend;

/// Print the host pid of a container's init process, or of one of its peas
#[derive(Parser, Debug)]
pub struct Pids {
    #[clap(required = true)]
    pub handle: String,
    #[clap(long)]
    pub pea: Option<String>,
}

pub fn pids(args: Pids, backend: &Backend) -> Result<()> {
    let pid = match &args.pea {
        Some(pea) => backend
            .pids
            .get_pea_pid(&args.handle, pea)
            .with_context(|| format!("failed to get pid of pea {pea} in {}", args.handle))?,
        None => backend
            .pids
            .get_pid(&args.handle)
            .with_context(|| format!("failed to get pid of {}", args.handle))?,
    };
    println!("{pid}");
    Ok(())
}
