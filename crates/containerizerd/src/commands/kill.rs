//! Contains functionality of kill container command
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use libcontainerizer::io::NullIo;
use libcontainerizer::process::ContainerProcess;
use libcontainerizer::signal::{ApiSignal, Signal};

use crate::backend::Backend;

/// Send a signal to a container's init process or to an exec'd process
#[derive(Parser, Debug)]
pub struct Kill {
    #[clap(required = true)]
    pub handle: String,
    /// TERM or KILL, by name or number
    #[clap(default_value = "TERM")]
    pub signal: String,
    /// Exec'd process to signal instead of the init process
    #[clap(long)]
    pub process: Option<String>,
}

pub fn kill(args: Kill, backend: &Backend) -> Result<()> {
    let signal: ApiSignal = args.signal.parse()?;

    match &args.process {
        Some(process_id) => backend
            .containerizer
            .attach(&args.handle, process_id, Arc::new(NullIo))
            .with_context(|| format!("failed to find process {process_id} in {}", args.handle))?
            .signal(signal)
            .with_context(|| format!("failed to signal process {process_id}")),
        None => backend
            .processes
            .get_task(&args.handle, Arc::new(NullIo))
            .with_context(|| format!("failed to find init process of {}", args.handle))?
            .signal(Signal::try_from(signal)?)
            .with_context(|| format!("failed to signal {}", args.handle)),
    }
}
