use anyhow::{Context, Result};
use clap::Parser;

use crate::backend::Backend;

/// Show the container state
#[derive(Parser, Debug)]
pub struct State {
    #[clap(required = true)]
    pub handle: String,
}

pub fn state(args: State, backend: &Backend) -> Result<()> {
    let state = backend
        .containerizer
        .state(&args.handle)
        .with_context(|| format!("failed to get state of {}", args.handle))?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
