//! Create a container, or run a pea inside a sandbox
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use libcontainerizer::bundle::BundleSpec;
use libcontainerizer::process::ContainerProcess;

use super::StdioArgs;
use crate::backend::Backend;

/// Create and start a container from an OCI bundle
#[derive(Parser, Debug)]
pub struct Create {
    #[clap(required = true)]
    pub handle: String,
    /// Directory containing config.json
    #[clap(short, long, default_value = ".")]
    pub bundle: PathBuf,
    /// Run as a pea of this sandbox container and wait for it to exit
    #[clap(long)]
    pub sandbox: Option<String>,
    #[clap(flatten)]
    pub stdio: StdioArgs,
}

/// Returns the pea's exit code when running a pea, zero otherwise.
pub fn create(args: Create, backend: &Backend) -> Result<i32> {
    let bundle = BundleSpec::load(&args.bundle)
        .with_context(|| format!("failed to load bundle {}", args.bundle.display()))?;
    let io = args.stdio.into_io();

    match args.sandbox {
        Some(sandbox) => {
            let pea = backend
                .containerizer
                .run_pea(&sandbox, &args.handle, &bundle, io)
                .with_context(|| format!("failed to run pea {} in {}", args.handle, sandbox))?;
            pea.wait()
                .with_context(|| format!("failed to wait for pea {}", args.handle))
        }
        None => {
            backend
                .containerizer
                .create(&args.handle, &bundle, io)
                .with_context(|| format!("failed to create container {}", args.handle))?;
            Ok(0)
        }
    }
}
