use anyhow::{Context, Result};
use clap::Parser;

use libcontainerizer::container_manager::PeaHandlesGetter;

use crate::backend::Backend;

/// Stop a container and its peas, then remove their bundles
#[derive(Parser, Debug)]
pub struct Delete {
    #[clap(required = true)]
    pub handle: String,
    /// Keep the bundle on disk
    #[clap(long)]
    pub keep_bundle: bool,
}

pub fn delete(args: Delete, backend: &Backend) -> Result<()> {
    tracing::debug!("start deleting {}", args.handle);
    let containerizer = &backend.containerizer;

    let peas = containerizer
        .container_pea_handles(&args.handle)
        .with_context(|| format!("failed to list peas of {}", args.handle))?;
    for pea in peas {
        containerizer
            .delete(&pea)
            .with_context(|| format!("failed to delete pea {pea}"))?;
        containerizer
            .remove_bundle(&pea)
            .with_context(|| format!("failed to remove bundle of pea {pea}"))?;
    }

    containerizer
        .delete(&args.handle)
        .with_context(|| format!("failed to delete container {}", args.handle))?;
    if !args.keep_bundle {
        containerizer
            .remove_bundle(&args.handle)
            .with_context(|| format!("failed to remove bundle of {}", args.handle))?;
    }
    Ok(())
}
