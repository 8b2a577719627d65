//! Contains functionality of list containers command
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use tabwriter::TabWriter;

use libcontainerizer::container_manager::PeaHandlesGetter;

use crate::backend::Backend;

/// List containers, or the peas of a sandbox
#[derive(Parser, Debug)]
pub struct List {
    /// List the peas of this sandbox container instead
    #[clap(long)]
    pub peas_of: Option<String>,
}

fn created(bundle: &Path) -> String {
    match fs::metadata(bundle).and_then(|m| m.created()) {
        Ok(time) => {
            let local: DateTime<Local> = DateTime::from(time);
            local.to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
        }
        Err(_) => "".to_owned(),
    }
}

pub fn list(args: List, backend: &Backend) -> Result<()> {
    let containerizer = &backend.containerizer;
    let handles = match &args.peas_of {
        Some(sandbox) => containerizer
            .container_pea_handles(sandbox)
            .with_context(|| format!("failed to list peas of {sandbox}"))?,
        None => containerizer
            .container_handles()
            .context("failed to list containers")?,
    };

    let mut content = String::new();
    for handle in handles {
        let (pid, status) = match containerizer.state(&handle) {
            Ok(state) => (state.pid.to_string(), state.status.to_string()),
            Err(err) => {
                tracing::debug!(%err, handle, "failed to get state");
                ("".to_owned(), "unknown".to_owned())
            }
        };
        let (bundle, created) = match containerizer.bundle_info(&handle) {
            Ok((path, _)) => (path.display().to_string(), created(&path)),
            Err(_) => ("".to_owned(), "".to_owned()),
        };

        let _ = writeln!(content, "{handle}\t{pid}\t{status}\t{bundle}\t{created}");
    }

    let mut tab_writer = TabWriter::new(io::stdout());
    writeln!(&mut tab_writer, "HANDLE\tPID\tSTATUS\tBUNDLE\tCREATED")?;
    write!(&mut tab_writer, "{content}")?;
    tab_writer.flush()?;

    Ok(())
}
