use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use libcontainerizer::io::{PathIo, ProcessIo};

pub mod create;
pub mod delete;
pub mod exec;
pub mod kill;
pub mod list;
pub mod pids;
pub mod serve;
pub mod state;
pub mod stats;

/// Files or fifos wired to the standard streams of a process.
#[derive(Args, Debug, Default, Clone)]
pub struct StdioArgs {
    #[clap(long)]
    pub stdin: Option<PathBuf>,
    #[clap(long)]
    pub stdout: Option<PathBuf>,
    #[clap(long)]
    pub stderr: Option<PathBuf>,
}

impl StdioArgs {
    fn into_io(self) -> Arc<dyn ProcessIo> {
        Arc::new(PathIo {
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            terminal: false,
        })
    }
}
