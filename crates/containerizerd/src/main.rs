//! # containerizerd
//! Runs containers through runc or containerd behind one lifecycle API.
mod backend;
mod commands;
mod config;
mod observability;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::backend::Backend;
use crate::config::{ConfigOverrides, DaemonConfig};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Daemon config file
    #[clap(long)]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[clap(long)]
    debug: bool,
    /// Log file, stderr when unset
    #[clap(long)]
    log: Option<PathBuf>,
    /// Log format: text or json
    #[clap(long)]
    log_format: Option<String>,
    /// Log level, takes precedence over --debug
    #[clap(long)]
    log_level: Option<String>,
    /// Also send logs to journald
    #[clap(long)]
    systemd_log: bool,
    #[clap(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    Serve(commands::serve::Serve),
    Create(commands::create::Create),
    Exec(commands::exec::Exec),
    Delete(commands::delete::Delete),
    State(commands::state::State),
    Stats(commands::stats::Stats),
    List(commands::list::List),
    Pids(commands::pids::Pids),
    Kill(commands::kill::Kill),
}

impl SubCommand {
    /// Commands that wait on a runc init process. runc detaches it, so only a
    /// child subreaper can collect its exit status.
    fn waits_on_init_process(&self) -> bool {
        matches!(self, SubCommand::Create(create) if create.sandbox.is_some())
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = observability::init(&opts) {
        eprintln!("log init failed: {e:?}");
    }

    tracing::debug!(
        "started by user {} with {:?}",
        nix::unistd::geteuid(),
        std::env::args_os()
    );

    let config = DaemonConfig::load(opts.global.config.as_deref())
        .context("failed to load daemon config")?
        .apply(&opts.global.overrides);

    // serve blocks termination signals before any thread exists
    if let SubCommand::Serve(serve) = opts.subcmd {
        return commands::serve::serve(serve, &config);
    }

    if opts.subcmd.waits_on_init_process() {
        nix::sys::prctl::set_child_subreaper(true)
            .context("failed to become a child subreaper")?;
    }

    let backend = Backend::open(&config)?;
    let mut exit_code = 0;
    let cmd_result = match opts.subcmd {
        SubCommand::Serve(_) => Ok(()),
        SubCommand::Create(create) => {
            commands::create::create(create, &backend).map(|code| exit_code = code)
        }
        SubCommand::Exec(exec) => commands::exec::exec(exec, &backend).map(|code| exit_code = code),
        SubCommand::Delete(delete) => commands::delete::delete(delete, &backend),
        SubCommand::State(state) => commands::state::state(state, &backend),
        SubCommand::Stats(stats) => commands::stats::stats(stats, &backend),
        SubCommand::List(list) => commands::list::list(list, &backend),
        SubCommand::Pids(pids) => commands::pids::pids(pids, &backend),
        SubCommand::Kill(kill) => commands::kill::kill(kill, &backend),
    };

    if let Err(err) = backend.containerizer.stop() {
        tracing::warn!(%err, "failed to stop the runtime");
    }

    if let Err(ref e) = cmd_result {
        tracing::error!("error in executing command: {:?}", e);
    }
    cmd_result?;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
