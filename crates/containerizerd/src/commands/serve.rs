//! Long running daemon mode
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::prctl;
use nix::sys::signal::{SigSet, Signal};

use crate::backend::Backend;
use crate::config::DaemonConfig;

/// Run the daemon until SIGINT or SIGTERM
#[derive(Parser, Debug)]
pub struct Serve {}

fn termination_signals() -> SigSet {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals
}

pub fn serve(_: Serve, config: &DaemonConfig) -> Result<()> {
    // runc init processes are reparented to us once runc exits
    prctl::set_child_subreaper(true).context("failed to become a child subreaper")?;

    // threads spawned from here on inherit the mask
    let signals = termination_signals();
    signals
        .thread_block()
        .context("failed to block termination signals")?;

    let backend = Backend::open(config)?;
    backend.watch_existing()?;

    let events = backend.containerizer.events();
    let event_logger = thread::Builder::new()
        .name("event-logger".to_owned())
        .spawn(move || {
            for event in events.iter() {
                tracing::warn!(
                    handle = %event.container_id,
                    message = %event.message,
                    "container event"
                );
            }
        })
        .context("failed to spawn event logger")?;

    tracing::info!(backend = ?config.backend, depot = ?config.depot_dir, "containerizerd started");

    let signal = signals
        .wait()
        .context("failed to wait for termination signals")?;
    tracing::info!(?signal, "shutting down");

    let stopped = backend.containerizer.stop();
    if event_logger.join().is_err() {
        tracing::error!("event logger panicked");
    }

    stopped.context("failed to stop the runtime")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_signals() {
        let signals = termination_signals();
        assert!(signals.contains(Signal::SIGINT));
        assert!(signals.contains(Signal::SIGTERM));
        assert!(!signals.contains(Signal::SIGHUP));
    }
}
