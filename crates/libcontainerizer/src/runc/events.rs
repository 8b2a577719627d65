//! OOM notifications synthesized from `runc events`.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::process::Child;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use serde::Deserialize;

use super::runtime::RuncRuntime;
use crate::container_manager::Event;
use crate::error::{ContainerizerError, Result};

#[derive(Debug, Deserialize)]
struct RuncEvent {
    #[serde(rename = "type")]
    typ: String,
}

/// Parses one line of `runc events` output.
pub(crate) fn oom_event(container_id: &str, line: &str) -> Option<Event> {
    let event: RuncEvent = serde_json::from_str(line).ok()?;
    (event.typ == "oom").then(|| Event::oom(container_id))
}

/// Fans runc OOM events out to every subscriber.
#[derive(Default)]
pub struct OomWatcher {
    subscribers: Mutex<Vec<Sender<Event>>>,
    watchers: Mutex<HashMap<String, Child>>,
}

impl OomWatcher {
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn publish(&self, event: Event) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Starts a `runc events` watcher for `id` unless one is running.
    pub fn watch(self: &Arc<Self>, runtime: &RuncRuntime, id: &str) -> Result<()> {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if watchers.contains_key(id) {
            return Ok(());
        }

        let mut child = runtime.spawn_events(id)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ContainerizerError::backend("runc events", "stdout was not captured")
        })?;
        watchers.insert(id.to_owned(), child);

        let watcher = Arc::clone(self);
        let container_id = id.to_owned();
        thread::Builder::new()
            .name(format!("runc-events-{id}"))
            .spawn(move || watcher.forward(&container_id, stdout))
            .map_err(|err| ContainerizerError::io("runc-events thread", err))?;
        Ok(())
    }

    fn forward(&self, container_id: &str, stdout: impl Read) {
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(container_id, %err, "reading runc events failed");
                    break;
                }
            };
            if let Some(event) = oom_event(container_id, &line) {
                tracing::info!(container_id, "container ran out of memory");
                self.publish(event);
            }
        }

        let child = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(container_id);
        if let Some(mut child) = child {
            if let Err(err) = child.wait() {
                tracing::debug!(container_id, %err, "reaping runc events failed");
            }
        }
        tracing::debug!(container_id, "runc events watcher exited");
    }

    /// Kills every watcher. Their threads exit once the pipes close.
    pub fn stop(&self) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        for (id, child) in watchers.iter_mut() {
            if let Err(err) = child.kill() {
                tracing::debug!(container_id = %id, %err, "killing runc events failed");
            }
        }
    }
}
