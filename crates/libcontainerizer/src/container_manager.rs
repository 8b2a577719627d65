//! Driver interface implemented by every container runtime backend.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use oci_spec::runtime::Process;
use serde::{Deserialize, Serialize};

use crate::backing_process::{BackingProcess, ProcessManager};
use crate::bundle::BundleSpec;
use crate::error::{ContainerizerError, Result};
use crate::io::ProcessIo;

pub const OOM_EVENT_MESSAGE: &str = "Out of memory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Created,
    Running,
    Pausing,
    Paused,
    Stopped,
    Unknown,
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };

        write!(f, "{print}")
    }
}

impl FromStr for ContainerStatus {
    type Err = std::convert::Infallible;

    /// Unrecognised statuses map to `Unknown`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "creating" => Self::Creating,
            "created" => Self::Created,
            "running" => Self::Running,
            "pausing" => Self::Pausing,
            "paused" => Self::Paused,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub pid: i32,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub container_id: String,
    pub message: String,
}

impl Event {
    pub fn oom(container_id: &str) -> Self {
        Event {
            container_id: container_id.to_owned(),
            message: OOM_EVENT_MESSAGE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
}

/// Label predicate on containers. A list of filters matches only when every
/// filter matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFilter {
    pub label: String,
    pub value: String,
    pub comparison: Comparison,
}

impl ContainerFilter {
    pub fn equal(label: &str, value: &str) -> Self {
        ContainerFilter {
            label: label.to_owned(),
            value: value.to_owned(),
            comparison: Comparison::Equal,
        }
    }

    pub fn not_equal(label: &str, value: &str) -> Self {
        ContainerFilter {
            label: label.to_owned(),
            value: value.to_owned(),
            comparison: Comparison::NotEqual,
        }
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let actual = labels.get(&self.label).map(String::as_str);
        match self.comparison {
            Comparison::Equal => actual == Some(self.value.as_str()),
            Comparison::NotEqual => actual != Some(self.value.as_str()),
        }
    }

    pub fn matches_all(filters: &[ContainerFilter], labels: &HashMap<String, String>) -> bool {
        filters.iter().all(|filter| filter.matches(labels))
    }

    /// Comma-joined filters are ANDed by containerd.
    pub fn to_containerd_filter(filters: &[ContainerFilter]) -> String {
        filters
            .iter()
            .map(|filter| filter.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Display for ContainerFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.comparison {
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
        };
        write!(f, "labels.\"{}\"{}{}", self.label, op, self.value)
    }
}

#[cfg_attr(test, automock)]
pub trait ContainerManager: Send + Sync {
    /// Creates and starts the init process of container `id`. The io streams
    /// are owned by the container root on the host.
    fn create(
        &self,
        id: &str,
        bundle: &BundleSpec,
        container_root_uid: u32,
        container_root_gid: u32,
        io: Arc<dyn ProcessIo>,
    ) -> Result<()>;
    /// Stops the container and removes its runtime task. Absent containers
    /// are not an error.
    fn delete(&self, id: &str) -> Result<()>;
    fn exec(
        &self,
        id: &str,
        process_id: &str,
        process: &Process,
        io: Arc<dyn ProcessIo>,
    ) -> Result<()>;
    fn state(&self, id: &str) -> Result<State>;
    fn spec(&self, id: &str) -> Result<BundleSpec>;
    /// Stream of OOM notifications. Best effort: events may be duplicated.
    fn oom_events(&self) -> Result<Receiver<Event>>;
    fn bundle_ids(&self, filters: &[ContainerFilter]) -> Result<Vec<String>>;
    /// Removes the stored bundle. Absent bundles are not an error.
    fn remove_bundle(&self, id: &str) -> Result<()>;
}

#[cfg_attr(test, automock)]
pub trait RuntimeStopper: Send + Sync {
    fn stop(&self) -> Result<()>;
}

/// Used by the containerd backend to find the peas that belong to a sandbox
/// container before deleting it.
#[cfg_attr(test, automock)]
pub trait PeaHandlesGetter: Send + Sync {
    fn container_pea_handles(&self, sandbox_handle: &str) -> Result<Vec<String>>;
}

/// Cleanup operations run when a pea exits.
#[cfg_attr(test, automock)]
pub trait PeaManager: Send + Sync {
    fn delete(&self, id: &str) -> Result<()>;
    fn remove_bundle(&self, id: &str) -> Result<()>;
}

#[cfg_attr(test, automock)]
pub trait VolumeDestroyer: Send + Sync {
    fn destroy(&self, handle: &str) -> Result<()>;
}

/// Runs pea cleanup through a container manager.
pub struct ContainerManagerPeaManager(pub Arc<dyn ContainerManager>);

impl PeaManager for ContainerManagerPeaManager {
    fn delete(&self, id: &str) -> Result<()> {
        self.0.delete(id)
    }

    fn remove_bundle(&self, id: &str) -> Result<()> {
        self.0.remove_bundle(id)
    }
}

/// Exec path used by the containerizer. It is usually the active backend, but
/// processes may run through runc while containers are managed by containerd.
#[cfg_attr(test, automock)]
pub trait Execer: Send + Sync {
    fn exec(
        &self,
        id: &str,
        process_id: &str,
        process: &Process,
        io: Arc<dyn ProcessIo>,
    ) -> Result<()>;
    fn attach(
        &self,
        id: &str,
        process_id: &str,
        io: Arc<dyn ProcessIo>,
    ) -> Result<Box<dyn BackingProcess>>;
    /// Forgets the processes of a deleted container.
    fn release(&self, id: &str);
}

/// Execer backed by a container manager and its process manager.
pub struct BackendExecer {
    containers: Arc<dyn ContainerManager>,
    processes: Arc<dyn ProcessManager>,
}

impl BackendExecer {
    pub fn new(
        containers: Arc<dyn ContainerManager>,
        processes: Arc<dyn ProcessManager>,
    ) -> Self {
        BackendExecer {
            containers,
            processes,
        }
    }
}

impl Execer for BackendExecer {
    fn exec(
        &self,
        id: &str,
        process_id: &str,
        process: &Process,
        io: Arc<dyn ProcessIo>,
    ) -> Result<()> {
        self.containers.exec(id, process_id, process, io)
    }

    fn attach(
        &self,
        id: &str,
        process_id: &str,
        io: Arc<dyn ProcessIo>,
    ) -> Result<Box<dyn BackingProcess>> {
        self.processes.get_process(id, process_id, io)
    }

    // the container manager releases its own processes on delete
    fn release(&self, _id: &str) {}
}

pub(crate) fn not_found_as_ok(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

pub(crate) fn container_not_found(handle: &str) -> ContainerizerError {
    ContainerizerError::ContainerNotFound {
        handle: handle.to_owned(),
    }
}
