use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use nix::sys::signal::Signal as NixSignal;
use oci_spec::runtime::Process;

use super::client::{ClientError, ContainerRecord, DaemonClient, TaskInfo, TaskIo};
use crate::bundle::BundleSpec;
use crate::container_manager::{
    container_not_found, ContainerFilter, ContainerManager, ContainerStatus, Event, RuntimeStopper,
    State,
};
use crate::error::{ContainerizerError, Result};
use crate::io::ProcessIo;

pub const TASK_RETRIES: usize = 5;
pub const TASK_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const KILL_TIMEOUT: Duration = Duration::from_secs(120);

/// Container manager backed by a containerd daemon. Bundles are stored as
/// container records whose labels are the bundle annotations.
pub struct NerdContainerManager {
    client: Arc<dyn DaemonClient>,
    retry_interval: Duration,
    kill_timeout: Duration,
}

fn task_not_found(handle: String) -> ContainerizerError {
    ContainerizerError::TaskNotFound { handle }
}

impl NerdContainerManager {
    pub fn new(client: Arc<dyn DaemonClient>) -> Self {
        NerdContainerManager {
            client,
            retry_interval: TASK_RETRY_INTERVAL,
            kill_timeout: KILL_TIMEOUT,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    fn load_container(&self, id: &str) -> Result<ContainerRecord> {
        self.client
            .get_container(id)
            .map_err(|err| {
                err.into_containerizer(id, "load container", |handle| container_not_found(&handle))
            })
    }

    /// The init task of `id`. containerd briefly reports pid 0 or an unknown
    /// status for tasks that are still being set up, so those answers are
    /// retried.
    fn load_task(&self, id: &str) -> Result<TaskInfo> {
        self.load_container(id)?;

        for attempt in 1..=TASK_RETRIES {
            let info = self
                .client
                .task(id, "")
                .map_err(|err| err.into_containerizer(id, "load task", task_not_found))?;
            if info.pid != 0 && info.status != ContainerStatus::Unknown {
                return Ok(info);
            }

            tracing::info!(
                id,
                attempt,
                pid = info.pid,
                status = %info.status,
                "task not ready, retrying"
            );
            if attempt < TASK_RETRIES {
                thread::sleep(self.retry_interval);
            }
        }

        Err(ContainerizerError::backend(
            "load task",
            format!("failed getting task for {id}"),
        ))
    }

    /// Kills the init process and everything else in the task, then waits for
    /// it to go away.
    fn kill_task(&self, id: &str) -> Result<()> {
        match self.client.kill(id, "", NixSignal::SIGKILL as u32, true) {
            Ok(()) => {}
            Err(ClientError::NotFound(_)) | Err(ClientError::FailedPrecondition(_)) => {
                tracing::debug!(id, "task already stopped");
            }
            Err(err) => return Err(ContainerizerError::backend("kill task", err)),
        }

        match self.client.wait(id, "", Some(self.kill_timeout)) {
            Ok(_) | Err(ClientError::NotFound(_)) => Ok(()),
            Err(ClientError::DeadlineExceeded(_)) => Err(ContainerizerError::Timeout {
                what: format!("task {id} to exit after kill"),
                timeout: self.kill_timeout,
            }),
            Err(err) => Err(ContainerizerError::backend("wait for killed task", err)),
        }
    }

    fn discard_failed_container(&self, id: &str) {
        if let Err(err) = self.client.delete_task(id) {
            if !err.is_not_found() {
                tracing::warn!(%err, id, "failed to delete task of failed container");
            }
        }
        if let Err(err) = self.client.delete_container(id) {
            tracing::warn!(%err, id, "failed to delete failed container");
        }
    }
}

impl ContainerManager for NerdContainerManager {
    #[tracing::instrument(level = "debug", skip(self, bundle, io))]
    fn create(
        &self,
        id: &str,
        bundle: &BundleSpec,
        container_root_uid: u32,
        container_root_gid: u32,
        io: Arc<dyn ProcessIo>,
    ) -> Result<()> {
        self.client
            .create_container(id, bundle.annotations(), bundle.to_json()?)
            .map_err(|err| {
                err.into_containerizer(id, "create container", |handle| {
                    container_not_found(&handle)
                })
            })?;

        // init processes never get a terminal
        let task_io = TaskIo {
            terminal: false,
            ..TaskIo::from_io(io.as_ref())
        };
        let started = self
            .client
            .create_task(id, &task_io, container_root_uid, container_root_gid)
            .and_then(|_| self.client.start(id, ""));
        match started {
            Ok(pid) => {
                tracing::debug!(pid, "task started");
                Ok(())
            }
            Err(err) => {
                tracing::error!(%err, id, "creating task failed");
                self.discard_failed_container(id);
                Err(err.into_containerizer(id, "create task", task_not_found))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn delete(&self, id: &str) -> Result<()> {
        match self.load_task(id) {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!(%err, "already deleted");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        self.kill_task(id)?;
        match self.client.delete_task(id) {
            Ok(()) | Err(ClientError::NotFound(_)) => Ok(()),
            Err(err) => Err(ContainerizerError::backend("delete task", err)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, process, io))]
    fn exec(
        &self,
        id: &str,
        process_id: &str,
        process: &Process,
        io: Arc<dyn ProcessIo>,
    ) -> Result<()> {
        self.load_task(id)?;

        let contents = serde_json::to_vec(process).map_err(|err| ContainerizerError::Parse {
            what: "process spec".to_owned(),
            message: err.to_string(),
        })?;
        let handle = format!("{id}/{process_id}");
        self.client
            .exec(id, process_id, contents, &TaskIo::from_io(io.as_ref()))
            .map_err(|err| {
                err.into_containerizer(&handle, "exec", |_| task_not_found(id.to_owned()))
            })?;

        match self.client.start(id, process_id) {
            Ok(pid) => {
                tracing::debug!(pid, "process started");
                Ok(())
            }
            Err(err) => {
                if let Err(cleanup) = self.client.delete_process(id, process_id) {
                    tracing::warn!(err = %cleanup, "failed to delete process that did not start");
                }
                Err(err.into_containerizer(&handle, "exec", |_| task_not_found(id.to_owned())))
            }
        }
    }

    fn state(&self, id: &str) -> Result<State> {
        let info = self.load_task(id)?;
        Ok(State {
            pid: info.pid as i32,
            status: info.status,
        })
    }

    fn spec(&self, id: &str) -> Result<BundleSpec> {
        BundleSpec::from_json(&self.load_container(id)?.spec)
    }

    fn oom_events(&self) -> Result<Receiver<Event>> {
        self.client
            .subscribe_oom()
            .map_err(|err| ContainerizerError::backend("subscribe to oom events", err))
    }

    fn bundle_ids(&self, filters: &[ContainerFilter]) -> Result<Vec<String>> {
        self.client
            .list_containers(&ContainerFilter::to_containerd_filter(filters))
            .map_err(|err| ContainerizerError::backend("list containers", err))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn remove_bundle(&self, id: &str) -> Result<()> {
        match self.client.delete_container(id) {
            Ok(()) => Ok(()),
            Err(ClientError::NotFound(_)) => {
                tracing::debug!("container already deleted");
                Ok(())
            }
            Err(err) => Err(ContainerizerError::backend("delete container", err)),
        }
    }
}

impl RuntimeStopper for NerdContainerManager {
    fn stop(&self) -> Result<()> {
        self.client.close();
        Ok(())
    }
}
