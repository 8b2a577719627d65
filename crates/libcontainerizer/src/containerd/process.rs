use std::sync::Arc;

use super::client::{ClientError, DaemonClient};
use crate::backing_process::{BackingProcess, ProcessManager};
use crate::container_manager::container_not_found;
use crate::error::{ContainerizerError, Result};
use crate::io::ProcessIo;
use crate::signal::Signal;

/// A task init process (empty exec id) or an exec'd process.
pub struct NerdProcess {
    client: Arc<dyn DaemonClient>,
    container_id: String,
    exec_id: String,
    io: Arc<dyn ProcessIo>,
}

impl NerdProcess {
    fn is_init(&self) -> bool {
        self.exec_id.is_empty()
    }

    fn not_found(&self) -> ContainerizerError {
        if self.is_init() {
            ContainerizerError::TaskNotFound {
                handle: self.container_id.clone(),
            }
        } else {
            ContainerizerError::ProcessNotFound {
                handle: self.container_id.clone(),
                process_id: self.exec_id.clone(),
            }
        }
    }

    fn client_error(&self, context: &str, err: ClientError) -> ContainerizerError {
        match err {
            ClientError::NotFound(_) => self.not_found(),
            other => ContainerizerError::backend(context, other),
        }
    }
}

impl BackingProcess for NerdProcess {
    fn id(&self) -> String {
        if self.is_init() {
            self.container_id.clone()
        } else {
            self.exec_id.clone()
        }
    }

    /// Blocks until containerd reports the exit status and the output
    /// streams are drained. A status containerd failed to retrieve is an
    /// error, never a zero exit code.
    #[tracing::instrument(level = "debug", skip(self), fields(container_id = %self.container_id, exec_id = %self.exec_id))]
    fn wait(&self) -> Result<i32> {
        let status = self
            .client
            .wait(&self.container_id, &self.exec_id, None)
            .map_err(|err| self.client_error("wait for process", err))?;
        self.io.wait();
        tracing::debug!(status, "process exited");
        Ok(status as i32)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.client
            .kill(&self.container_id, &self.exec_id, signal.as_i32() as u32, false)
            .map_err(|err| self.client_error("signal process", err))
    }

    /// Deletes an exited exec'd process. Init processes go away with their
    /// task.
    fn delete(&self) -> Result<()> {
        if self.is_init() {
            return Ok(());
        }
        self.client
            .delete_process(&self.container_id, &self.exec_id)
            .map_err(|err| self.client_error("delete process", err))
    }
}

pub struct NerdProcessManager {
    client: Arc<dyn DaemonClient>,
}

impl NerdProcessManager {
    pub fn new(client: Arc<dyn DaemonClient>) -> Self {
        NerdProcessManager { client }
    }

    fn check_task(&self, container_id: &str) -> Result<()> {
        self.client.get_container(container_id).map_err(|err| {
            err.into_containerizer(container_id, "load container", |handle| {
                container_not_found(&handle)
            })
        })?;
        self.client.task(container_id, "").map_err(|err| {
            err.into_containerizer(container_id, "load task", |handle| {
                ContainerizerError::TaskNotFound { handle }
            })
        })?;
        Ok(())
    }

    fn process(
        &self,
        container_id: &str,
        exec_id: &str,
        io: Arc<dyn ProcessIo>,
    ) -> Box<dyn BackingProcess> {
        Box::new(NerdProcess {
            client: Arc::clone(&self.client),
            container_id: container_id.to_owned(),
            exec_id: exec_id.to_owned(),
            io,
        })
    }
}

impl ProcessManager for NerdProcessManager {
    fn get_process(
        &self,
        container_id: &str,
        process_id: &str,
        io: Arc<dyn ProcessIo>,
    ) -> Result<Box<dyn BackingProcess>> {
        self.check_task(container_id)?;
        match self.client.task(container_id, process_id) {
            Ok(_) => Ok(self.process(container_id, process_id, io)),
            Err(ClientError::NotFound(_)) => Err(ContainerizerError::ProcessNotFound {
                handle: container_id.to_owned(),
                process_id: process_id.to_owned(),
            }),
            Err(err) => Err(ContainerizerError::backend("load process", err)),
        }
    }

    fn get_task(&self, id: &str, io: Arc<dyn ProcessIo>) -> Result<Box<dyn BackingProcess>> {
        self.check_task(id)?;
        Ok(self.process(id, "", io))
    }
}
