//! State-driven teardown of a runtime container.

use std::sync::Arc;

use crate::container_manager::{ContainerStatus, State};
use crate::error::Result;

#[cfg_attr(test, automock)]
pub trait RuntimeStater: Send + Sync {
    fn state(&self, handle: &str) -> Result<State>;
}

#[cfg_attr(test, automock)]
pub trait RuntimeDeleter: Send + Sync {
    fn delete(&self, handle: &str, force: bool) -> Result<()>;
}

pub struct Deleter {
    stater: Arc<dyn RuntimeStater>,
    deleter: Arc<dyn RuntimeDeleter>,
}

impl Deleter {
    pub fn new(stater: Arc<dyn RuntimeStater>, deleter: Arc<dyn RuntimeDeleter>) -> Self {
        Deleter { stater, deleter }
    }

    /// Deletes the container unless it is already gone. A container whose
    /// state cannot be read is treated as gone.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn delete(&self, handle: &str) -> Result<()> {
        let state = match self.stater.state(handle) {
            Ok(state) => state,
            Err(err) => {
                tracing::info!(%err, "state failed, skipping delete");
                return Ok(());
            }
        };

        tracing::debug!(status = %state.status, pid = state.pid, "deleting container");
        match state.status {
            ContainerStatus::Created | ContainerStatus::Stopped => self.deleter.delete(handle, false),
            ContainerStatus::Running => self.deleter.delete(handle, true),
            _ => Ok(()),
        }
    }
}
