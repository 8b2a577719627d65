//! Backend-specific handle on a running process.

use std::sync::Arc;

use crate::error::Result;
use crate::io::ProcessIo;
use crate::signal::Signal;

#[cfg_attr(test, automock)]
pub trait BackingProcess: Send + Sync {
    fn id(&self) -> String;
    /// Blocks until the process exits and returns its exit code.
    fn wait(&self) -> Result<i32>;
    fn signal(&self, signal: Signal) -> Result<()>;
    /// Releases whatever the backend keeps around for an exited process.
    fn delete(&self) -> Result<()>;
}

#[cfg_attr(test, automock)]
pub trait ProcessManager: Send + Sync {
    /// Process `process_id` exec'd into `container_id`.
    fn get_process(
        &self,
        container_id: &str,
        process_id: &str,
        io: Arc<dyn ProcessIo>,
    ) -> Result<Box<dyn BackingProcess>>;

    /// Init process of container `id`.
    fn get_task(&self, id: &str, io: Arc<dyn ProcessIo>) -> Result<Box<dyn BackingProcess>>;
}

/// Exit code reported for a process killed by a signal.
pub(crate) fn signalled_exit_code(signal: i32) -> i32 {
    128 + signal
}
