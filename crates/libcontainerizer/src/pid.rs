//! Host PIDs of container and pea init processes.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::container_manager::ContainerManager;
use crate::depot::Depot;
use crate::error::{ContainerizerError, Result};

pub const PIDFILE: &str = "pidfile";
pub const DEFAULT_PIDFILE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PIDFILE_SLEEP_INTERVAL: Duration = Duration::from_millis(100);

#[cfg_attr(test, automock)]
pub trait PidGetter: Send + Sync {
    fn get_pid(&self, handle: &str) -> Result<i32>;
    fn get_pea_pid(&self, sandbox_handle: &str, pea_id: &str) -> Result<i32>;
}

/// Asks the runtime for the init pid. Peas are containers of their own, so
/// the sandbox handle is not needed.
pub struct ContainerPidGetter {
    containers: Arc<dyn ContainerManager>,
}

impl ContainerPidGetter {
    pub fn new(containers: Arc<dyn ContainerManager>) -> Self {
        ContainerPidGetter { containers }
    }
}

impl PidGetter for ContainerPidGetter {
    fn get_pid(&self, handle: &str) -> Result<i32> {
        Ok(self.containers.state(handle)?.pid)
    }

    fn get_pea_pid(&self, _sandbox_handle: &str, pea_id: &str) -> Result<i32> {
        Ok(self.containers.state(pea_id)?.pid)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

#[cfg_attr(test, automock)]
pub trait PidFileReader: Send + Sync {
    fn pid(&self, path: &Path) -> Result<i32>;
}

/// Polls a pid file until it exists and is non-empty.
pub struct PollingPidFileReader {
    clock: Box<dyn Clock>,
    timeout: Duration,
    sleep_interval: Duration,
}

impl Default for PollingPidFileReader {
    fn default() -> Self {
        PollingPidFileReader::new(
            Box::new(SystemClock),
            DEFAULT_PIDFILE_TIMEOUT,
            DEFAULT_PIDFILE_SLEEP_INTERVAL,
        )
    }
}

impl PollingPidFileReader {
    pub fn new(clock: Box<dyn Clock>, timeout: Duration, sleep_interval: Duration) -> Self {
        PollingPidFileReader {
            clock,
            timeout,
            sleep_interval,
        }
    }

    fn read_contents(&self, path: &Path) -> Result<String> {
        let deadline = self.clock.now() + self.timeout;
        loop {
            match fs::read_to_string(path) {
                Ok(contents) if !contents.trim().is_empty() => return Ok(contents),
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(ContainerizerError::io(path, err)),
            }

            if self.clock.now() >= deadline {
                return Err(ContainerizerError::Timeout {
                    what: format!("pid file {}", path.display()),
                    timeout: self.timeout,
                });
            }
            self.clock.sleep(self.sleep_interval);
        }
    }
}

impl PidFileReader for PollingPidFileReader {
    fn pid(&self, path: &Path) -> Result<i32> {
        let contents = self.read_contents(path)?;
        contents
            .trim()
            .parse()
            .map_err(|err: std::num::ParseIntError| ContainerizerError::Parse {
                what: "pid file contents".to_owned(),
                message: err.to_string(),
            })
    }
}

/// Reads pids from the runc pidfiles kept in the depot.
pub struct FilePidGetter {
    depot: Arc<dyn Depot>,
    reader: Arc<dyn PidFileReader>,
}

impl FilePidGetter {
    pub fn new(depot: Arc<dyn Depot>, reader: Arc<dyn PidFileReader>) -> Self {
        FilePidGetter { depot, reader }
    }
}

impl PidGetter for FilePidGetter {
    fn get_pid(&self, handle: &str) -> Result<i32> {
        let bundle_path = self.depot.lookup(handle)?;
        self.reader.pid(&bundle_path.join(PIDFILE))
    }

    /// Peas are containers in their own right, so the sandbox is not consulted.
    fn get_pea_pid(&self, _sandbox_handle: &str, pea_id: &str) -> Result<i32> {
        self.get_pid(pea_id)
    }
}
