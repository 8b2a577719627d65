use std::path::Path;
use std::process::{Child, Stdio};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::binary::RuncBinary;
use super::runner::run_runc;
use crate::container_manager::{ContainerStatus, State};
use crate::deleter::{RuntimeDeleter, RuntimeStater};
use crate::error::{ContainerizerError, Result};

/// `runc state` output.
#[derive(Debug, Clone, Deserialize)]
pub struct RuncState {
    pub pid: i32,
    pub status: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

impl From<&RuncState> for State {
    fn from(state: &RuncState) -> Self {
        State {
            pid: state.pid,
            status: state.status.parse().unwrap_or(ContainerStatus::Unknown),
        }
    }
}

/// Stdio handed to the init process by `runc create`.
pub struct InitStdio {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

/// Typed wrapper around the runc command line.
#[derive(Debug, Clone)]
pub struct RuncRuntime {
    binary: RuncBinary,
}

impl RuncRuntime {
    pub fn new(binary: RuncBinary) -> Self {
        RuncRuntime { binary }
    }

    pub fn binary(&self) -> &RuncBinary {
        &self.binary
    }

    #[tracing::instrument(level = "debug", skip(self, stdio))]
    pub fn create(&self, id: &str, bundle: &Path, pid_file: &Path, stdio: InitStdio) -> Result<()> {
        run_runc(id, "runc create", |log| {
            let mut cmd = self.binary.create_command(bundle, pid_file, id, log);
            cmd.stdin(stdio.stdin).stdout(stdio.stdout).stderr(stdio.stderr);
            cmd
        })
        .map(drop)
    }

    pub fn start(&self, id: &str) -> Result<()> {
        run_runc(id, "runc start", |log| self.binary.start_command(id, log)).map(drop)
    }

    pub fn runc_state(&self, id: &str) -> Result<RuncState> {
        let stdout = run_runc(id, "runc state", |log| self.binary.state_command(id, log))?;
        serde_json::from_slice(&stdout).map_err(|err| ContainerizerError::Parse {
            what: "runc state".to_owned(),
            message: err.to_string(),
        })
    }

    pub fn kill(&self, id: &str, signal: i32) -> Result<()> {
        run_runc(id, "runc kill", |log| self.binary.kill_command(id, signal, log)).map(drop)
    }

    pub fn stats(&self, id: &str) -> Result<Vec<u8>> {
        run_runc(id, "runc events --stats", |log| {
            self.binary.stats_command(id, log)
        })
    }

    /// Spawns `runc events` with a piped stdout.
    pub fn spawn_events(&self, id: &str) -> Result<Child> {
        let mut cmd = self.binary.events_command(id);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| ContainerizerError::io(cmd.get_program(), err))
    }
}

impl RuntimeStater for RuncRuntime {
    fn state(&self, handle: &str) -> Result<State> {
        Ok(State::from(&self.runc_state(handle)?))
    }
}

impl RuntimeDeleter for RuncRuntime {
    fn delete(&self, handle: &str, force: bool) -> Result<()> {
        run_runc(handle, "runc delete", |log| {
            self.binary.delete_command(handle, force, log)
        })
        .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_parse_runc_state() -> Result<()> {
        let state: RuncState = serde_json::from_str(
            r#"{
                "ociVersion": "1.0.2",
                "id": "handle",
                "pid": 4321,
                "status": "running",
                "bundle": "/depot/handle",
                "rootfs": "/depot/handle/rootfs",
                "created": "2024-05-01T10:00:00.123456789Z",
                "owner": ""
            }"#,
        )?;

        assert_eq!(
            State::from(&state),
            State {
                pid: 4321,
                status: ContainerStatus::Running
            }
        );
        assert_eq!(state.created.map(|c| c.timestamp()), Some(1714557600));
        Ok(())
    }

    #[test]
    fn test_unknown_status() -> Result<()> {
        let state: RuncState = serde_json::from_str(r#"{"pid": 0, "status": "weird"}"#)?;

        assert_eq!(State::from(&state).status, ContainerStatus::Unknown);
        assert!(state.created.is_none());
        Ok(())
    }
}
