//! Synchronous view of the containerd API used by the nerd driver. The gRPC
//! implementation lives in `grpc`; tests substitute a recording fake.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crossbeam_channel::Receiver;

use crate::container_manager::{ContainerStatus, Event};
use crate::error::ContainerizerError;
use crate::io::{path_string, ProcessIo};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("containerd returned {code:?}: {message}")]
    Status { code: tonic::Code, message: String },
    #[error("failed to connect to containerd at {socket:?}: {message}")]
    Connect { socket: PathBuf, message: String },
    #[error("failed to encode {what}: {message}")]
    Codec { what: String, message: String },
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

impl From<tonic::Status> for ClientError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_owned();
        match status.code() {
            tonic::Code::NotFound => ClientError::NotFound(message),
            tonic::Code::AlreadyExists => ClientError::AlreadyExists(message),
            tonic::Code::FailedPrecondition => ClientError::FailedPrecondition(message),
            tonic::Code::DeadlineExceeded => ClientError::DeadlineExceeded(message),
            code => ClientError::Status { code, message },
        }
    }
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    /// Folds the error into the crate taxonomy. `missing` builds what a
    /// not-found answer means for the call that produced it.
    pub(crate) fn into_containerizer(
        self,
        handle: &str,
        context: &str,
        missing: impl FnOnce(String) -> ContainerizerError,
    ) -> ContainerizerError {
        match self {
            ClientError::NotFound(_) => missing(handle.to_owned()),
            ClientError::AlreadyExists(_) => ContainerizerError::AlreadyExists {
                handle: handle.to_owned(),
            },
            other => ContainerizerError::backend(context, other),
        }
    }
}

/// Container record as stored by containerd.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerRecord {
    pub labels: HashMap<String, String>,
    /// JSON encoded runtime spec.
    pub spec: Vec<u8>,
    pub created_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: u32,
    pub status: ContainerStatus,
    pub exit_status: u32,
}

/// Stdio paths as containerd wants them; an empty string means none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIo {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

impl TaskIo {
    pub fn from_io(io: &dyn ProcessIo) -> Self {
        TaskIo {
            stdin: path_string(io.stdin()),
            stdout: path_string(io.stdout()),
            stderr: path_string(io.stderr()),
            terminal: io.terminal(),
        }
    }
}

/// An empty `exec_id` addresses the init process of the task.
pub trait DaemonClient: Send + Sync {
    fn create_container(
        &self,
        id: &str,
        labels: HashMap<String, String>,
        spec: Vec<u8>,
    ) -> ClientResult<()>;
    fn get_container(&self, id: &str) -> ClientResult<ContainerRecord>;
    /// Ids of the containers matching a containerd filter expression.
    fn list_containers(&self, filter: &str) -> ClientResult<Vec<String>>;
    fn delete_container(&self, id: &str) -> ClientResult<()>;

    fn create_task(&self, id: &str, io: &TaskIo, io_uid: u32, io_gid: u32) -> ClientResult<u32>;
    fn start(&self, id: &str, exec_id: &str) -> ClientResult<u32>;
    fn task(&self, id: &str, exec_id: &str) -> ClientResult<TaskInfo>;
    fn kill(&self, id: &str, exec_id: &str, signal: u32, all: bool) -> ClientResult<()>;
    /// Exit status of the process. `None` waits forever.
    fn wait(&self, id: &str, exec_id: &str, timeout: Option<Duration>) -> ClientResult<u32>;
    fn delete_task(&self, id: &str) -> ClientResult<()>;
    fn delete_process(&self, id: &str, exec_id: &str) -> ClientResult<()>;
    /// Registers process `exec_id` from a JSON encoded OCI process. It still
    /// has to be started.
    fn exec(&self, id: &str, exec_id: &str, process: Vec<u8>, io: &TaskIo) -> ClientResult<()>;
    fn metrics(&self, id: &str) -> ClientResult<Option<prost_types::Any>>;

    /// OOM events for every task in the namespace. The receiver disconnects
    /// when the subscription ends.
    fn subscribe_oom(&self) -> ClientResult<Receiver<Event>>;
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::PathIo;

    #[test]
    fn test_status_codes_are_classified() {
        assert!(ClientError::from(tonic::Status::not_found("no such task")).is_not_found());
        assert!(matches!(
            ClientError::from(tonic::Status::already_exists("id")),
            ClientError::AlreadyExists(_)
        ));
        assert!(matches!(
            ClientError::from(tonic::Status::failed_precondition("stopped")),
            ClientError::FailedPrecondition(_)
        ));
        match ClientError::from(tonic::Status::internal("boom")) {
            ClientError::Status { code, message } => {
                assert_eq!(code, tonic::Code::Internal);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_into_containerizer() {
        let task_missing = |handle| ContainerizerError::TaskNotFound { handle };

        let err = ClientError::NotFound("task".to_owned())
            .into_containerizer("handle", "kill", task_missing);
        assert!(matches!(err, ContainerizerError::TaskNotFound { handle } if handle == "handle"));

        let err = ClientError::AlreadyExists("handle".to_owned())
            .into_containerizer("handle", "create", task_missing);
        assert!(matches!(err, ContainerizerError::AlreadyExists { .. }));

        let err = ClientError::FailedPrecondition("stopped".to_owned())
            .into_containerizer("handle", "kill", task_missing);
        assert_eq!(err.to_string(), "kill: failed precondition: stopped");
    }

    #[test]
    fn test_task_io_from_process_io() {
        let io = PathIo {
            stdout: Some(PathBuf::from("/tmp/out")),
            terminal: true,
            ..Default::default()
        };
        assert_eq!(
            TaskIo::from_io(&io),
            TaskIo {
                stdout: "/tmp/out".to_owned(),
                terminal: true,
                ..Default::default()
            }
        );
    }
}
