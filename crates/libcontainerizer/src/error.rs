use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex::Regex;

/// Error taxonomy shared by both runtime drivers. Callers branch on the
/// not-found variants; everything else is propagated with context.
#[derive(Debug, thiserror::Error)]
pub enum ContainerizerError {
    #[error("container {handle} not found")]
    ContainerNotFound { handle: String },
    #[error("task for container {handle} not found")]
    TaskNotFound { handle: String },
    #[error("process {process_id} not found in container {handle}")]
    ProcessNotFound { handle: String, process_id: String },
    #[error("container {handle} already exists")]
    AlreadyExists { handle: String },
    #[error("executable not found: {message}")]
    ExecutableNotFound { message: String },
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        what: String,
        timeout: std::time::Duration,
    },
    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },
    #[error("cleaning up pea {pea_id} which exited with {exit_code}")]
    PeaCleanup {
        pea_id: String,
        exit_code: i32,
        #[source]
        source: Arc<ContainerizerError>,
    },
    #[error("invalid signal: {0}")]
    InvalidSignal(#[from] crate::signal::SignalError<i32>),
    #[error("failed to access {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("state file {path:?} is malformed")]
    StateFile {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("cgroup: {0}")]
    Cgroup(String),
    #[error("{context}: {message}")]
    Backend { context: String, message: String },
}

pub type Result<T> = std::result::Result<T, ContainerizerError>;

impl ContainerizerError {
    pub fn backend(context: impl Into<String>, message: impl ToString) -> Self {
        ContainerizerError::Backend {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ContainerizerError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for every flavour of "the thing is already gone".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ContainerizerError::ContainerNotFound { .. }
                | ContainerizerError::TaskNotFound { .. }
                | ContainerizerError::ProcessNotFound { .. }
        )
    }
}

/// Translates the raw text of a failed exec into the error taxonomy. The
/// runtime only reports a missing binary through its message, so this is the
/// one place that knows those message formats.
pub fn classify_exec_error(context: &str, message: String) -> ContainerizerError {
    if exec_not_found_regex().is_some_and(|re| re.is_match(&message)) {
        return ContainerizerError::ExecutableNotFound { message };
    }

    ContainerizerError::Backend {
        context: context.to_owned(),
        message,
    }
}

// Matches the runc wording for a binary that cannot be found or stat'ed,
// both the legacy "starting container process caused" prefix and the current
// "unable to start container process" one.
const EXEC_NOT_FOUND: &str = r#"(starting container process caused|unable to start container process):? "?exec: [^:]+: (executable file not found in \$PATH|stat [^:]+: no such file or directory)"#;

fn exec_not_found_regex() -> Option<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(EXEC_NOT_FOUND)).as_ref().ok()
}
