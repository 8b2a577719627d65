use std::fs;
use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::error::{ContainerizerError, Result};

#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(default)]
    msg: String,
}

/// Runs a runc command with a fresh JSON log file and returns its stdout.
/// A failure is reported with the last message runc logged, falling back to
/// stderr. Messages about a missing container become `ContainerNotFound`.
pub fn run_runc(handle: &str, context: &str, build: impl FnOnce(&Path) -> Command) -> Result<Vec<u8>> {
    let log = tempfile::Builder::new()
        .prefix("runc-log-")
        .suffix(".json")
        .tempfile()
        .map_err(|err| ContainerizerError::io(std::env::temp_dir(), err))?;

    let mut cmd = build(log.path());
    tracing::trace!(?cmd, "running runc");
    let output = cmd
        .output()
        .map_err(|err| ContainerizerError::io(cmd.get_program(), err))?;

    if output.status.success() {
        return Ok(output.stdout);
    }

    let logged = fs::read(log.path()).ok().and_then(|contents| last_log_message(&contents));
    let message = logged.unwrap_or_else(|| {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if stderr.is_empty() {
            output.status.to_string()
        } else {
            stderr
        }
    });

    tracing::debug!(handle, context, %message, "runc failed");
    Err(runc_error(handle, context, message))
}

pub(crate) fn runc_error(handle: &str, context: &str, message: String) -> ContainerizerError {
    if message.contains("container does not exist") {
        return ContainerizerError::ContainerNotFound {
            handle: handle.to_owned(),
        };
    }
    ContainerizerError::Backend {
        context: context.to_owned(),
        message,
    }
}

/// Last non-empty `msg` in a runc JSON log.
pub(crate) fn last_log_message(contents: &[u8]) -> Option<String> {
    String::from_utf8_lossy(contents)
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<LogLine>(line).ok())
        .map(|line| line.msg)
        .find(|msg| !msg.is_empty())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    fn sh(script: String) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_last_log_message() {
        let log = br#"{"level":"info","msg":"starting","time":"2024-01-01T00:00:00Z"}
{"level":"error","msg":"exec failed: exec: potato: executable file not found in $PATH","time":"2024-01-01T00:00:01Z"}
not json
"#;

        assert_eq!(
            last_log_message(log).as_deref(),
            Some("exec failed: exec: potato: executable file not found in $PATH")
        );
        assert_eq!(last_log_message(b""), None);
    }

    #[test]
    fn test_run_returns_stdout() -> Result<()> {
        let stdout = run_runc("handle", "state", |_| sh("echo hello".to_owned()))?;
        assert_eq!(stdout, b"hello\n");
        Ok(())
    }

    #[test]
    fn test_run_keeps_stdin_set_by_builder() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("stdin");
        fs::write(&input, "from the caller")?;

        let stdout = run_runc("handle", "create", |_| {
            let mut cmd = sh("cat".to_owned());
            cmd.stdin(fs::File::open(&input).unwrap());
            cmd
        })?;

        assert_eq!(stdout, b"from the caller");
        Ok(())
    }

    #[test]
    fn test_run_wraps_logged_message() {
        let err = run_runc("handle", "start", |log| {
            sh(format!(
                r#"echo '{{"level":"error","msg":"cgroup busy"}}' > {}; exit 1"#,
                log.display()
            ))
        })
        .unwrap_err();

        match err {
            ContainerizerError::Backend { context, message } => {
                assert_eq!(context, "start");
                assert_eq!(message, "cgroup busy");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_run_falls_back_to_stderr() {
        let err = run_runc("handle", "kill", |_| sh("echo oops >&2; exit 1".to_owned())).unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[test]
    fn test_missing_container_is_not_found() {
        let err = run_runc("handle", "state", |log| {
            sh(format!(
                r#"echo '{{"level":"error","msg":"container does not exist"}}' > {}; exit 1"#,
                log.display()
            ))
        })
        .unwrap_err();

        assert!(matches!(
            err,
            ContainerizerError::ContainerNotFound { handle } if handle == "handle"
        ));
    }
}
