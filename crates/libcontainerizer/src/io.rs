//! Standard streams handed to a runtime for a container or exec'd process.
//! Streams are passed as paths (files or fifos) so that both the runc child
//! and the containerd shim can open them directly.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::error::{ContainerizerError, Result};

pub trait ProcessIo: Send + Sync + std::fmt::Debug {
    fn stdin(&self) -> Option<&Path>;
    fn stdout(&self) -> Option<&Path>;
    fn stderr(&self) -> Option<&Path>;

    fn terminal(&self) -> bool {
        false
    }

    /// Blocks until every output stream has been drained.
    fn wait(&self) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathIo {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub terminal: bool,
}

impl ProcessIo for PathIo {
    fn stdin(&self) -> Option<&Path> {
        self.stdin.as_deref()
    }

    fn stdout(&self) -> Option<&Path> {
        self.stdout.as_deref()
    }

    fn stderr(&self) -> Option<&Path> {
        self.stderr.as_deref()
    }

    fn terminal(&self) -> bool {
        self.terminal
    }
}

/// Discards all output and provides an empty stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullIo;

impl ProcessIo for NullIo {
    fn stdin(&self) -> Option<&Path> {
        None
    }

    fn stdout(&self) -> Option<&Path> {
        None
    }

    fn stderr(&self) -> Option<&Path> {
        None
    }
}

pub(crate) fn stdin_for(path: Option<&Path>) -> Result<Stdio> {
    match path {
        Some(path) => File::open(path)
            .map(Stdio::from)
            .map_err(|err| ContainerizerError::io(path, err)),
        None => Ok(Stdio::null()),
    }
}

pub(crate) fn output_for(path: Option<&Path>) -> Result<Stdio> {
    match path {
        Some(path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Stdio::from)
            .map_err(|err| ContainerizerError::io(path, err)),
        None => Ok(Stdio::null()),
    }
}

/// Path form used by the containerd API, where an empty string means "none".
pub(crate) fn path_string(path: Option<&Path>) -> String {
    path.map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_output_for_creates_missing_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("stdout");

        let _ = output_for(Some(&path))?;

        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn test_missing_stdin_is_an_error() {
        let err = stdin_for(Some(Path::new("/does/not/exist"))).unwrap_err();
        assert!(matches!(err, ContainerizerError::Io { .. }));
    }

    #[test]
    fn test_path_string() {
        let io = PathIo {
            stdout: Some(PathBuf::from("/tmp/out")),
            ..Default::default()
        };
        assert_eq!(path_string(io.stdout()), "/tmp/out");
        assert_eq!(path_string(io.stdin()), "");
        assert_eq!(path_string(NullIo.stderr()), "");
    }
}
