use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const DEFAULT_RUNC_BINARY: &str = "runc";
pub const DEFAULT_RUNC_ROOT: &str = "/run/runc";

/// Builds runc command lines. Every command shares the same state root so
/// the containers stay visible across daemon restarts.
#[derive(Debug, Clone)]
pub struct RuncBinary {
    path: PathBuf,
    root: PathBuf,
}

impl Default for RuncBinary {
    fn default() -> Self {
        RuncBinary::new(DEFAULT_RUNC_BINARY, DEFAULT_RUNC_ROOT)
    }
}

impl RuncBinary {
    pub fn new<P: Into<PathBuf>, R: Into<PathBuf>>(path: P, root: R) -> Self {
        RuncBinary {
            path: path.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stdin defaults to /dev/null; callers that hand stdio to a container
    /// process override it.
    fn command(&self, log_file: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.stdin(Stdio::null());
        cmd.arg("--root").arg(&self.root);
        if let Some(log_file) = log_file {
            cmd.arg("--log")
                .arg(log_file)
                .arg("--log-format")
                .arg("json");
        }
        cmd
    }

    pub fn create_command(&self, bundle: &Path, pid_file: &Path, id: &str, log_file: &Path) -> Command {
        let mut cmd = self.command(Some(log_file));
        cmd.arg("create")
            .arg("--no-new-keyring")
            .arg("--bundle")
            .arg(bundle)
            .arg("--pid-file")
            .arg(pid_file)
            .arg(id);
        cmd
    }

    pub fn start_command(&self, id: &str, log_file: &Path) -> Command {
        let mut cmd = self.command(Some(log_file));
        cmd.arg("start").arg(id);
        cmd
    }

    /// Runs in the foreground: the exit status of runc is the exit status of
    /// the process.
    pub fn exec_command(&self, id: &str, pid_file: &Path, process_json: &Path, log_file: &Path) -> Command {
        let mut cmd = self.command(Some(log_file));
        cmd.arg("exec")
            .arg("--pid-file")
            .arg(pid_file)
            .arg("-p")
            .arg(process_json)
            .arg(id);
        cmd
    }

    pub fn state_command(&self, id: &str, log_file: &Path) -> Command {
        let mut cmd = self.command(Some(log_file));
        cmd.arg("state").arg(id);
        cmd
    }

    /// Streams container events as JSON lines until the container goes away.
    pub fn events_command(&self, id: &str) -> Command {
        let mut cmd = self.command(None);
        cmd.arg("events").arg(id);
        cmd
    }

    pub fn stats_command(&self, id: &str, log_file: &Path) -> Command {
        let mut cmd = self.command(Some(log_file));
        cmd.arg("events").arg("--stats").arg(id);
        cmd
    }

    pub fn kill_command(&self, id: &str, signal: i32, log_file: &Path) -> Command {
        let mut cmd = self.command(Some(log_file));
        cmd.arg("kill").arg(id).arg(signal.to_string());
        cmd
    }

    pub fn delete_command(&self, id: &str, force: bool, log_file: &Path) -> Command {
        let mut cmd = self.command(Some(log_file));
        cmd.arg("delete");
        if force {
            cmd.arg("--force");
        }
        cmd.arg(id);
        cmd
    }
}
