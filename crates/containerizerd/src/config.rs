//! Daemon configuration. Values come from an optional JSON file and are then
//! overridden by command line flags.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use libcontainerizer::containerd::{DEFAULT_CONTAINERD_SOCKET, DEFAULT_NAMESPACE};
use libcontainerizer::pid::{DEFAULT_PIDFILE_SLEEP_INTERVAL, DEFAULT_PIDFILE_TIMEOUT};
use libcontainerizer::runc::{DEFAULT_RUNC_BINARY, DEFAULT_RUNC_ROOT};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/containerizerd/config.json";
pub const DEFAULT_DEPOT_DIR: &str = "/var/lib/containerizer/depot";
/// Where the containerd runc shim keeps its runc state, one directory per
/// namespace.
pub const DEFAULT_CONTAINERD_RUNC_ROOT: &str = "/run/containerd/runc";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    #[default]
    Runc,
    Containerd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub backend: RuntimeBackend,
    pub runc_binary: PathBuf,
    pub runc_root: PathBuf,
    pub depot_dir: PathBuf,
    pub containerd_socket: PathBuf,
    pub containerd_namespace: String,
    pub containerd_runc_root: PathBuf,
    /// Run exec'd processes through containerd instead of runc when the
    /// containerd backend is active.
    pub use_containerd_for_processes: bool,
    pub cleanup_process_dirs_on_wait: bool,
    pub pidfile_timeout_ms: u64,
    pub pidfile_poll_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            backend: RuntimeBackend::default(),
            runc_binary: PathBuf::from(DEFAULT_RUNC_BINARY),
            runc_root: PathBuf::from(DEFAULT_RUNC_ROOT),
            depot_dir: PathBuf::from(DEFAULT_DEPOT_DIR),
            containerd_socket: PathBuf::from(DEFAULT_CONTAINERD_SOCKET),
            containerd_namespace: DEFAULT_NAMESPACE.to_owned(),
            containerd_runc_root: PathBuf::from(DEFAULT_CONTAINERD_RUNC_ROOT),
            use_containerd_for_processes: false,
            cleanup_process_dirs_on_wait: false,
            pidfile_timeout_ms: DEFAULT_PIDFILE_TIMEOUT.as_millis() as u64,
            pidfile_poll_interval_ms: DEFAULT_PIDFILE_SLEEP_INTERVAL.as_millis() as u64,
        }
    }
}

/// Command line flags that take precedence over the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Runtime backend
    #[clap(long, value_enum)]
    pub backend: Option<RuntimeBackend>,
    /// Directory holding container bundles
    #[clap(long)]
    pub depot: Option<PathBuf>,
    #[clap(long)]
    pub runc_binary: Option<PathBuf>,
    /// State directory passed to runc as --root
    #[clap(long)]
    pub runc_root: Option<PathBuf>,
    #[clap(long)]
    pub containerd_socket: Option<PathBuf>,
    #[clap(long)]
    pub containerd_namespace: Option<String>,
    #[clap(long)]
    pub use_containerd_for_processes: Option<bool>,
    /// Remove process state once a waited process has exited
    #[clap(long)]
    pub cleanup_process_dirs_on_wait: bool,
}

impl DaemonConfig {
    /// Reads `path`. A missing file at the default location means defaults;
    /// a missing file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };

        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound && !explicit => {
                tracing::debug!(?path, "no config file, using defaults");
                return Ok(DaemonConfig::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        serde_json::from_slice(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn apply(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if let Some(depot) = &overrides.depot {
            self.depot_dir = depot.clone();
        }
        if let Some(binary) = &overrides.runc_binary {
            self.runc_binary = binary.clone();
        }
        if let Some(root) = &overrides.runc_root {
            self.runc_root = root.clone();
        }
        if let Some(socket) = &overrides.containerd_socket {
            self.containerd_socket = socket.clone();
        }
        if let Some(namespace) = &overrides.containerd_namespace {
            self.containerd_namespace = namespace.clone();
        }
        if let Some(use_containerd) = overrides.use_containerd_for_processes {
            self.use_containerd_for_processes = use_containerd;
        }
        if overrides.cleanup_process_dirs_on_wait {
            self.cleanup_process_dirs_on_wait = true;
        }
        self
    }

    pub fn pidfile_timeout(&self) -> Duration {
        Duration::from_millis(self.pidfile_timeout_ms)
    }

    pub fn pidfile_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pidfile_poll_interval_ms)
    }
}
