//! Wires the configured runtime driver into a containerizer.

use std::sync::Arc;

use anyhow::{Context, Result};

use libcontainerizer::backing_process::ProcessManager;
use libcontainerizer::cgroup_manager::RuntimeCgroupManager;
use libcontainerizer::container_manager::{BackendExecer, ContainerManager, Execer};
use libcontainerizer::containerd::{
    DaemonClient, GrpcClient, NerdContainerManager, NerdMetrics, NerdProcessManager,
};
use libcontainerizer::containerizer::{Containerizer, ContainerizerBuilder};
use libcontainerizer::depot::DirDepot;
use libcontainerizer::pid::{
    ContainerPidGetter, FilePidGetter, PidGetter, PollingPidFileReader, SystemClock,
};
use libcontainerizer::runc::{RuncBinary, RuncContainerManager, RuncRuntime, RuncStatser};

use crate::config::{DaemonConfig, RuntimeBackend};

const PROCESSES_DIR: &str = "processes";

pub struct Backend {
    pub containerizer: Containerizer,
    pub processes: Arc<dyn ProcessManager>,
    pub pids: Arc<dyn PidGetter>,
    runc: Option<Arc<RuncContainerManager>>,
}

impl Backend {
    pub fn open(config: &DaemonConfig) -> Result<Self> {
        match config.backend {
            RuntimeBackend::Runc => open_runc(config),
            RuntimeBackend::Containerd => open_containerd(config),
        }
    }

    /// Resumes OOM watching for containers that outlived a previous daemon.
    /// containerd keeps its own subscription, so only runc needs it.
    pub fn watch_existing(&self) -> Result<()> {
        if let Some(runc) = &self.runc {
            runc.watch_existing()
                .context("failed to watch existing containers")?;
        }
        Ok(())
    }
}

fn runc_manager(
    config: &DaemonConfig,
    runtime: RuncRuntime,
    depot: Arc<DirDepot>,
) -> RuncContainerManager {
    RuncContainerManager::new(runtime, depot).with_exec_timeout(config.pidfile_timeout())
}

fn open_runc(config: &DaemonConfig) -> Result<Backend> {
    tracing::debug!(root = ?config.runc_root, depot = ?config.depot_dir, "using runc backend");
    let depot = Arc::new(DirDepot::new(config.depot_dir.clone()));
    let runtime = RuncRuntime::new(RuncBinary::new(
        config.runc_binary.clone(),
        config.runc_root.clone(),
    ));
    let manager = Arc::new(runc_manager(config, runtime.clone(), Arc::clone(&depot)));

    let processes: Arc<dyn ProcessManager> = Arc::new(manager.process_manager());
    let containers: Arc<dyn ContainerManager> = manager.clone();
    let execer: Arc<dyn Execer> = Arc::new(BackendExecer::new(
        Arc::clone(&containers),
        Arc::clone(&processes),
    ));
    let reader = Arc::new(PollingPidFileReader::new(
        Box::new(SystemClock),
        config.pidfile_timeout(),
        config.pidfile_poll_interval(),
    ));

    let containerizer = ContainerizerBuilder::new(
        containers,
        Arc::clone(&processes),
        execer,
        Arc::new(RuntimeCgroupManager::new(config.runc_root.clone(), "")),
        Arc::new(RuncStatser::new(runtime, depot.clone())),
        manager.clone(),
        depot.clone(),
    )
    .with_depot_dir(config.depot_dir.clone())
    .with_cleanup_process_dirs_on_wait(config.cleanup_process_dirs_on_wait)
    .build()?;

    Ok(Backend {
        containerizer,
        processes,
        pids: Arc::new(FilePidGetter::new(depot, reader)),
        runc: Some(manager),
    })
}

fn open_containerd(config: &DaemonConfig) -> Result<Backend> {
    tracing::debug!(
        socket = ?config.containerd_socket,
        namespace = %config.containerd_namespace,
        "using containerd backend"
    );
    let client: Arc<dyn DaemonClient> = Arc::new(
        GrpcClient::connect(&config.containerd_socket, &config.containerd_namespace)
            .with_context(|| {
                format!("failed to connect to {}", config.containerd_socket.display())
            })?,
    );
    let depot = Arc::new(DirDepot::new(config.depot_dir.clone()));
    let manager = Arc::new(NerdContainerManager::new(Arc::clone(&client)));
    let containers: Arc<dyn ContainerManager> = manager.clone();
    let processes: Arc<dyn ProcessManager> =
        Arc::new(NerdProcessManager::new(Arc::clone(&client)));

    let execer: Arc<dyn Execer> = if config.use_containerd_for_processes {
        Arc::new(BackendExecer::new(
            Arc::clone(&containers),
            Arc::clone(&processes),
        ))
    } else {
        // the shim's runc state lives at <runc root>/<namespace>
        let root = config
            .containerd_runc_root
            .join(&config.containerd_namespace);
        let runtime = RuncRuntime::new(RuncBinary::new(config.runc_binary.clone(), root));
        Arc::new(
            runc_manager(config, runtime, Arc::clone(&depot))
                .with_process_root(config.depot_dir.join(PROCESSES_DIR)),
        )
    };

    let containerizer = ContainerizerBuilder::new(
        Arc::clone(&containers),
        Arc::clone(&processes),
        execer,
        Arc::new(RuntimeCgroupManager::new(
            config.containerd_runc_root.clone(),
            &config.containerd_namespace,
        )),
        Arc::new(NerdMetrics::new(client)),
        manager,
        depot,
    )
    .with_depot_dir(config.depot_dir.clone())
    .with_cleanup_process_dirs_on_wait(config.cleanup_process_dirs_on_wait)
    .build()?;

    Ok(Backend {
        containerizer,
        processes,
        pids: Arc::new(ContainerPidGetter::new(containers)),
        runc: None,
    })
}
