//! The lifecycle API the daemon exposes, composed from a container backend
//! and its collaborators.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};

use crate::backing_process::ProcessManager;
use crate::bundle::{
    container_root_host_id, BundleSpec, CONTAINER_TYPE_ANNOTATION, GARDEN_INIT_CONTAINER_TYPE,
    PEA_CONTAINER_TYPE, SANDBOX_CONTAINER_ANNOTATION,
};
use crate::cgroup_manager::CgroupManager;
use crate::container_manager::{
    ContainerFilter, ContainerManager, ContainerManagerPeaManager, Event, Execer,
    PeaHandlesGetter, RuntimeStopper, State, VolumeDestroyer,
};
use crate::error::{classify_exec_error, ContainerizerError, Result};
use crate::io::ProcessIo;
use crate::metrics::{ContainerMetrics, MetricsCollector};
use crate::process::{PeaProcess, Process};
use crate::process_builder::{ProcessBuilder, ProcessSpec};
use crate::user::{Mkdirer, PasswdLookupper, RootfsMkdirer, UserLookupper, DEFAULT_USER};

const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(1);
const WORKDIR_MODE: u32 = 0o755;

pub struct ContainerizerBuilder {
    containers: Arc<dyn ContainerManager>,
    processes: Arc<dyn ProcessManager>,
    execer: Arc<dyn Execer>,
    cgroups: Arc<dyn CgroupManager>,
    metrics: Arc<dyn MetricsCollector>,
    stopper: Arc<dyn RuntimeStopper>,
    volumes: Arc<dyn VolumeDestroyer>,
    users: Arc<dyn UserLookupper>,
    mkdirer: Arc<dyn Mkdirer>,
    process_builder: ProcessBuilder,
    depot_dir: PathBuf,
    cleanup_process_dirs_on_wait: bool,
}

impl ContainerizerBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        containers: Arc<dyn ContainerManager>,
        processes: Arc<dyn ProcessManager>,
        execer: Arc<dyn Execer>,
        cgroups: Arc<dyn CgroupManager>,
        metrics: Arc<dyn MetricsCollector>,
        stopper: Arc<dyn RuntimeStopper>,
        volumes: Arc<dyn VolumeDestroyer>,
    ) -> Self {
        ContainerizerBuilder {
            containers,
            processes,
            execer,
            cgroups,
            metrics,
            stopper,
            volumes,
            users: Arc::new(PasswdLookupper),
            mkdirer: Arc::new(RootfsMkdirer),
            process_builder: ProcessBuilder::default(),
            depot_dir: PathBuf::from("/var/lib/containerizer/depot"),
            cleanup_process_dirs_on_wait: false,
        }
    }

    pub fn with_user_lookupper(mut self, users: Arc<dyn UserLookupper>) -> Self {
        self.users = users;
        self
    }

    pub fn with_mkdirer(mut self, mkdirer: Arc<dyn Mkdirer>) -> Self {
        self.mkdirer = mkdirer;
        self
    }

    pub fn with_process_builder(mut self, process_builder: ProcessBuilder) -> Self {
        self.process_builder = process_builder;
        self
    }

    pub fn with_depot_dir<P: Into<PathBuf>>(mut self, depot_dir: P) -> Self {
        self.depot_dir = depot_dir.into();
        self
    }

    pub fn with_cleanup_process_dirs_on_wait(mut self, cleanup: bool) -> Self {
        self.cleanup_process_dirs_on_wait = cleanup;
        self
    }

    /// Builds the containerizer and starts forwarding OOM events.
    pub fn build(self) -> Result<Containerizer> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let containers = Arc::clone(&self.containers);
        let forwarder = thread::Builder::new()
            .name("oom-events".to_owned())
            .spawn(move || forward_oom_events(containers, events_tx, shutdown_rx))
            .map_err(|err| ContainerizerError::io("oom-events thread", err))?;

        Ok(Containerizer {
            containers: self.containers,
            processes: self.processes,
            execer: self.execer,
            cgroups: self.cgroups,
            metrics: self.metrics,
            stopper: self.stopper,
            volumes: self.volumes,
            users: self.users,
            mkdirer: self.mkdirer,
            process_builder: self.process_builder,
            depot_dir: self.depot_dir,
            cleanup_process_dirs_on_wait: self.cleanup_process_dirs_on_wait,
            events: events_rx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            forwarder: Mutex::new(Some(forwarder)),
        })
    }
}

pub struct Containerizer {
    containers: Arc<dyn ContainerManager>,
    processes: Arc<dyn ProcessManager>,
    execer: Arc<dyn Execer>,
    cgroups: Arc<dyn CgroupManager>,
    metrics: Arc<dyn MetricsCollector>,
    stopper: Arc<dyn RuntimeStopper>,
    volumes: Arc<dyn VolumeDestroyer>,
    users: Arc<dyn UserLookupper>,
    mkdirer: Arc<dyn Mkdirer>,
    process_builder: ProcessBuilder,
    depot_dir: PathBuf,
    cleanup_process_dirs_on_wait: bool,
    events: Receiver<Event>,
    shutdown: Mutex<Option<Sender<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Containerizer {
    /// Creates and starts container `handle`. Bundles without a container
    /// type are treated as garden init containers.
    #[tracing::instrument(level = "info", skip(self, bundle, io))]
    pub fn create(&self, handle: &str, bundle: &BundleSpec, io: Arc<dyn ProcessIo>) -> Result<()> {
        let bundle = match bundle.container_type() {
            Some(_) => bundle.clone(),
            None => bundle.with_annotation(CONTAINER_TYPE_ANNOTATION, GARDEN_INIT_CONTAINER_TYPE),
        };
        let bundle = self.cgroups.set_unified_resources(&bundle)?;

        let root_uid = container_root_host_id(bundle.uid_mappings());
        let root_gid = container_root_host_id(bundle.gid_mappings());
        self.containers
            .create(handle, &bundle, root_uid, root_gid, io)?;

        self.cgroups.set_use_memory_hierarchy(handle)
    }

    /// Starts a process in a running container.
    #[tracing::instrument(level = "info", skip(self, spec, io), fields(path = %spec.path))]
    pub fn exec(&self, handle: &str, spec: &ProcessSpec, io: Arc<dyn ProcessIo>) -> Result<Process> {
        let bundle = self.containers.spec(handle)?;
        let state = self.containers.state(handle)?;
        let rootfs = PathBuf::from(format!("/proc/{}/root", state.pid));

        let user_name = if spec.user.is_empty() {
            DEFAULT_USER
        } else {
            spec.user.as_str()
        };
        let user = self.users.lookup(&rootfs, user_name)?;

        let mut spec = spec.clone();
        if spec.dir.is_empty() {
            spec.dir = user.home.to_string_lossy().into_owned();
        }

        let root_uid = container_root_host_id(bundle.uid_mappings());
        let root_gid = container_root_host_id(bundle.gid_mappings());
        self.mkdirer
            .mkdir_as(&rootfs, root_uid, root_gid, WORKDIR_MODE, Path::new(&spec.dir))?;

        let process = self.process_builder.build_process(&bundle, &spec, &user)?;
        let process_id = if spec.id.is_empty() {
            generate_process_id()
        } else {
            spec.id.clone()
        };

        self.execer
            .exec(handle, &process_id, &process, Arc::clone(&io))
            .map_err(|err| match err {
                ContainerizerError::Backend { context, message } => {
                    classify_exec_error(&context, message)
                }
                other => other,
            })?;

        let backing = self.execer.attach(handle, &process_id, io)?;
        Ok(Process::new(
            handle,
            &process_id,
            backing,
            self.cleanup_process_dirs_on_wait,
        ))
    }

    #[tracing::instrument(level = "info", skip(self, io))]
    pub fn attach(&self, handle: &str, process_id: &str, io: Arc<dyn ProcessIo>) -> Result<Process> {
        let backing = self
            .execer
            .attach(handle, process_id, io)
            .map_err(|err| match err {
                err if err.is_not_found() => ContainerizerError::ProcessNotFound {
                    handle: handle.to_owned(),
                    process_id: process_id.to_owned(),
                },
                other => other,
            })?;

        Ok(Process::new(
            handle,
            process_id,
            backing,
            self.cleanup_process_dirs_on_wait,
        ))
    }

    /// Creates pea `pea_id` inside `sandbox_handle` and returns its init
    /// process. Waiting on it tears the pea down.
    #[tracing::instrument(level = "info", skip(self, bundle, io))]
    pub fn run_pea(
        &self,
        sandbox_handle: &str,
        pea_id: &str,
        bundle: &BundleSpec,
        io: Arc<dyn ProcessIo>,
    ) -> Result<PeaProcess> {
        let bundle = bundle
            .with_annotation(CONTAINER_TYPE_ANNOTATION, PEA_CONTAINER_TYPE)
            .with_annotation(SANDBOX_CONTAINER_ANNOTATION, sandbox_handle);

        let root_uid = container_root_host_id(bundle.uid_mappings());
        let root_gid = container_root_host_id(bundle.gid_mappings());
        self.containers
            .create(pea_id, &bundle, root_uid, root_gid, Arc::clone(&io))?;

        let backing = self.processes.get_task(pea_id, io)?;
        let process = Process::new(pea_id, pea_id, backing, self.cleanup_process_dirs_on_wait);

        Ok(PeaProcess::new(
            process,
            Arc::new(ContainerManagerPeaManager(Arc::clone(&self.containers))),
            Arc::clone(&self.volumes),
        ))
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn delete(&self, handle: &str) -> Result<()> {
        self.containers.delete(handle)?;
        self.execer.release(handle);
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn remove_bundle(&self, handle: &str) -> Result<()> {
        self.containers.remove_bundle(handle)
    }

    pub fn state(&self, handle: &str) -> Result<State> {
        self.containers.state(handle)
    }

    pub fn stats(&self, handle: &str) -> Result<ContainerMetrics> {
        self.metrics.collect(handle)
    }

    /// OOM events of every container. Receivers share one queue.
    pub fn events(&self) -> Receiver<Event> {
        self.events.clone()
    }

    pub fn bundle_info(&self, handle: &str) -> Result<(PathBuf, BundleSpec)> {
        let bundle = self.containers.spec(handle).map_err(|err| match err {
            err if err.is_not_found() => ContainerizerError::ContainerNotFound {
                handle: handle.to_owned(),
            },
            other => other,
        })?;

        Ok((self.depot_dir.join(handle), bundle))
    }

    pub fn container_handles(&self) -> Result<Vec<String>> {
        self.containers.bundle_ids(&[ContainerFilter::equal(
            CONTAINER_TYPE_ANNOTATION,
            GARDEN_INIT_CONTAINER_TYPE,
        )])
    }

    /// Stops the event forwarder and then the runtime itself. Calling it
    /// again only stops the runtime.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn stop(&self) -> Result<()> {
        drop(
            self.shutdown
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );

        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(forwarder) = forwarder {
            if forwarder.join().is_err() {
                tracing::error!("oom event forwarder panicked");
            }
        }

        self.stopper.stop()
    }
}

impl PeaHandlesGetter for Containerizer {
    fn container_pea_handles(&self, sandbox_handle: &str) -> Result<Vec<String>> {
        self.containers.bundle_ids(&[
            ContainerFilter::equal(CONTAINER_TYPE_ANNOTATION, PEA_CONTAINER_TYPE),
            ContainerFilter::equal(SANDBOX_CONTAINER_ANNOTATION, sandbox_handle),
        ])
    }
}

fn generate_process_id() -> String {
    format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..))
}

/// Copies backend OOM events to `events` until `shutdown` is closed,
/// subscribing again whenever the backend stream ends.
fn forward_oom_events(
    containers: Arc<dyn ContainerManager>,
    events: Sender<Event>,
    shutdown: Receiver<()>,
) {
    loop {
        let upstream = match containers.oom_events() {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::warn!(%err, "subscribing to oom events failed");
                select! {
                    recv(shutdown) -> _ => return,
                    default(RESUBSCRIBE_INTERVAL) => continue,
                }
            }
        };

        loop {
            select! {
                recv(shutdown) -> _ => return,
                recv(upstream) -> event => match event {
                    Ok(event) => {
                        tracing::debug!(container_id = %event.container_id, "forwarding oom event");
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        tracing::debug!("oom event stream closed, resubscribing");
                        break;
                    }
                },
            }
        }
    }
}
