use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use nix::unistd::{chown, Gid, Uid};
use oci_spec::runtime::Process;

use super::events::OomWatcher;
use super::process::{exit_code, ExecChild, ProcessRegistry, RuncProcessManager};
use super::runner::{last_log_message, runc_error};
use super::runtime::{InitStdio, RuncRuntime};
use crate::bundle::BundleSpec;
use crate::backing_process::{BackingProcess, ProcessManager};
use crate::container_manager::{
    ContainerFilter, ContainerManager, Event, Execer, RuntimeStopper, State,
};
use crate::deleter::{Deleter, RuntimeStater};
use crate::depot::Depot;
use crate::error::{ContainerizerError, Result};
use crate::io::{output_for, stdin_for, ProcessIo};
use crate::pid::{DEFAULT_PIDFILE_TIMEOUT, PIDFILE};

const PROCESSES_DIR: &str = "processes";
const PROCESS_JSON: &str = "process.json";
const EXEC_LOG: &str = "runc-exec.log";
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Container manager driving the runc binary directly. Bundles live in the
/// depot, which makes them survive daemon restarts.
pub struct RuncContainerManager {
    runtime: RuncRuntime,
    depot: Arc<dyn Depot>,
    registry: Arc<ProcessRegistry>,
    oom: Arc<OomWatcher>,
    exec_timeout: Duration,
    process_root: Option<PathBuf>,
}

impl RuncContainerManager {
    pub fn new(runtime: RuncRuntime, depot: Arc<dyn Depot>) -> Self {
        RuncContainerManager {
            runtime,
            depot,
            registry: Arc::new(ProcessRegistry::default()),
            oom: Arc::new(OomWatcher::default()),
            exec_timeout: DEFAULT_PIDFILE_TIMEOUT,
            process_root: None,
        }
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    /// Keeps exec'd process directories under `<root>/<id>` instead of the
    /// container's bundle. Used when containers are created by containerd and
    /// have no bundle in the depot.
    pub fn with_process_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.process_root = Some(root.into());
        self
    }

    /// Process manager sharing this manager's `runc exec` children.
    pub fn process_manager(&self) -> RuncProcessManager {
        RuncProcessManager::new(
            self.runtime.clone(),
            Arc::clone(&self.depot),
            Arc::clone(&self.registry),
        )
    }

    /// Starts OOM watchers for containers created before a restart.
    pub fn watch_existing(&self) -> Result<()> {
        for handle in self.depot.handles()? {
            if let Err(err) = self.oom.watch(&self.runtime, &handle) {
                tracing::warn!(%err, handle, "failed to watch container events");
            }
        }
        Ok(())
    }

    fn init_stdio(io: &dyn ProcessIo, uid: u32, gid: u32) -> Result<InitStdio> {
        for path in [io.stdout(), io.stderr()].into_iter().flatten() {
            // create the file before handing ownership to the container root
            drop(output_for(Some(path))?);
            chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .map_err(|err| ContainerizerError::io(path, err.into()))?;
        }

        Ok(InitStdio {
            stdin: stdin_for(io.stdin())?,
            stdout: output_for(io.stdout())?,
            stderr: output_for(io.stderr())?,
        })
    }

    fn remove_failed_bundle(&self, id: &str) {
        if let Err(err) = self.depot.destroy(id) {
            tracing::warn!(%err, id, "failed to remove bundle of failed container");
        }
    }

    fn process_dir(&self, id: &str, process_id: &str) -> Result<PathBuf> {
        match &self.process_root {
            Some(root) => Ok(root.join(id).join(process_id)),
            None => Ok(self.depot.lookup(id)?.join(PROCESSES_DIR).join(process_id)),
        }
    }

    /// Waits until `runc exec` has written the pid file or exited.
    fn wait_for_exec_start(
        &self,
        id: &str,
        child: &mut std::process::Child,
        pid_file: &Path,
        log_file: &Path,
    ) -> Result<i32> {
        let deadline = Instant::now() + self.exec_timeout;
        loop {
            let exited = child
                .try_wait()
                .map_err(|err| ContainerizerError::io(pid_file, err))?;

            if let Some(pid) = read_pid(pid_file) {
                return Ok(pid);
            }

            if let Some(status) = exited {
                let message = fs::read(log_file)
                    .ok()
                    .and_then(|log| last_log_message(&log))
                    .unwrap_or_else(|| format!("runc exec exited with {}", exit_code(status)));
                return Err(runc_error(id, "runc exec", message));
            }

            if Instant::now() >= deadline {
                if let Err(err) = child.kill() {
                    tracing::warn!(%err, id, "failed to kill runc exec");
                }
                return Err(ContainerizerError::Timeout {
                    what: format!("pid file {}", pid_file.display()),
                    timeout: self.exec_timeout,
                });
            }
            thread::sleep(EXEC_POLL_INTERVAL);
        }
    }
}

fn read_pid(pid_file: &Path) -> Option<i32> {
    fs::read_to_string(pid_file).ok()?.trim().parse().ok()
}

impl ContainerManager for RuncContainerManager {
    #[tracing::instrument(level = "debug", skip(self, bundle, io))]
    fn create(
        &self,
        id: &str,
        bundle: &BundleSpec,
        container_root_uid: u32,
        container_root_gid: u32,
        io: Arc<dyn ProcessIo>,
    ) -> Result<()> {
        let bundle_path = self.depot.create(id, bundle)?;

        let created = Self::init_stdio(io.as_ref(), container_root_uid, container_root_gid)
            .and_then(|stdio| {
                self.runtime
                    .create(id, &bundle_path, &bundle_path.join(PIDFILE), stdio)
            })
            .and_then(|()| self.runtime.start(id));
        if let Err(err) = created {
            tracing::error!(%err, id, "creating container failed");
            self.remove_failed_bundle(id);
            return Err(err);
        }

        if let Err(err) = self.oom.watch(&self.runtime, id) {
            tracing::warn!(%err, id, "failed to watch container events");
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        Deleter::new(Arc::new(self.runtime.clone()), Arc::new(self.runtime.clone())).delete(id)?;
        self.release(id);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, process, io))]
    fn exec(
        &self,
        id: &str,
        process_id: &str,
        process: &Process,
        io: Arc<dyn ProcessIo>,
    ) -> Result<()> {
        if self.registry.contains(id, process_id) {
            return Err(ContainerizerError::AlreadyExists {
                handle: format!("{id}/{process_id}"),
            });
        }

        let dir = self.process_dir(id, process_id)?;
        fs::create_dir_all(&dir).map_err(|err| ContainerizerError::io(&dir, err))?;

        // terminals need a console socket, which this driver does not provide
        let mut process = process.clone();
        if process.terminal() == Some(true) {
            tracing::debug!(id, process_id, "running without a terminal");
            process.set_terminal(Some(false));
        }
        let process_json = dir.join(PROCESS_JSON);
        let contents = serde_json::to_vec(&process).map_err(|err| ContainerizerError::Parse {
            what: "process spec".to_owned(),
            message: err.to_string(),
        })?;
        fs::write(&process_json, contents)
            .map_err(|err| ContainerizerError::io(&process_json, err))?;

        let pid_file = dir.join(PIDFILE);
        let log_file = dir.join(EXEC_LOG);
        let mut cmd = self
            .runtime
            .binary()
            .exec_command(id, &pid_file, &process_json, &log_file);
        cmd.stdin(stdin_for(io.stdin())?)
            .stdout(output_for(io.stdout())?)
            .stderr(output_for(io.stderr())?);
        let mut child = cmd
            .spawn()
            .map_err(|err| ContainerizerError::io(cmd.get_program(), err))?;

        let pid = self.wait_for_exec_start(id, &mut child, &pid_file, &log_file)?;
        tracing::debug!(pid, "process started");
        self.registry
            .insert(id, process_id, ExecChild::new(pid, dir, child))
    }

    fn state(&self, id: &str) -> Result<State> {
        RuntimeStater::state(&self.runtime, id)
    }

    fn spec(&self, id: &str) -> Result<BundleSpec> {
        BundleSpec::load(&self.depot.lookup(id)?)
    }

    fn oom_events(&self) -> Result<Receiver<Event>> {
        Ok(self.oom.subscribe())
    }

    fn bundle_ids(&self, filters: &[ContainerFilter]) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for handle in self.depot.handles()? {
            let bundle = match self.spec(&handle) {
                Ok(bundle) => bundle,
                Err(err) => {
                    tracing::warn!(%err, handle, "skipping unreadable bundle");
                    continue;
                }
            };
            if ContainerFilter::matches_all(filters, &bundle.annotations()) {
                ids.push(handle);
            }
        }
        Ok(ids)
    }

    fn remove_bundle(&self, id: &str) -> Result<()> {
        self.release(id);
        self.depot.destroy(id)
    }
}

/// Lets runc run the processes of containers that another backend manages.
impl Execer for RuncContainerManager {
    fn exec(
        &self,
        id: &str,
        process_id: &str,
        process: &Process,
        io: Arc<dyn ProcessIo>,
    ) -> Result<()> {
        ContainerManager::exec(self, id, process_id, process, io)
    }

    fn attach(
        &self,
        id: &str,
        process_id: &str,
        io: Arc<dyn ProcessIo>,
    ) -> Result<Box<dyn BackingProcess>> {
        self.process_manager().get_process(id, process_id, io)
    }

    fn release(&self, id: &str) {
        let forgotten = self.registry.forget_container(id);
        if forgotten > 0 {
            tracing::debug!(id, forgotten, "released exec'd processes");
        }
    }
}

impl RuntimeStopper for RuncContainerManager {
    fn stop(&self) -> Result<()> {
        self.oom.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use anyhow::Result;
    use oci_spec::runtime::Spec;

    use super::*;
    use crate::bundle::{CONTAINER_TYPE_ANNOTATION, PEA_CONTAINER_TYPE, SANDBOX_CONTAINER_ANNOTATION};
    use crate::depot::DirDepot;
    use crate::runc::binary::RuncBinary;

    fn manager(depot_dir: &Path) -> RuncContainerManager {
        RuncContainerManager::new(
            RuncRuntime::new(RuncBinary::default()),
            Arc::new(DirDepot::new(depot_dir)),
        )
        .with_exec_timeout(Duration::from_secs(5))
    }

    fn sh(script: String) -> Result<std::process::Child> {
        Ok(Command::new("sh").arg("-c").arg(script).spawn()?)
    }

    #[test]
    fn test_spec_and_bundle_ids() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let depot = DirDepot::new(tmp.path());
        let pea = |sandbox: &str| {
            BundleSpec::from(Spec::default())
                .with_annotation(CONTAINER_TYPE_ANNOTATION, PEA_CONTAINER_TYPE)
                .with_annotation(SANDBOX_CONTAINER_ANNOTATION, sandbox)
        };
        depot.create("pea-a", &pea("a"))?;
        depot.create("pea-b", &pea("b"))?;
        depot.create("plain", &BundleSpec::from(Spec::default()))?;
        fs::create_dir(tmp.path().join("broken"))?;
        let manager = manager(tmp.path());

        let ids = manager.bundle_ids(&[
            ContainerFilter::equal(CONTAINER_TYPE_ANNOTATION, PEA_CONTAINER_TYPE),
            ContainerFilter::not_equal(SANDBOX_CONTAINER_ANNOTATION, "b"),
        ])?;

        assert_eq!(ids, vec!["pea-a"]);
        assert_eq!(manager.spec("pea-b")?, pea("b"));
        assert!(manager.spec("missing").unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn test_remove_bundle_is_idempotent() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let manager = manager(tmp.path());
        DirDepot::new(tmp.path()).create("handle", &BundleSpec::from(Spec::default()))?;

        manager.remove_bundle("handle")?;
        manager.remove_bundle("handle")?;

        assert!(!tmp.path().join("handle").exists());
        Ok(())
    }

    #[test]
    fn test_removing_container_forgets_its_processes() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        DirDepot::new(tmp.path()).create("handle", &BundleSpec::from(Spec::default()))?;
        let manager = manager(tmp.path());
        for (id, process_id) in [("handle", "a"), ("handle", "b"), ("other", "c")] {
            let mut child = sh("exit 0".to_owned())?;
            child.wait()?;
            let dir = tmp.path().join(process_id);
            manager
                .registry
                .insert(id, process_id, ExecChild::new(child.id() as i32, dir, child))?;
        }

        manager.remove_bundle("handle")?;

        assert!(!manager.registry.contains("handle", "a"));
        assert!(!manager.registry.contains("handle", "b"));
        assert!(manager.registry.contains("other", "c"));
        assert!(matches!(
            Execer::attach(&manager, "handle", "a", Arc::new(crate::io::NullIo)),
            Err(ContainerizerError::ProcessNotFound { .. })
        ));

        Execer::release(&manager, "other");
        assert!(!manager.registry.contains("other", "c"));
        Ok(())
    }

    #[test]
    fn test_process_dir_location() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        DirDepot::new(tmp.path()).create("handle", &BundleSpec::from(Spec::default()))?;

        assert_eq!(
            manager(tmp.path()).process_dir("handle", "proc")?,
            tmp.path().join("handle").join(PROCESSES_DIR).join("proc")
        );
        assert!(manager(tmp.path()).process_dir("missing", "proc").is_err());
        assert_eq!(
            manager(tmp.path())
                .with_process_root("/var/processes")
                .process_dir("missing", "proc")?,
            PathBuf::from("/var/processes/missing/proc")
        );
        Ok(())
    }

    #[test]
    fn test_exec_start_returns_pid() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let pid_file = tmp.path().join(PIDFILE);
        let log_file = tmp.path().join(EXEC_LOG);
        let mut child = sh(format!("echo 4242 > {}; sleep 1", pid_file.display()))?;

        let pid =
            manager(tmp.path()).wait_for_exec_start("handle", &mut child, &pid_file, &log_file)?;

        assert_eq!(pid, 4242);
        child.kill()?;
        child.wait()?;
        Ok(())
    }

    #[test]
    fn test_exec_start_failure_reports_runc_log() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let pid_file = tmp.path().join(PIDFILE);
        let log_file = tmp.path().join(EXEC_LOG);
        let mut child = sh(format!(
            r#"echo '{{"level":"error","msg":"exec failed: unable to start container process: exec: potato: executable file not found in $PATH"}}' > {}; exit 255"#,
            log_file.display()
        ))?;

        let err = manager(tmp.path())
            .wait_for_exec_start("handle", &mut child, &pid_file, &log_file)
            .unwrap_err();

        match err {
            ContainerizerError::Backend { context, message } => {
                assert_eq!(context, "runc exec");
                assert!(message.contains("executable file not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[test]
    fn test_exec_start_times_out() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut child = sh("sleep 30".to_owned())?;

        let err = manager(tmp.path())
            .with_exec_timeout(Duration::from_millis(50))
            .wait_for_exec_start(
                "handle",
                &mut child,
                &tmp.path().join(PIDFILE),
                &tmp.path().join(EXEC_LOG),
            )
            .unwrap_err();

        assert!(matches!(err, ContainerizerError::Timeout { .. }));
        child.wait()?;
        Ok(())
    }
}
