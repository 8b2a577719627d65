use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use super::runtime::RuncRuntime;
use crate::backing_process::{signalled_exit_code, BackingProcess, ProcessManager};
use crate::depot::Depot;
use crate::error::{ContainerizerError, Result};
use crate::io::ProcessIo;
use crate::pid::PIDFILE;
use crate::signal::Signal;

const EXITED_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(signalled_exit_code))
        .unwrap_or(-1)
}

/// A `runc exec` child. runc stays in the foreground, so its exit status is
/// the exit status of the process.
#[derive(Debug)]
pub struct ExecChild {
    pid: i32,
    dir: PathBuf,
    child: Mutex<Child>,
    exit_code: OnceLock<i32>,
}

impl ExecChild {
    pub fn new(pid: i32, dir: PathBuf, child: Child) -> Self {
        ExecChild {
            pid,
            dir,
            child: Mutex::new(child),
            exit_code: OnceLock::new(),
        }
    }

    fn wait(&self) -> Result<i32> {
        if let Some(code) = self.exit_code.get() {
            return Ok(*code);
        }

        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(code) = self.exit_code.get() {
            return Ok(*code);
        }
        let status = child
            .wait()
            .map_err(|err| ContainerizerError::io(&self.dir, err))?;
        Ok(*self.exit_code.get_or_init(|| exit_code(status)))
    }
}

type ProcessKey = (String, String);

/// The `runc exec` children this daemon started, keyed by container and
/// process id. It tracks child processes only; container state always comes
/// from runc.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    children: Mutex<HashMap<ProcessKey, Arc<ExecChild>>>,
}

impl ProcessRegistry {
    pub fn insert(&self, container_id: &str, process_id: &str, child: ExecChild) -> Result<()> {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        let key = (container_id.to_owned(), process_id.to_owned());
        if children.contains_key(&key) {
            return Err(ContainerizerError::AlreadyExists {
                handle: format!("{container_id}/{process_id}"),
            });
        }
        children.insert(key, Arc::new(child));
        Ok(())
    }

    pub fn contains(&self, container_id: &str, process_id: &str) -> bool {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(container_id.to_owned(), process_id.to_owned()))
    }

    fn get(&self, container_id: &str, process_id: &str) -> Option<Arc<ExecChild>> {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(container_id.to_owned(), process_id.to_owned()))
            .cloned()
    }

    /// Drops every child of a container. Returns how many were tracked.
    pub fn forget_container(&self, container_id: &str) -> usize {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        let before = children.len();
        children.retain(|(id, _), _| id != container_id);
        before - children.len()
    }

    fn remove(&self, container_id: &str, process_id: &str) {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(container_id.to_owned(), process_id.to_owned()));
    }
}

pub struct RuncExecProcess {
    container_id: String,
    process_id: String,
    child: Arc<ExecChild>,
    registry: Arc<ProcessRegistry>,
}

impl BackingProcess for RuncExecProcess {
    fn id(&self) -> String {
        self.process_id.clone()
    }

    fn wait(&self) -> Result<i32> {
        self.child.wait()
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        kill(Pid::from_raw(self.child.pid), signal.into_raw())
            .map_err(|err| ContainerizerError::backend("signal process", err))
    }

    /// Forgets the child and removes its process directory.
    fn delete(&self) -> Result<()> {
        self.registry.remove(&self.container_id, &self.process_id);
        match fs::remove_dir_all(&self.child.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ContainerizerError::io(&self.child.dir, err)),
        }
    }
}

/// Init process of a runc container. runc detaches it from `runc create`, so
/// it can only be reaped when this daemon is a child subreaper.
pub struct RuncInitProcess {
    id: String,
    pid: i32,
    runtime: RuncRuntime,
    exit_code: OnceLock<i32>,
}

impl RuncInitProcess {
    fn poll_until_gone(&self) -> Result<i32> {
        let pid = Pid::from_raw(self.pid);
        while kill(pid, None).is_ok() {
            thread::sleep(EXITED_POLL_INTERVAL);
        }
        Err(ContainerizerError::backend(
            "wait init process",
            format!("pid {} exited but is not a child, exit status unavailable", self.pid),
        ))
    }
}

impl BackingProcess for RuncInitProcess {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn wait(&self) -> Result<i32> {
        if let Some(code) = self.exit_code.get() {
            return Ok(*code);
        }

        let code = loop {
            match waitpid(Pid::from_raw(self.pid), None) {
                Ok(WaitStatus::Exited(_, code)) => break code,
                Ok(WaitStatus::Signaled(_, signal, _)) => break signalled_exit_code(signal as i32),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    tracing::warn!(id = %self.id, pid = self.pid, "init process is not a child, polling");
                    return self.poll_until_gone();
                }
                Err(err) => return Err(ContainerizerError::backend("wait init process", err)),
            }
        };
        Ok(*self.exit_code.get_or_init(|| code))
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.runtime.kill(&self.id, signal.as_i32())
    }

    fn delete(&self) -> Result<()> {
        Ok(())
    }
}

pub struct RuncProcessManager {
    runtime: RuncRuntime,
    depot: Arc<dyn Depot>,
    registry: Arc<ProcessRegistry>,
}

impl RuncProcessManager {
    pub fn new(runtime: RuncRuntime, depot: Arc<dyn Depot>, registry: Arc<ProcessRegistry>) -> Self {
        RuncProcessManager {
            runtime,
            depot,
            registry,
        }
    }
}

impl ProcessManager for RuncProcessManager {
    fn get_process(
        &self,
        container_id: &str,
        process_id: &str,
        _io: Arc<dyn ProcessIo>,
    ) -> Result<Box<dyn BackingProcess>> {
        let child = self
            .registry
            .get(container_id, process_id)
            .ok_or_else(|| ContainerizerError::ProcessNotFound {
                handle: container_id.to_owned(),
                process_id: process_id.to_owned(),
            })?;

        Ok(Box::new(RuncExecProcess {
            container_id: container_id.to_owned(),
            process_id: process_id.to_owned(),
            child,
            registry: Arc::clone(&self.registry),
        }))
    }

    fn get_task(&self, id: &str, _io: Arc<dyn ProcessIo>) -> Result<Box<dyn BackingProcess>> {
        let pid_file = self.depot.lookup(id)?.join(PIDFILE);
        let contents = fs::read_to_string(&pid_file).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ContainerizerError::TaskNotFound {
                handle: id.to_owned(),
            },
            _ => ContainerizerError::io(&pid_file, err),
        })?;
        let pid = contents
            .trim()
            .parse()
            .map_err(|err: std::num::ParseIntError| ContainerizerError::Parse {
                what: "pid file contents".to_owned(),
                message: err.to_string(),
            })?;

        Ok(Box::new(RuncInitProcess {
            id: id.to_owned(),
            pid,
            runtime: self.runtime.clone(),
            exit_code: OnceLock::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use anyhow::Result;

    use super::*;
    use crate::depot::MockDepot;
    use crate::io::NullIo;
    use crate::runc::binary::RuncBinary;

    fn spawn(script: &str) -> Result<Child> {
        Ok(Command::new("sh").arg("-c").arg(script).spawn()?)
    }

    fn manager(registry: Arc<ProcessRegistry>, depot: MockDepot) -> RuncProcessManager {
        RuncProcessManager::new(
            RuncRuntime::new(RuncBinary::default()),
            Arc::new(depot),
            registry,
        )
    }

    #[test]
    fn test_exec_process_wait_and_delete() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("processes").join("proc");
        fs::create_dir_all(&dir)?;
        let child = spawn("exit 3")?;
        let registry = Arc::new(ProcessRegistry::default());
        registry.insert("handle", "proc", ExecChild::new(child.id() as i32, dir.clone(), child))?;

        let process = manager(Arc::clone(&registry), MockDepot::new()).get_process(
            "handle",
            "proc",
            Arc::new(NullIo),
        )?;

        assert_eq!(process.id(), "proc");
        assert_eq!(process.wait()?, 3);
        assert_eq!(process.wait()?, 3);
        process.delete()?;
        assert!(!dir.exists());
        assert!(!registry.contains("handle", "proc"));
        Ok(())
    }

    #[test]
    fn test_signalled_exec_process() -> Result<()> {
        let child = spawn("sleep 30")?;
        let registry = Arc::new(ProcessRegistry::default());
        registry.insert(
            "handle",
            "proc",
            ExecChild::new(child.id() as i32, PathBuf::from("/nonexistent"), child),
        )?;
        let process = manager(Arc::clone(&registry), MockDepot::new()).get_process(
            "handle",
            "proc",
            Arc::new(NullIo),
        )?;

        process.signal(Signal::from(nix::sys::signal::Signal::SIGKILL))?;

        assert_eq!(process.wait()?, 137);
        Ok(())
    }

    #[test]
    fn test_unknown_process_is_not_found() {
        let err = manager(Arc::new(ProcessRegistry::default()), MockDepot::new())
            .get_process("handle", "nope", Arc::new(NullIo))
            .err()
            .unwrap();

        assert!(matches!(
            err,
            ContainerizerError::ProcessNotFound { handle, process_id }
                if handle == "handle" && process_id == "nope"
        ));
    }

    #[test]
    fn test_registry_rejects_duplicates() -> Result<()> {
        let registry = ProcessRegistry::default();
        let first = spawn("true")?;
        let second = spawn("true")?;
        registry.insert("handle", "proc", ExecChild::new(1, PathBuf::new(), first))?;

        assert!(matches!(
            registry.insert("handle", "proc", ExecChild::new(2, PathBuf::new(), second)),
            Err(ContainerizerError::AlreadyExists { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_get_task_reads_pid_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        fs::write(tmp.path().join(PIDFILE), "4242")?;
        let bundle = tmp.path().to_path_buf();
        let mut depot = MockDepot::new();
        depot
            .expect_lookup()
            .withf(|id| id == "handle")
            .returning(move |_| Ok(bundle.clone()));
        depot.expect_lookup().returning(|_| Ok(PathBuf::from("/nonexistent")));
        let manager = manager(Arc::new(ProcessRegistry::default()), depot);

        assert_eq!(manager.get_task("handle", Arc::new(NullIo))?.id(), "handle");
        assert!(matches!(
            manager.get_task("other", Arc::new(NullIo)).err(),
            Some(ContainerizerError::TaskNotFound { .. })
        ));
        Ok(())
    }

    fn in_child_process<F: FnOnce() -> Result<()>>(cb: F) -> Result<()> {
        match unsafe { nix::unistd::fork()? } {
            nix::unistd::ForkResult::Parent { child } => match waitpid(child, None)? {
                WaitStatus::Exited(_, 0) => Ok(()),
                status => anyhow::bail!("test child failed: {status:?}"),
            },
            nix::unistd::ForkResult::Child => {
                let code = match cb() {
                    Ok(()) => 0,
                    Err(err) => {
                        eprintln!("{err:?}");
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    fn init_process(pid: i32) -> RuncInitProcess {
        RuncInitProcess {
            id: "handle".to_owned(),
            pid,
            runtime: RuncRuntime::new(RuncBinary::default()),
            exit_code: OnceLock::new(),
        }
    }

    #[test]
    fn test_subreaper_reaps_detached_init_process() -> Result<()> {
        in_child_process(|| {
            nix::sys::prctl::set_child_subreaper(true)?;
            // the subshell outlives sh, like an init process outlives runc create
            let output = Command::new("sh")
                .arg("-c")
                .arg("(sleep 0.2; exit 7) >/dev/null 2>&1 & echo $!")
                .output()?;
            let pid: i32 = String::from_utf8(output.stdout)?.trim().parse()?;

            let process = init_process(pid);
            anyhow::ensure!(process.wait()? == 7, "unexpected exit code");
            anyhow::ensure!(process.wait()? == 7, "exit code not kept");
            Ok(())
        })
    }

    #[test]
    fn test_init_process_that_is_not_a_child() -> Result<()> {
        let mut child = spawn("exit 0")?;
        let pid = child.id() as i32;
        child.wait()?;

        let err = init_process(pid).wait().unwrap_err();

        assert!(err.to_string().contains("not a child"));
        Ok(())
    }
}
