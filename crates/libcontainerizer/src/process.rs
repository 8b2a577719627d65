//! Externally visible process handles. A pea process is a process whose
//! container exists only for it, so its exit tears the container down.

use std::sync::{Arc, Mutex};

use crate::backing_process::BackingProcess;
use crate::container_manager::{PeaManager, VolumeDestroyer};
use crate::error::{ContainerizerError, Result};
use crate::signal::{ApiSignal, Signal};

pub trait ContainerProcess: Send + Sync {
    fn id(&self) -> String;
    fn wait(&self) -> Result<i32>;
    fn signal(&self, signal: ApiSignal) -> Result<()>;
}

pub struct Process {
    container_id: String,
    process_id: String,
    backing: Box<dyn BackingProcess>,
    cleanup_process_dirs_on_wait: bool,
}

impl Process {
    pub fn new(
        container_id: &str,
        process_id: &str,
        backing: Box<dyn BackingProcess>,
        cleanup_process_dirs_on_wait: bool,
    ) -> Self {
        Process {
            container_id: container_id.to_owned(),
            process_id: process_id.to_owned(),
            backing,
            cleanup_process_dirs_on_wait,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }
}

impl ContainerProcess for Process {
    fn id(&self) -> String {
        self.process_id.clone()
    }

    #[tracing::instrument(level = "debug", skip(self), fields(container_id = %self.container_id, process_id = %self.process_id))]
    fn wait(&self) -> Result<i32> {
        let exit_code = self.backing.wait()?;

        if self.cleanup_process_dirs_on_wait {
            if let Err(err) = self.backing.delete() {
                tracing::warn!(%err, "failed to clean up process");
            }
        }

        Ok(exit_code)
    }

    fn signal(&self, signal: ApiSignal) -> Result<()> {
        let signal = Signal::try_from(signal)?;
        self.backing.signal(signal)
    }
}

#[derive(Clone)]
enum WaitOutcome {
    Exited(i32),
    CleanupFailed {
        exit_code: i32,
        source: Arc<ContainerizerError>,
    },
}

impl WaitOutcome {
    fn to_result(&self, pea_id: &str) -> Result<i32> {
        match self {
            WaitOutcome::Exited(exit_code) => Ok(*exit_code),
            WaitOutcome::CleanupFailed { exit_code, source } => {
                Err(ContainerizerError::PeaCleanup {
                    pea_id: pea_id.to_owned(),
                    exit_code: *exit_code,
                    source: Arc::clone(source),
                })
            }
        }
    }
}

pub struct PeaProcess {
    process: Process,
    pea_manager: Arc<dyn PeaManager>,
    volume_destroyer: Arc<dyn VolumeDestroyer>,
    outcome: Mutex<Option<WaitOutcome>>,
}

impl PeaProcess {
    pub fn new(
        process: Process,
        pea_manager: Arc<dyn PeaManager>,
        volume_destroyer: Arc<dyn VolumeDestroyer>,
    ) -> Self {
        PeaProcess {
            process,
            pea_manager,
            volume_destroyer,
            outcome: Mutex::new(None),
        }
    }

    fn cleanup(&self) -> Result<()> {
        let pea_id = self.process.container_id();
        self.pea_manager.delete(pea_id)?;
        self.pea_manager.remove_bundle(pea_id)?;
        self.volume_destroyer.destroy(pea_id)
    }
}

impl ContainerProcess for PeaProcess {
    fn id(&self) -> String {
        self.process.id()
    }

    /// The first successful wait runs the cleanup; every later or concurrent
    /// wait returns the same outcome.
    #[tracing::instrument(level = "debug", skip(self), fields(pea_id = %self.process.container_id()))]
    fn wait(&self) -> Result<i32> {
        let mut outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(done) = outcome.as_ref() {
            return done.to_result(self.process.container_id());
        }

        let exit_code = self.process.wait()?;

        let done = match self.cleanup() {
            Ok(()) => WaitOutcome::Exited(exit_code),
            Err(err) => {
                tracing::error!(%err, exit_code, "failed to clean up pea");
                WaitOutcome::CleanupFailed {
                    exit_code,
                    source: Arc::new(err),
                }
            }
        };
        outcome.get_or_insert(done).to_result(self.process.container_id())
    }

    fn signal(&self, signal: ApiSignal) -> Result<()> {
        self.process.signal(signal)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use mockall::Sequence;
    use nix::sys::signal::Signal as NixSignal;

    use super::*;
    use crate::backing_process::MockBackingProcess;
    use crate::container_manager::{MockPeaManager, MockVolumeDestroyer};

    fn backing_exiting_with(code: i32) -> MockBackingProcess {
        let mut backing = MockBackingProcess::new();
        backing.expect_wait().returning(move || Ok(code));
        backing
    }

    #[test]
    fn test_wait_without_cleanup() {
        let mut backing = backing_exiting_with(42);
        backing.expect_delete().never();

        let process = Process::new("handle", "proc", Box::new(backing), false);

        assert_eq!(process.wait().unwrap(), 42);
        assert_eq!(process.id(), "proc");
    }

    #[test]
    fn test_wait_cleans_up_and_ignores_delete_failure() {
        let mut backing = backing_exiting_with(3);
        backing
            .expect_delete()
            .times(1)
            .returning(|| Err(ContainerizerError::backend("delete", "boom")));

        let process = Process::new("handle", "proc", Box::new(backing), true);

        assert_eq!(process.wait().unwrap(), 3);
    }

    #[test]
    fn test_wait_error_skips_cleanup() {
        let mut backing = MockBackingProcess::new();
        backing
            .expect_wait()
            .returning(|| Err(ContainerizerError::backend("wait", "lost")));
        backing.expect_delete().never();

        let process = Process::new("handle", "proc", Box::new(backing), true);

        assert!(matches!(
            process.wait(),
            Err(ContainerizerError::Backend { .. })
        ));
    }

    #[test]
    fn test_signal_mapping() {
        let mut backing = MockBackingProcess::new();
        backing
            .expect_signal()
            .withf(|signal| signal.into_raw() == NixSignal::SIGTERM)
            .times(1)
            .returning(|_| Ok(()));
        backing
            .expect_signal()
            .withf(|signal| signal.into_raw() == NixSignal::SIGKILL)
            .times(1)
            .returning(|_| Ok(()));

        let process = Process::new("handle", "proc", Box::new(backing), false);

        process.signal(ApiSignal::TERMINATE).unwrap();
        process.signal(ApiSignal::KILL).unwrap();
    }

    #[test]
    fn test_invalid_signal_never_reaches_backing_process() {
        let mut backing = MockBackingProcess::new();
        backing.expect_signal().never();

        let process = Process::new("handle", "proc", Box::new(backing), false);
        let err = process.signal(ApiSignal(42)).unwrap_err();

        assert!(err.to_string().contains("42"));
    }

    fn pea_cleanup_in_order(seq: &mut Sequence) -> (MockPeaManager, MockVolumeDestroyer) {
        let mut peas = MockPeaManager::new();
        let mut volumes = MockVolumeDestroyer::new();
        peas.expect_delete()
            .withf(|id| id == "pea")
            .times(1)
            .in_sequence(seq)
            .returning(|_| Ok(()));
        peas.expect_remove_bundle()
            .withf(|id| id == "pea")
            .times(1)
            .in_sequence(seq)
            .returning(|_| Ok(()));
        volumes
            .expect_destroy()
            .withf(|id| id == "pea")
            .times(1)
            .in_sequence(seq)
            .returning(|_| Ok(()));
        (peas, volumes)
    }

    #[test]
    fn test_pea_cleanup_runs_in_order_regardless_of_exit_code() {
        let mut seq = Sequence::new();
        let (peas, volumes) = pea_cleanup_in_order(&mut seq);
        let process = Process::new("pea", "proc", Box::new(backing_exiting_with(17)), false);

        let pea = PeaProcess::new(process, Arc::new(peas), Arc::new(volumes));

        assert_eq!(pea.wait().unwrap(), 17);
    }

    #[test]
    fn test_pea_cleanup_runs_once() {
        let mut seq = Sequence::new();
        let (peas, volumes) = pea_cleanup_in_order(&mut seq);
        let waits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&waits);
        let mut backing = MockBackingProcess::new();
        backing.expect_wait().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        });
        let process = Process::new("pea", "proc", Box::new(backing), false);

        let pea = Arc::new(PeaProcess::new(process, Arc::new(peas), Arc::new(volumes)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pea = Arc::clone(&pea);
                thread::spawn(move || pea.wait().unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0);
        }
        assert_eq!(pea.wait().unwrap(), 0);
        assert_eq!(waits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pea_cleanup_failure_short_circuits_and_keeps_exit_code() {
        let mut peas = MockPeaManager::new();
        let mut volumes = MockVolumeDestroyer::new();
        peas.expect_delete().times(1).returning(|_| Ok(()));
        peas.expect_remove_bundle()
            .times(1)
            .returning(|_| Err(ContainerizerError::backend("remove bundle", "busy")));
        volumes.expect_destroy().never();
        let process = Process::new("pea", "proc", Box::new(backing_exiting_with(9)), false);

        let pea = PeaProcess::new(process, Arc::new(peas), Arc::new(volumes));

        for _ in 0..2 {
            match pea.wait() {
                Err(ContainerizerError::PeaCleanup {
                    pea_id,
                    exit_code,
                    source,
                }) => {
                    assert_eq!(pea_id, "pea");
                    assert_eq!(exit_code, 9);
                    assert!(source.to_string().contains("busy"));
                }
                other => panic!("unexpected wait result: {other:?}"),
            }
        }
    }

    #[test]
    fn test_pea_wait_error_is_not_cached() {
        let mut peas = MockPeaManager::new();
        let mut volumes = MockVolumeDestroyer::new();
        let mut backing = MockBackingProcess::new();
        let mut seq = Sequence::new();
        backing
            .expect_wait()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(ContainerizerError::backend("wait", "interrupted")));
        backing
            .expect_wait()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(1));
        peas.expect_delete().times(1).returning(|_| Ok(()));
        peas.expect_remove_bundle().times(1).returning(|_| Ok(()));
        volumes.expect_destroy().times(1).returning(|_| Ok(()));
        let process = Process::new("pea", "proc", Box::new(backing), false);

        let pea = PeaProcess::new(process, Arc::new(peas), Arc::new(volumes));

        assert!(pea.wait().is_err());
        assert_eq!(pea.wait().unwrap(), 1);
    }
}
