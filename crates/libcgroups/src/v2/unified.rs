use std::collections::HashMap;
use std::path::Path;

use super::controllers::ControllerType;
use crate::common::{self, WrappedIoError};

#[derive(thiserror::Error, Debug)]
pub enum V2UnifiedError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("subsystem {subsystem} is not available: {err}")]
    SubsystemNotAvailable {
        subsystem: String,
        err: WrappedIoError,
    },
}

pub struct Unified {}

impl Unified {
    /// Writes raw `file -> value` overrides. A failed write for a controller
    /// that is not enabled on this cgroup is reported as such.
    pub fn apply(
        unified: &HashMap<String, String>,
        cgroup_path: &Path,
        controllers: &[ControllerType],
    ) -> Result<(), V2UnifiedError> {
        tracing::debug!("apply unified cgroup config");
        for (cgroup_file, value) in unified {
            if let Err(err) = common::write_cgroup_file_str(cgroup_path.join(cgroup_file), value) {
                let (subsystem, _) = cgroup_file.split_once('.').unwrap_or((cgroup_file, ""));

                if controllers.iter().any(|c| c.to_string() == subsystem) {
                    return Err(err.into());
                }

                return Err(V2UnifiedError::SubsystemNotAvailable {
                    subsystem: subsystem.into(),
                    err,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test::set_fixture;

    fn overrides() -> HashMap<String, String> {
        HashMap::from([
            ("pids.max".to_owned(), "100".to_owned()),
            ("cpu.weight".to_owned(), "5000".to_owned()),
        ])
    }

    #[test]
    fn test_set_unified() {
        let tmp = tempfile::tempdir().unwrap();
        let pids_max = set_fixture(tmp.path(), "pids.max", "").unwrap();
        let cpu_weight = set_fixture(tmp.path(), "cpu.weight", "").unwrap();

        Unified::apply(&overrides(), tmp.path(), &[]).expect("apply unified");

        assert_eq!(fs::read_to_string(pids_max).unwrap(), "100");
        assert_eq!(fs::read_to_string(cpu_weight).unwrap(), "5000");
    }

    #[test]
    fn test_set_unified_subsystem_not_enabled() {
        let tmp = tempfile::tempdir().unwrap();

        let result = Unified::apply(&overrides(), tmp.path(), &[]);

        assert!(matches!(
            result,
            Err(V2UnifiedError::SubsystemNotAvailable { .. })
        ));
    }

    #[test]
    fn test_set_unified_subsystem_enabled() {
        let tmp = tempfile::tempdir().unwrap();

        let result = Unified::apply(
            &overrides(),
            tmp.path(),
            &[ControllerType::Pids, ControllerType::Cpu],
        );

        assert!(matches!(result, Err(V2UnifiedError::WrappedIo(_))));
    }
}
