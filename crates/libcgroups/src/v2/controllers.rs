use std::fmt::Display;
use std::path::{Path, PathBuf};

use crate::common::{self, WrappedIoError};

pub const CGROUP_CONTROLLERS: &str = "cgroup.controllers";
pub const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControllerType {
    Cpu,
    CpuSet,
    Io,
    Memory,
    HugeTlb,
    Pids,
}

impl Display for ControllerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            Self::Cpu => "cpu",
            Self::CpuSet => "cpuset",
            Self::Io => "io",
            Self::Memory => "memory",
            Self::HugeTlb => "hugetlb",
            Self::Pids => "pids",
        };

        write!(f, "{print}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControllersError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("cannot get available controllers. {0} does not exist")]
    DoesNotExist(PathBuf),
}

/// Reads `{cgroup_path}/cgroup.controllers` to get the controllers that can
/// be delegated to children of this cgroup.
pub fn get_available_controllers<P: AsRef<Path>>(
    cgroup_path: P,
) -> Result<Vec<ControllerType>, ControllersError> {
    let controllers_path = cgroup_path.as_ref().join(CGROUP_CONTROLLERS);
    if !controllers_path.exists() {
        return Err(ControllersError::DoesNotExist(controllers_path));
    }

    let mut controllers = Vec::new();
    for controller in common::read_cgroup_file(controllers_path)?.split_whitespace() {
        match controller {
            "cpu" => controllers.push(ControllerType::Cpu),
            "cpuset" => controllers.push(ControllerType::CpuSet),
            "hugetlb" => controllers.push(ControllerType::HugeTlb),
            "io" => controllers.push(ControllerType::Io),
            "memory" => controllers.push(ControllerType::Memory),
            "pids" => controllers.push(ControllerType::Pids),
            other => tracing::debug!("ignoring controller {}", other),
        }
    }

    Ok(controllers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::set_fixture;

    #[test]
    fn test_get_available_controllers() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), CGROUP_CONTROLLERS, "cpuset cpu io memory pids rdma misc\n")
            .unwrap();

        let controllers = get_available_controllers(tmp.path()).unwrap();

        assert_eq!(
            controllers,
            vec![
                ControllerType::CpuSet,
                ControllerType::Cpu,
                ControllerType::Io,
                ControllerType::Memory,
                ControllerType::Pids,
            ]
        );
    }

    #[test]
    fn test_missing_controllers_file() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            get_available_controllers(tmp.path()),
            Err(ControllersError::DoesNotExist(_))
        ));
    }
}
