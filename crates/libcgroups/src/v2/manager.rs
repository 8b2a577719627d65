use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Component::RootDir, Path, PathBuf},
};

use super::{
    controllers::{self, ControllerType, ControllersError, CGROUP_SUBTREE_CONTROL},
    cpu::Cpu,
    memory::{Memory, V2MemoryControllerError},
    unified::{Unified, V2UnifiedError},
};
use crate::{
    common::{self, JoinSafelyError, PathBufExt, WrapIoResult, WrappedIoError},
    resources::CgroupResources,
};

#[derive(thiserror::Error, Debug)]
pub enum V2ManagerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("while joining paths: {0}")]
    JoinSafely(#[from] JoinSafelyError),
    #[error("while reading controllers: {0}")]
    Controllers(#[from] ControllersError),
    #[error("memory controller: {0}")]
    Memory(#[from] V2MemoryControllerError),
    #[error("unified overrides: {0}")]
    Unified(#[from] V2UnifiedError),
}

/// Manages a single cgroup below a cgroup2 mount.
#[derive(Debug)]
pub struct Manager {
    root_path: PathBuf,
    cgroup_path: PathBuf,
    full_path: PathBuf,
}

impl Manager {
    /// Constructs a new cgroup manager with root path being the mount point
    /// of a cgroup v2 fs and cgroup path being a path relative to the root
    pub fn new(root_path: PathBuf, cgroup_path: PathBuf) -> Result<Self, V2ManagerError> {
        let full_path = root_path.join_safely(&cgroup_path)?;

        Ok(Self {
            root_path,
            cgroup_path,
            full_path,
        })
    }

    pub fn cgroup_path(&self) -> &Path {
        &self.cgroup_path
    }

    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    /// Creates every missing cgroup along the path and delegates the
    /// controllers of the root to each intermediate cgroup.
    pub fn create(&self) -> Result<(), V2ManagerError> {
        let controllers: Vec<String> = controllers::get_available_controllers(&self.root_path)?
            .iter()
            .map(|c| format!("+{c}"))
            .collect();

        Self::write_controllers(&self.root_path, &controllers)?;

        let mut current_path = self.root_path.clone();
        let mut components = self
            .cgroup_path
            .components()
            .filter(|c| c.ne(&RootDir))
            .peekable();
        while let Some(component) = components.next() {
            current_path = current_path.join(component);
            if !current_path.exists() {
                fs::create_dir(&current_path).wrap_create_dir(&current_path)?;
                fs::set_permissions(&current_path, fs::Permissions::from_mode(0o755))
                    .wrap_other(&current_path)?;
            }

            // the leaf keeps no subtree_control, otherwise processes could not join it
            if components.peek().is_some() {
                Self::write_controllers(&current_path, &controllers)?;
            }
        }

        Ok(())
    }

    pub fn apply(&self, resources: &CgroupResources) -> Result<(), V2ManagerError> {
        tracing::debug!(path = ?self.full_path, ?resources, "applying cgroup resources");
        Cpu::apply(&self.full_path, resources)?;
        Memory::apply(&self.full_path, resources)?;

        if !resources.unified.is_empty() {
            let enabled: Vec<ControllerType> =
                controllers::get_available_controllers(&self.full_path).unwrap_or_default();
            Unified::apply(&resources.unified, &self.full_path, &enabled)?;
        }

        Ok(())
    }

    fn write_controllers(path: &Path, controllers: &[String]) -> Result<(), WrappedIoError> {
        for controller in controllers {
            common::write_cgroup_file_str(path.join(CGROUP_SUBTREE_CONTROL), controller)?;
        }

        Ok(())
    }
}
