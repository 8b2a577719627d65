//! Cgroup adjustments the runtimes do not make on their own.
//!
//! On cgroup v1 the memory cgroup of a container has to account its
//! descendants. On cgroup v2 the init process of a garden container moves to
//! an `init` child cgroup, so the limits are applied to the parent and only
//! the child is handed to the runtime.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use libcgroups::common::{self as cgroup_common, DEFAULT_CGROUP_ROOT};
use libcgroups::resources::{convert_resources, CgroupResources};
use libcgroups::v1::memory;
use libcgroups::v2::manager::Manager as V2Manager;
use serde::Deserialize;

use crate::bundle::{BundleSpec, GARDEN_INIT_CONTAINER_TYPE, INIT_CGROUP_NAME};
use crate::error::{ContainerizerError, Result};

#[cfg_attr(test, automock)]
pub trait CgroupManager: Send + Sync {
    fn set_use_memory_hierarchy(&self, handle: &str) -> Result<()>;
    /// Returns the bundle to hand to the runtime, which may carry a rewritten
    /// cgroups path.
    fn set_unified_resources(&self, bundle: &BundleSpec) -> Result<BundleSpec>;
}

/// Creates a v2 cgroup and applies resources to it.
#[cfg_attr(test, automock)]
pub trait UnifiedResourcesApplier: Send + Sync {
    fn apply(&self, cgroup_path: &Path, resources: &CgroupResources) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FsUnifiedResourcesApplier {
    root: PathBuf,
}

impl Default for FsUnifiedResourcesApplier {
    fn default() -> Self {
        FsUnifiedResourcesApplier {
            root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }
}

impl FsUnifiedResourcesApplier {
    pub fn new(root: PathBuf) -> Self {
        FsUnifiedResourcesApplier { root }
    }
}

impl UnifiedResourcesApplier for FsUnifiedResourcesApplier {
    fn apply(&self, cgroup_path: &Path, resources: &CgroupResources) -> Result<()> {
        let manager = V2Manager::new(self.root.clone(), cgroup_path.to_path_buf())
            .map_err(|err| ContainerizerError::Cgroup(err.to_string()))?;
        manager
            .create()
            .map_err(|err| ContainerizerError::Cgroup(err.to_string()))?;
        manager
            .apply(resources)
            .map_err(|err| ContainerizerError::Cgroup(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RuntimeState {
    #[serde(default)]
    cgroup_paths: HashMap<String, PathBuf>,
}

pub struct RuntimeCgroupManager {
    runtime_root: PathBuf,
    namespace: String,
    is_unified: Box<dyn Fn() -> bool + Send + Sync>,
    applier: Box<dyn UnifiedResourcesApplier>,
}

impl RuntimeCgroupManager {
    /// `runtime_root` and `namespace` locate the runtime's `state.json` files.
    pub fn new(runtime_root: PathBuf, namespace: &str) -> Self {
        RuntimeCgroupManager {
            runtime_root,
            namespace: namespace.to_owned(),
            is_unified: Box::new(cgroup_common::is_unified_mode),
            applier: Box::new(FsUnifiedResourcesApplier::default()),
        }
    }

    pub fn with_unified_probe(mut self, probe: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.is_unified = Box::new(probe);
        self
    }

    pub fn with_applier(mut self, applier: impl UnifiedResourcesApplier + 'static) -> Self {
        self.applier = Box::new(applier);
        self
    }

    fn state_file(&self, handle: &str) -> PathBuf {
        self.runtime_root
            .join(&self.namespace)
            .join(handle)
            .join("state.json")
    }

    fn memory_cgroup_path(&self, handle: &str) -> Result<PathBuf> {
        let path = self.state_file(handle);
        let contents = fs::read(&path).map_err(|err| ContainerizerError::io(&path, err))?;
        let state: RuntimeState = serde_json::from_slice(&contents)
            .map_err(|source| ContainerizerError::StateFile { path: path.clone(), source })?;

        state
            .cgroup_paths
            .get("memory")
            .cloned()
            .ok_or_else(|| ContainerizerError::Parse {
                what: format!("{path:?}"),
                message: "no memory cgroup path".to_owned(),
            })
    }

    fn set_use_memory_hierarchy_v1(&self, handle: &str) -> Result<()> {
        let memory_path = self.memory_cgroup_path(handle)?;
        memory::set_use_hierarchy(&memory_path)
            .map_err(|err| ContainerizerError::Cgroup(err.to_string()))
    }

    fn set_unified_resources_v2(&self, bundle: &BundleSpec) -> Result<BundleSpec> {
        let Some(cgroup_path) = bundle.cgroups_path().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(bundle.clone());
        };
        if bundle.container_type() != Some(GARDEN_INIT_CONTAINER_TYPE) {
            return Ok(bundle.clone());
        }

        if let Some(resources) = convert_resources(bundle.resources()) {
            tracing::debug!(?cgroup_path, "applying resources to container cgroup");
            self.applier.apply(cgroup_path, &resources)?;
        }

        Ok(bundle.with_cgroups_path(cgroup_path.join(INIT_CGROUP_NAME)))
    }
}

impl CgroupManager for RuntimeCgroupManager {
    #[tracing::instrument(level = "debug", skip(self))]
    fn set_use_memory_hierarchy(&self, handle: &str) -> Result<()> {
        if (self.is_unified)() {
            return Ok(());
        }
        self.set_use_memory_hierarchy_v1(handle)
    }

    fn set_unified_resources(&self, bundle: &BundleSpec) -> Result<BundleSpec> {
        if !(self.is_unified)() {
            return Ok(bundle.clone());
        }
        self.set_unified_resources_v2(bundle)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use oci_spec::runtime::Spec;

    use super::*;
    use crate::bundle::{CONTAINER_TYPE_ANNOTATION, PEA_CONTAINER_TYPE};

    fn garden_init(path: &str) -> BundleSpec {
        BundleSpec::from(Spec::default())
            .with_cgroups_path(path)
            .with_annotation(CONTAINER_TYPE_ANNOTATION, GARDEN_INIT_CONTAINER_TYPE)
            .with_cpu_shares(1024)
    }

    fn manager(unified: bool, applier: MockUnifiedResourcesApplier) -> RuntimeCgroupManager {
        RuntimeCgroupManager::new(PathBuf::from("/run/runc"), "garden")
            .with_unified_probe(move || unified)
            .with_applier(applier)
    }

    #[test]
    fn test_unified_resources_applied_to_parent_and_path_rewritten() -> Result<()> {
        let mut applier = MockUnifiedResourcesApplier::new();
        applier
            .expect_apply()
            .withf(|path, resources| {
                path == Path::new("/foo") && resources.cpu_shares == Some(1024)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let bundle = manager(true, applier).set_unified_resources(&garden_init("/foo"))?;

        assert_eq!(bundle.cgroups_path(), Some(Path::new("/foo/init")));
        Ok(())
    }

    #[test]
    fn test_unified_resources_noop_on_v1() -> Result<()> {
        let mut applier = MockUnifiedResourcesApplier::new();
        applier.expect_apply().never();
        let original = garden_init("/foo");

        let bundle = manager(false, applier).set_unified_resources(&original)?;

        assert_eq!(bundle, original);
        Ok(())
    }

    #[test]
    fn test_unified_resources_noop_for_non_init_containers() -> Result<()> {
        let mut applier = MockUnifiedResourcesApplier::new();
        applier.expect_apply().never();
        let pea = garden_init("/foo").with_annotation(CONTAINER_TYPE_ANNOTATION, PEA_CONTAINER_TYPE);
        let unannotated = BundleSpec::from(Spec::default()).with_cgroups_path("/foo");

        let manager = manager(true, applier);

        assert_eq!(manager.set_unified_resources(&pea)?, pea);
        assert_eq!(manager.set_unified_resources(&unannotated)?, unannotated);
        Ok(())
    }

    #[test]
    fn test_unified_resources_noop_without_cgroups_path() -> Result<()> {
        let mut applier = MockUnifiedResourcesApplier::new();
        applier.expect_apply().never();
        let original = garden_init("");

        let bundle = manager(true, applier).set_unified_resources(&original)?;

        assert_eq!(bundle, original);
        Ok(())
    }

    #[test]
    fn test_unified_resources_propagates_apply_error() {
        let mut applier = MockUnifiedResourcesApplier::new();
        applier
            .expect_apply()
            .returning(|_, _| Err(ContainerizerError::Cgroup("no cpu controller".to_owned())));

        let result = manager(true, applier).set_unified_resources(&garden_init("/foo"));

        assert!(matches!(result, Err(ContainerizerError::Cgroup(_))));
    }

    fn write_state(root: &Path, handle: &str, contents: &str) -> Result<()> {
        let dir = root.join("garden").join(handle);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("state.json"), contents)?;
        Ok(())
    }

    #[test]
    fn test_set_use_memory_hierarchy() -> Result<()> {
        let runtime_root = tempfile::tempdir()?;
        let memory_cgroup = tempfile::tempdir()?;
        fs::write(memory_cgroup.path().join(memory::MEMORY_USE_HIERARCHY), "0")?;
        write_state(
            runtime_root.path(),
            "handle",
            &format!(
                r#"{{"cgroup_paths": {{"memory": "{}"}}}}"#,
                memory_cgroup.path().display()
            ),
        )?;

        RuntimeCgroupManager::new(runtime_root.path().to_path_buf(), "garden")
            .with_unified_probe(|| false)
            .set_use_memory_hierarchy("handle")?;

        assert!(memory::hierarchy_enabled(memory_cgroup.path())?);
        Ok(())
    }

    #[test]
    fn test_set_use_memory_hierarchy_errors() -> Result<()> {
        let runtime_root = tempfile::tempdir()?;
        write_state(runtime_root.path(), "malformed", "{not json")?;
        write_state(runtime_root.path(), "no-memory", r#"{"cgroup_paths": {}}"#)?;
        let manager = RuntimeCgroupManager::new(runtime_root.path().to_path_buf(), "garden")
            .with_unified_probe(|| false);

        assert!(matches!(
            manager.set_use_memory_hierarchy("missing"),
            Err(ContainerizerError::Io { .. })
        ));
        assert!(matches!(
            manager.set_use_memory_hierarchy("malformed"),
            Err(ContainerizerError::StateFile { .. })
        ));
        assert!(matches!(
            manager.set_use_memory_hierarchy("no-memory"),
            Err(ContainerizerError::Parse { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_set_use_memory_hierarchy_noop_on_v2() -> Result<()> {
        RuntimeCgroupManager::new(PathBuf::from("/does/not/exist"), "garden")
            .with_unified_probe(|| true)
            .set_use_memory_hierarchy("handle")?;
        Ok(())
    }
}
