//! Immutable wrapper around an OCI runtime spec. Every `with_*` derives a new
//! bundle so templates can be shared between concurrent creations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use oci_spec::runtime::{
    Linux, LinuxCapabilities, LinuxIdMapping, LinuxNamespace, LinuxResources, Mount, Process,
    Root, Spec,
};
use serde::{Deserialize, Serialize};

use crate::error::{ContainerizerError, Result};

pub const CONTAINER_TYPE_ANNOTATION: &str = "container-type";
pub const SANDBOX_CONTAINER_ANNOTATION: &str = "sandbox-container";
pub const GARDEN_INIT_CONTAINER_TYPE: &str = "garden-init";
pub const PEA_CONTAINER_TYPE: &str = "pea";
/// Child cgroup that holds the init process under cgroup v2.
pub const INIT_CGROUP_NAME: &str = "init";

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleSpec {
    spec: Spec,
}

impl From<Spec> for BundleSpec {
    fn from(spec: Spec) -> Self {
        BundleSpec { spec }
    }
}

impl BundleSpec {
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    /// Loads `<bundle_dir>/config.json`.
    pub fn load(bundle_dir: &Path) -> Result<Self> {
        let path = bundle_dir.join(CONFIG_FILE);
        let contents = fs::read(&path).map_err(|err| ContainerizerError::io(&path, err))?;
        Self::from_json(&contents).map_err(|err| {
            tracing::error!(?path, %err, "failed to parse bundle");
            err
        })
    }

    pub fn save(&self, bundle_dir: &Path) -> Result<()> {
        let path = bundle_dir.join(CONFIG_FILE);
        fs::write(&path, self.to_json()?).map_err(|err| ContainerizerError::io(&path, err))
    }

    pub fn from_json(contents: &[u8]) -> Result<Self> {
        serde_json::from_slice(contents).map_err(|err| ContainerizerError::Parse {
            what: "bundle spec".to_owned(),
            message: err.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.spec).map_err(|err| ContainerizerError::Parse {
            what: "bundle spec".to_owned(),
            message: err.to_string(),
        })
    }

    pub fn process(&self) -> Option<&Process> {
        self.spec.process().as_ref()
    }

    pub fn rootfs(&self) -> Option<&Path> {
        self.spec.root().as_ref().map(|root| root.path().as_path())
    }

    pub fn hostname(&self) -> Option<&str> {
        self.spec.hostname().as_deref()
    }

    pub fn annotations(&self) -> HashMap<String, String> {
        self.spec.annotations().clone().unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.spec
            .annotations()
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    pub fn container_type(&self) -> Option<&str> {
        self.annotation(CONTAINER_TYPE_ANNOTATION)
    }

    pub fn cgroups_path(&self) -> Option<&Path> {
        self.linux()
            .and_then(|linux| linux.cgroups_path().as_deref())
    }

    pub fn resources(&self) -> Option<&LinuxResources> {
        self.linux().and_then(|linux| linux.resources().as_ref())
    }

    pub fn namespaces(&self) -> &[LinuxNamespace] {
        self.linux()
            .and_then(|linux| linux.namespaces().as_deref())
            .unwrap_or_default()
    }

    pub fn uid_mappings(&self) -> &[LinuxIdMapping] {
        self.linux()
            .and_then(|linux| linux.uid_mappings().as_deref())
            .unwrap_or_default()
    }

    pub fn gid_mappings(&self) -> &[LinuxIdMapping] {
        self.linux()
            .and_then(|linux| linux.gid_mappings().as_deref())
            .unwrap_or_default()
    }

    pub fn capabilities(&self) -> Option<&LinuxCapabilities> {
        self.process()
            .and_then(|process| process.capabilities().as_ref())
    }

    pub fn mounts(&self) -> &[Mount] {
        self.spec.mounts().as_deref().unwrap_or_default()
    }

    pub fn apparmor_profile(&self) -> Option<&str> {
        self.process()
            .and_then(|process| process.apparmor_profile().as_deref())
    }

    fn linux(&self) -> Option<&Linux> {
        self.spec.linux().as_ref()
    }

    fn with_spec(&self, f: impl FnOnce(&mut Spec)) -> BundleSpec {
        let mut spec = self.spec.clone();
        f(&mut spec);
        BundleSpec { spec }
    }

    fn with_linux(&self, f: impl FnOnce(&mut Linux)) -> BundleSpec {
        self.with_spec(|spec| {
            let mut linux = spec.linux().clone().unwrap_or_default();
            f(&mut linux);
            spec.set_linux(Some(linux));
        })
    }

    fn with_linux_resources(&self, f: impl FnOnce(&mut LinuxResources)) -> BundleSpec {
        self.with_linux(|linux| {
            let mut resources = linux.resources().clone().unwrap_or_default();
            f(&mut resources);
            linux.set_resources(Some(resources));
        })
    }

    pub fn with_process(&self, process: Process) -> BundleSpec {
        self.with_spec(|spec| {
            spec.set_process(Some(process));
        })
    }

    pub fn with_rootfs<P: Into<PathBuf>>(&self, path: P) -> BundleSpec {
        let path = path.into();
        self.with_spec(|spec| {
            let mut root = spec.root().clone().unwrap_or_else(Root::default);
            root.set_path(path);
            spec.set_root(Some(root));
        })
    }

    pub fn with_hostname(&self, hostname: &str) -> BundleSpec {
        self.with_spec(|spec| {
            spec.set_hostname(Some(hostname.to_owned()));
        })
    }

    /// Sets a single annotation, keeping all others.
    pub fn with_annotation(&self, key: &str, value: &str) -> BundleSpec {
        self.with_spec(|spec| {
            let mut annotations = spec.annotations().clone().unwrap_or_default();
            annotations.insert(key.to_owned(), value.to_owned());
            spec.set_annotations(Some(annotations));
        })
    }

    /// Adds the namespace, replacing any existing namespace of the same type.
    pub fn with_namespace(&self, namespace: LinuxNamespace) -> BundleSpec {
        self.with_linux(|linux| {
            let mut namespaces: Vec<LinuxNamespace> = linux
                .namespaces()
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|existing| existing.typ() != namespace.typ())
                .collect();
            namespaces.push(namespace);
            linux.set_namespaces(Some(namespaces));
        })
    }

    pub fn with_namespaces(&self, namespaces: Vec<LinuxNamespace>) -> BundleSpec {
        self.with_linux(|linux| {
            linux.set_namespaces(Some(namespaces));
        })
    }

    pub fn with_uid_mappings(&self, mappings: Vec<LinuxIdMapping>) -> BundleSpec {
        self.with_linux(|linux| {
            linux.set_uid_mappings(Some(mappings));
        })
    }

    pub fn with_gid_mappings(&self, mappings: Vec<LinuxIdMapping>) -> BundleSpec {
        self.with_linux(|linux| {
            linux.set_gid_mappings(Some(mappings));
        })
    }

    /// Appends mounts after the existing ones.
    pub fn with_mounts(&self, mounts: Vec<Mount>) -> BundleSpec {
        self.with_spec(|spec| {
            let mut all = spec.mounts().clone().unwrap_or_default();
            all.extend(mounts);
            spec.set_mounts(Some(all));
        })
    }

    pub fn with_cpu_shares(&self, shares: u64) -> BundleSpec {
        self.with_linux_resources(|resources| {
            let mut cpu = resources.cpu().clone().unwrap_or_default();
            cpu.set_shares(Some(shares));
            resources.set_cpu(Some(cpu));
        })
    }

    pub fn with_memory_limit(&self, limit: i64) -> BundleSpec {
        self.with_linux_resources(|resources| {
            let mut memory = resources.memory().clone().unwrap_or_default();
            memory.set_limit(Some(limit));
            resources.set_memory(Some(memory));
        })
    }

    pub fn with_cgroups_path<P: Into<PathBuf>>(&self, path: P) -> BundleSpec {
        let path = path.into();
        self.with_linux(|linux| {
            linux.set_cgroups_path(Some(path));
        })
    }

}

/// Host id that container id 0 maps to. Without mappings the container runs
/// in the host user namespace and root is root.
pub fn container_root_host_id(mappings: &[LinuxIdMapping]) -> u32 {
    mappings
        .iter()
        .find(|mapping| mapping.container_id() == 0)
        .map(|mapping| mapping.host_id())
        .unwrap_or(0)
}

/// Maps a container id onto the host through the given mappings.
pub fn map_to_host(mappings: &[LinuxIdMapping], id: u32) -> u32 {
    mappings
        .iter()
        .find(|mapping| {
            id >= mapping.container_id() && id - mapping.container_id() < mapping.size()
        })
        .map(|mapping| mapping.host_id() + (id - mapping.container_id()))
        .unwrap_or(id)
}
