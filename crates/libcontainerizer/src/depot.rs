//! Directory of container bundles, one sub-directory per handle.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::bundle::BundleSpec;
use crate::container_manager::VolumeDestroyer;
use crate::error::{ContainerizerError, Result};

#[cfg_attr(test, automock)]
pub trait Depot: Send + Sync {
    fn lookup(&self, handle: &str) -> Result<PathBuf>;
    fn create(&self, handle: &str, bundle: &BundleSpec) -> Result<PathBuf>;
    fn destroy(&self, handle: &str) -> Result<()>;
    fn handles(&self) -> Result<Vec<String>>;
    fn created_time(&self, handle: &str) -> Result<SystemTime>;
}

#[derive(Debug, Clone)]
pub struct DirDepot {
    dir: PathBuf,
}

impl DirDepot {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        DirDepot { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bundle_dir(&self, handle: &str) -> PathBuf {
        self.dir.join(handle)
    }
}

impl Depot for DirDepot {
    fn lookup(&self, handle: &str) -> Result<PathBuf> {
        let path = self.bundle_dir(handle);
        if !path.is_dir() {
            return Err(ContainerizerError::ContainerNotFound {
                handle: handle.to_owned(),
            });
        }
        Ok(path)
    }

    #[tracing::instrument(level = "debug", skip(self, bundle))]
    fn create(&self, handle: &str, bundle: &BundleSpec) -> Result<PathBuf> {
        let path = self.bundle_dir(handle);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(ContainerizerError::AlreadyExists {
                    handle: handle.to_owned(),
                })
            }
            Err(err) => return Err(ContainerizerError::io(&path, err)),
        }

        if let Err(err) = bundle.save(&path) {
            tracing::error!(%err, "saving bundle failed, removing bundle dir");
            if let Err(cleanup) = fs::remove_dir_all(&path) {
                tracing::warn!(%cleanup, ?path, "failed to remove bundle dir");
            }
            return Err(err);
        }

        Ok(path)
    }

    fn destroy(&self, handle: &str) -> Result<()> {
        let path = self.bundle_dir(handle);
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ContainerizerError::io(&path, err)),
        }
    }

    fn handles(&self) -> Result<Vec<String>> {
        let entries =
            fs::read_dir(&self.dir).map_err(|err| ContainerizerError::io(&self.dir, err))?;
        let mut handles = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ContainerizerError::io(&self.dir, err))?;
            if entry.path().is_dir() {
                handles.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        handles.sort();
        Ok(handles)
    }

    fn created_time(&self, handle: &str) -> Result<SystemTime> {
        let path = self.lookup(handle)?;
        let metadata = fs::metadata(&path).map_err(|err| ContainerizerError::io(&path, err))?;
        // not every filesystem records a birth time
        metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| ContainerizerError::io(&path, err))
    }
}

impl VolumeDestroyer for DirDepot {
    fn destroy(&self, handle: &str) -> Result<()> {
        Depot::destroy(self, handle)
    }
}
