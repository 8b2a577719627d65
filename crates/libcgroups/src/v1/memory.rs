use std::path::Path;

use crate::common::{self, WrappedIoError};

// Makes the memory accounting of a cgroup include its descendants
pub const MEMORY_USE_HIERARCHY: &str = "memory.use_hierarchy";

/// Turns on hierarchical memory accounting for the cgroup at `cgroup_path`.
/// The kernel only reports hierarchical totals on v1 once this flag is set.
pub fn set_use_hierarchy(cgroup_path: &Path) -> Result<(), WrappedIoError> {
    tracing::debug!(?cgroup_path, "enabling memory hierarchy");
    common::write_cgroup_file_str(cgroup_path.join(MEMORY_USE_HIERARCHY), "1")
}

pub fn hierarchy_enabled(cgroup_path: &Path) -> Result<bool, WrappedIoError> {
    let hierarchy = common::read_cgroup_file(cgroup_path.join(MEMORY_USE_HIERARCHY))?;
    Ok(matches!(hierarchy.trim(), "1"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::set_fixture;

    #[test]
    fn test_set_use_hierarchy() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), MEMORY_USE_HIERARCHY, "0").unwrap();

        set_use_hierarchy(tmp.path()).expect("set use_hierarchy");

        assert!(hierarchy_enabled(tmp.path()).unwrap());
    }

    #[test]
    fn test_set_use_hierarchy_missing_cgroup() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("not-a-cgroup");

        let err = set_use_hierarchy(&missing).unwrap_err();

        assert!(matches!(err, WrappedIoError::Open { .. }));
        assert_eq!(err.inner().kind(), std::io::ErrorKind::NotFound);
    }
}
