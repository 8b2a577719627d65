//! Subset of the OCI linux resources that is applied by hand to a parent
//! cgroup. Both the v1 and v2 code paths only share this conversion.
use std::collections::HashMap;

use oci_spec::runtime::LinuxResources;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupResources {
    pub cpu_shares: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub memory_limit: Option<i64>,
    pub memory_swap: Option<i64>,
    pub unified: HashMap<String, String>,
}

impl From<&LinuxResources> for CgroupResources {
    fn from(resources: &LinuxResources) -> Self {
        let mut converted = CgroupResources::default();

        if let Some(cpu) = resources.cpu() {
            converted.cpu_shares = cpu.shares();
            converted.cpu_quota = cpu.quota();
            converted.cpu_period = cpu.period();
        }

        if let Some(memory) = resources.memory() {
            converted.memory_limit = memory.limit();
            converted.memory_swap = memory.swap();
        }

        if let Some(unified) = resources.unified() {
            converted.unified = unified.clone();
        }

        converted
    }
}

/// Converts optional bundle resources. `None` means the bundle carries no
/// resources section at all.
pub fn convert_resources(resources: Option<&LinuxResources>) -> Option<CgroupResources> {
    resources.map(CgroupResources::from)
}

#[cfg(test)]
mod tests {
    use oci_spec::runtime::{LinuxCpuBuilder, LinuxMemoryBuilder, LinuxResourcesBuilder};

    use super::*;

    #[test]
    fn test_convert_cpu_and_memory() {
        let resources = LinuxResourcesBuilder::default()
            .cpu(
                LinuxCpuBuilder::default()
                    .shares(1024u64)
                    .quota(50000i64)
                    .period(100000u64)
                    .build()
                    .unwrap(),
            )
            .memory(
                LinuxMemoryBuilder::default()
                    .limit(4096i64)
                    .swap(8192i64)
                    .build()
                    .unwrap(),
            )
            .unified(HashMap::from([("pids.max".to_owned(), "10".to_owned())]))
            .build()
            .unwrap();

        let converted = convert_resources(Some(&resources)).unwrap();

        assert_eq!(converted.cpu_shares, Some(1024));
        assert_eq!(converted.cpu_quota, Some(50000));
        assert_eq!(converted.cpu_period, Some(100000));
        assert_eq!(converted.memory_limit, Some(4096));
        assert_eq!(converted.memory_swap, Some(8192));
        assert_eq!(converted.unified.get("pids.max").map(String::as_str), Some("10"));
    }

    #[test]
    fn test_convert_empty_resources() {
        let resources = LinuxResourcesBuilder::default().build().unwrap();
        assert_eq!(
            convert_resources(Some(&resources)),
            Some(CgroupResources::default())
        );
        assert_eq!(convert_resources(None), None);
    }
}
