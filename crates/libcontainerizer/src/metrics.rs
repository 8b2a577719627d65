//! Canonical container metrics shared by both backends.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStat {
    pub usage: u64,
    pub user: u64,
    pub system: u64,
}

/// Memory statistics keyed the way the v1 memory controller names them in
/// `memory.stat`, so raw runtime maps deserialize directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStat {
    pub active_anon: u64,
    pub active_file: u64,
    pub cache: u64,
    pub hierarchical_memory_limit: u64,
    pub inactive_anon: u64,
    pub inactive_file: u64,
    pub mapped_file: u64,
    pub pgfault: u64,
    pub pgmajfault: u64,
    pub pgpgin: u64,
    pub pgpgout: u64,
    pub rss: u64,
    pub total_active_anon: u64,
    pub total_active_file: u64,
    pub total_cache: u64,
    pub total_inactive_anon: u64,
    pub total_inactive_file: u64,
    pub total_mapped_file: u64,
    pub total_pgfault: u64,
    pub total_pgmajfault: u64,
    pub total_pgpgin: u64,
    pub total_pgpgout: u64,
    pub total_rss: u64,
    pub total_unevictable: u64,
    pub unevictable: u64,
    pub swap: u64,
    pub hierarchical_memsw_limit: u64,
    pub total_swap: u64,
    #[serde(rename = "total_usage_towards_limit")]
    pub total_usage_toward_limit: u64,
}

impl MemoryStat {
    /// Memory charged against the limit: rss plus the cache that cannot be
    /// reclaimed cheaply.
    pub fn usage_toward_limit(&self) -> u64 {
        self.total_rss
            .saturating_add(self.total_cache.saturating_sub(self.total_inactive_file))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidStat {
    pub current: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub cpu: CpuStat,
    pub memory: MemoryStat,
    pub pid: PidStat,
    pub age: Duration,
    pub cpu_entitlement: u64,
}

impl ContainerMetrics {
    pub fn new(cpu: CpuStat, mut memory: MemoryStat, pid: PidStat, age: Duration) -> Self {
        memory.total_usage_toward_limit = memory.usage_toward_limit();
        ContainerMetrics {
            cpu,
            memory,
            pid,
            age,
            cpu_entitlement: cpu_entitlement(memory.hierarchical_memory_limit, age),
        }
    }
}

/// CPU time a container is entitled to: its memory limit in gigabytes
/// multiplied by its age in nanoseconds.
pub fn cpu_entitlement(memory_limit_bytes: u64, age: Duration) -> u64 {
    (gigabytes(memory_limit_bytes) * age.as_nanos() as f64) as u64
}

fn gigabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

#[cfg_attr(test, automock)]
pub trait MetricsCollector: Send + Sync {
    fn collect(&self, id: &str) -> Result<ContainerMetrics>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_toward_limit() {
        let memory = MemoryStat {
            total_rss: 100,
            total_cache: 50,
            total_inactive_file: 20,
            ..Default::default()
        };
        assert_eq!(memory.usage_toward_limit(), 130);
    }

    #[test]
    fn test_usage_toward_limit_does_not_underflow() {
        let memory = MemoryStat {
            total_rss: 100,
            total_cache: 10,
            total_inactive_file: 20,
            ..Default::default()
        };
        assert_eq!(memory.usage_toward_limit(), 100);
    }

    #[test]
    fn test_cpu_entitlement() {
        let one_gig = 1024 * 1024 * 1024;
        assert_eq!(cpu_entitlement(one_gig, Duration::from_secs(2)), 2_000_000_000);
        assert_eq!(
            cpu_entitlement(one_gig / 2, Duration::from_secs(2)),
            1_000_000_000
        );
        assert_eq!(cpu_entitlement(0, Duration::from_secs(2)), 0);
    }

    #[test]
    fn test_new_fills_derived_fields() {
        let memory = MemoryStat {
            hierarchical_memory_limit: 1024 * 1024 * 1024,
            total_rss: 7,
            ..Default::default()
        };
        let metrics = ContainerMetrics::new(
            CpuStat::default(),
            memory,
            PidStat::default(),
            Duration::from_nanos(10),
        );
        assert_eq!(metrics.memory.total_usage_toward_limit, 7);
        assert_eq!(metrics.cpu_entitlement, 10);
    }

    #[test]
    fn test_memory_stat_from_raw_map() {
        let raw = r#"{"cache": 1, "total_rss": 2, "pgfault": 3, "unknown_key": 4}"#;
        let memory: MemoryStat = serde_json::from_str(raw).unwrap();
        assert_eq!((memory.cache, memory.total_rss, memory.pgfault), (1, 2, 3));
    }
}
