use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;

use super::runtime::RuncRuntime;
use crate::depot::Depot;
use crate::error::{ContainerizerError, Result};
use crate::metrics::{ContainerMetrics, CpuStat, MemoryStat, MetricsCollector, PidStat};

#[derive(Debug, Default, Deserialize)]
struct StatsEvent {
    #[serde(default)]
    data: StatsData,
}

#[derive(Debug, Default, Deserialize)]
struct StatsData {
    #[serde(default)]
    cpu: CpuStats,
    #[serde(default)]
    memory: MemoryStats,
    #[serde(default)]
    pids: PidsStats,
}

#[derive(Debug, Default, Deserialize)]
struct CpuStats {
    #[serde(default)]
    usage: CpuUsage,
}

#[derive(Debug, Default, Deserialize)]
struct CpuUsage {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    kernel: u64,
    #[serde(default)]
    user: u64,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    raw: HashMap<String, u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PidsStats {
    #[serde(default)]
    current: u64,
    #[serde(default)]
    limit: u64,
}

/// Decodes `runc events --stats` output into cpu, memory and pid stats.
pub(crate) fn parse_stats(contents: &[u8]) -> Result<(CpuStat, MemoryStat, PidStat)> {
    let event: StatsEvent = serde_json::from_slice(contents).map_err(|err| ContainerizerError::Parse {
        what: "runc stats".to_owned(),
        message: err.to_string(),
    })?;
    let data = event.data;

    let raw = serde_json::to_value(&data.memory.raw).map_err(|err| ContainerizerError::Parse {
        what: "runc memory stats".to_owned(),
        message: err.to_string(),
    })?;
    let memory: MemoryStat = serde_json::from_value(raw).map_err(|err| ContainerizerError::Parse {
        what: "runc memory stats".to_owned(),
        message: err.to_string(),
    })?;

    Ok((
        CpuStat {
            usage: data.cpu.usage.total,
            user: data.cpu.usage.user,
            system: data.cpu.usage.kernel,
        },
        memory,
        PidStat {
            current: data.pids.current,
            max: data.pids.limit,
        },
    ))
}

pub struct RuncStatser {
    runtime: RuncRuntime,
    depot: Arc<dyn Depot>,
}

impl RuncStatser {
    pub fn new(runtime: RuncRuntime, depot: Arc<dyn Depot>) -> Self {
        RuncStatser { runtime, depot }
    }

    /// Creation time reported by runc, or the bundle directory's when runc
    /// does not know it.
    fn created(&self, id: &str) -> Result<SystemTime> {
        match self.runtime.runc_state(id) {
            Ok(state) => {
                if let Some(created) = state.created {
                    return Ok(created.into());
                }
            }
            Err(err) => tracing::debug!(%err, id, "runc state failed, using bundle creation time"),
        }
        self.depot.created_time(id)
    }
}

impl MetricsCollector for RuncStatser {
    #[tracing::instrument(level = "debug", skip(self))]
    fn collect(&self, id: &str) -> Result<ContainerMetrics> {
        let (cpu, memory, pid) = parse_stats(&self.runtime.stats(id)?)?;
        let age = SystemTime::now()
            .duration_since(self.created(id)?)
            .unwrap_or(Duration::ZERO);

        Ok(ContainerMetrics::new(cpu, memory, pid, age))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    const STATS: &str = r#"{
        "type": "stats",
        "id": "handle",
        "data": {
            "cpu": {"usage": {"total": 900, "percpu": [450, 450], "kernel": 300, "user": 600}, "throttling": {}},
            "memory": {
                "usage": {"usage": 4096, "limit": 8192},
                "raw": {
                    "cache": 10,
                    "rss": 20,
                    "total_cache": 100,
                    "total_rss": 200,
                    "total_inactive_file": 30,
                    "hierarchical_memory_limit": 1073741824,
                    "pgfault": 7
                }
            },
            "pids": {"current": 3, "limit": 1024}
        }
    }"#;

    #[test]
    fn test_parse_stats() -> Result<()> {
        let (cpu, memory, pid) = parse_stats(STATS.as_bytes())?;

        assert_eq!(
            cpu,
            CpuStat {
                usage: 900,
                user: 600,
                system: 300
            }
        );
        assert_eq!(memory.cache, 10);
        assert_eq!(memory.total_rss, 200);
        assert_eq!(memory.pgfault, 7);
        assert_eq!(memory.hierarchical_memory_limit, 1 << 30);
        assert_eq!(memory.usage_toward_limit(), 270);
        assert_eq!(pid, PidStat { current: 3, max: 1024 });
        Ok(())
    }

    #[test]
    fn test_parse_sparse_stats() -> Result<()> {
        let (cpu, memory, pid) = parse_stats(br#"{"type":"stats","data":{}}"#)?;

        assert_eq!(cpu, CpuStat::default());
        assert_eq!(memory, MemoryStat::default());
        assert_eq!(pid, PidStat::default());
        Ok(())
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_stats(b"not json"),
            Err(ContainerizerError::Parse { .. })
        ));
    }
}
