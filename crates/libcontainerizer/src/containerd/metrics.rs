use std::sync::Arc;
use std::time::{Duration, SystemTime};

use prost::Message;

use super::client::DaemonClient;
use super::protos::{self, CGROUPS_V1_METRICS_TYPE_URL};
use crate::container_manager::container_not_found;
use crate::error::{ContainerizerError, Result};
use crate::metrics::{ContainerMetrics, CpuStat, MemoryStat, MetricsCollector, PidStat};

/// Collects cgroup metrics through the containerd task service.
pub struct NerdMetrics {
    client: Arc<dyn DaemonClient>,
}

impl NerdMetrics {
    pub fn new(client: Arc<dyn DaemonClient>) -> Self {
        NerdMetrics { client }
    }

    fn age(&self, id: &str) -> Result<Duration> {
        let record = self.client.get_container(id).map_err(|err| {
            err.into_containerizer(id, "load container", |handle| container_not_found(&handle))
        })?;
        let created = record.created_at.ok_or_else(|| {
            ContainerizerError::backend("container age", format!("{id} has no creation time"))
        })?;
        Ok(SystemTime::now()
            .duration_since(created)
            .unwrap_or(Duration::ZERO))
    }
}

pub(crate) fn decode_metrics(data: &prost_types::Any) -> Result<protos::Metrics> {
    if !data.type_url.ends_with(CGROUPS_V1_METRICS_TYPE_URL) {
        return Err(ContainerizerError::Parse {
            what: "task metrics".to_owned(),
            message: format!("unsupported metrics type {}", data.type_url),
        });
    }
    protos::Metrics::decode(data.value.as_slice()).map_err(|err| ContainerizerError::Parse {
        what: "task metrics".to_owned(),
        message: err.to_string(),
    })
}

pub(crate) fn to_canonical(metrics: &protos::Metrics) -> (CpuStat, MemoryStat, PidStat) {
    let usage = metrics
        .cpu
        .as_ref()
        .and_then(|cpu| cpu.usage.clone())
        .unwrap_or_default();
    let cpu = CpuStat {
        usage: usage.total,
        user: usage.user,
        system: usage.kernel,
    };

    let m = metrics.memory.clone().unwrap_or_default();
    let swap = m.swap.clone().unwrap_or_default();
    let memory = MemoryStat {
        active_anon: m.active_anon,
        active_file: m.active_file,
        cache: m.cache,
        hierarchical_memory_limit: m.hierarchical_memory_limit,
        inactive_anon: m.inactive_anon,
        inactive_file: m.inactive_file,
        mapped_file: m.mapped_file,
        pgfault: m.pg_fault,
        pgmajfault: m.pg_maj_fault,
        pgpgin: m.pg_pg_in,
        pgpgout: m.pg_pg_out,
        rss: m.rss,
        total_active_anon: m.total_active_anon,
        total_active_file: m.total_active_file,
        total_cache: m.total_cache,
        total_inactive_anon: m.total_inactive_anon,
        total_inactive_file: m.total_inactive_file,
        total_mapped_file: m.total_mapped_file,
        total_pgfault: m.total_pg_fault,
        total_pgmajfault: m.total_pg_maj_fault,
        total_pgpgin: m.total_pg_pg_in,
        total_pgpgout: m.total_pg_pg_out,
        total_rss: m.total_rss,
        total_unevictable: m.total_unevictable,
        unevictable: m.unevictable,
        swap: swap.usage,
        hierarchical_memsw_limit: m.hierarchical_swap_limit,
        total_swap: swap.max,
        total_usage_toward_limit: 0,
    };

    let pids = metrics.pids.clone().unwrap_or_default();
    let pid = PidStat {
        current: pids.current,
        max: pids.limit,
    };

    (cpu, memory, pid)
}

impl MetricsCollector for NerdMetrics {
    #[tracing::instrument(level = "debug", skip(self))]
    fn collect(&self, id: &str) -> Result<ContainerMetrics> {
        let data = self
            .client
            .metrics(id)
            .map_err(|err| err.into_containerizer(id, "task metrics", |handle| {
                ContainerizerError::TaskNotFound { handle }
            }))?
            .ok_or_else(|| {
                ContainerizerError::backend("task metrics", format!("no metrics reported for {id}"))
            })?;
        let (cpu, memory, pid) = to_canonical(&decode_metrics(&data)?);

        Ok(ContainerMetrics::new(cpu, memory, pid, self.age(id)?))
    }
}
