use std::borrow::Cow;
use std::path::Path;

use crate::common::{self, WrappedIoError};
use crate::resources::CgroupResources;

pub const CGROUP_CPU_WEIGHT: &str = "cpu.weight";
pub const CGROUP_CPU_MAX: &str = "cpu.max";
const UNRESTRICTED_QUOTA: &str = "max";
const MAX_CPU_WEIGHT: u64 = 10000;

pub struct Cpu {}

impl Cpu {
    pub fn apply(path: &Path, resources: &CgroupResources) -> Result<(), WrappedIoError> {
        if let Some(shares) = resources.cpu_shares {
            let weight = Self::convert_shares_to_cgroup2(shares);
            if weight != 0 {
                // will result in Erno 34 (numerical result out of range) otherwise
                common::write_cgroup_file(path.join(CGROUP_CPU_WEIGHT), weight)?;
            }
        }

        let cpu_max_file = path.join(CGROUP_CPU_MAX);
        let new_cpu_max: Option<Cow<str>> = match (resources.cpu_quota, resources.cpu_period) {
            (None, Some(period)) => Self::create_period_only_value(&cpu_max_file, period)?,
            (Some(quota), None) if quota > 0 => Some(quota.to_string().into()),
            (Some(_), None) => Some(UNRESTRICTED_QUOTA.into()),
            (Some(quota), Some(period)) if quota > 0 => Some(format!("{quota} {period}").into()),
            (Some(_), Some(period)) => Some(format!("{UNRESTRICTED_QUOTA} {period}").into()),
            (None, None) => None,
        };

        // format is 'quota period', the kernel default is 'max 100000'
        if let Some(cpu_max) = new_cpu_max {
            common::write_cgroup_file_str(&cpu_max_file, &cpu_max)?;
        }

        Ok(())
    }

    /// Maps v1 cpu shares [2-262144] onto the v2 weight range [1-10000].
    pub fn convert_shares_to_cgroup2(shares: u64) -> u64 {
        if shares == 0 {
            return 0;
        }

        let weight = 1 + shares.saturating_sub(2).saturating_mul(9999) / 262142;
        weight.min(MAX_CPU_WEIGHT)
    }

    fn create_period_only_value(
        cpu_max_file: &Path,
        period: u64,
    ) -> Result<Option<Cow<'static, str>>, WrappedIoError> {
        let old_cpu_max = common::read_cgroup_file(cpu_max_file)?;
        if let Some(old_quota) = old_cpu_max.split_whitespace().next() {
            return Ok(Some(format!("{old_quota} {period}").into()));
        }
        Ok(None)
    }
}
