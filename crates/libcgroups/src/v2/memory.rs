use std::path::Path;

use crate::common::{self, WrappedIoError};
use crate::resources::CgroupResources;

pub const CGROUP_MEMORY_SWAP: &str = "memory.swap.max";
pub const CGROUP_MEMORY_MAX: &str = "memory.max";

#[derive(thiserror::Error, Debug)]
pub enum V2MemoryControllerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("invalid memory value {0}")]
    MemoryValue(i64),
    #[error("invalid swap value {0}")]
    SwapValue(i64),
    #[error("swap memory ({swap}) should be bigger than memory limit ({limit})")]
    SwapTooSmall { swap: i64, limit: i64 },
    #[error("unable to set swap limit without memory limit")]
    SwapWithoutLimit,
}

pub struct Memory {}

impl Memory {
    // 0 leaves the file untouched and -1 means unlimited
    fn set<P: AsRef<Path>>(path: P, val: i64) -> Result<(), WrappedIoError> {
        match val {
            0 => Ok(()),
            -1 => common::write_cgroup_file_str(path, "max"),
            _ => common::write_cgroup_file(path, val),
        }
    }

    pub fn apply(path: &Path, resources: &CgroupResources) -> Result<(), V2MemoryControllerError> {
        match resources.memory_limit {
            Some(limit) if limit < -1 => Err(V2MemoryControllerError::MemoryValue(limit)),
            Some(limit) => {
                match resources.memory_swap {
                    Some(swap) if swap < -1 => {
                        return Err(V2MemoryControllerError::SwapValue(swap));
                    }
                    Some(swap) if swap == -1 || limit == -1 => {
                        Memory::set(path.join(CGROUP_MEMORY_SWAP), swap)?;
                    }
                    Some(swap) => {
                        if swap < limit {
                            return Err(V2MemoryControllerError::SwapTooSmall { swap, limit });
                        }

                        // v1 expresses swap as memory+swap, v2 as swap alone
                        Memory::set(path.join(CGROUP_MEMORY_SWAP), swap - limit)?;
                    }
                    None if limit == -1 => {
                        Memory::set(path.join(CGROUP_MEMORY_SWAP), -1)?;
                    }
                    None => {}
                }
                Memory::set(path.join(CGROUP_MEMORY_MAX), limit)?;
                Ok(())
            }
            None if resources.memory_swap.is_some() => {
                Err(V2MemoryControllerError::SwapWithoutLimit)
            }
            None => Ok(()),
        }
    }
}
