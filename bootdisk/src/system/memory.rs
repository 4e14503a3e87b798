//! Physical memory statistics.

use bootdisk_shared::errors::{BootdiskError, BootdiskResult};
use sysinfo::System;

pub trait MemoryStats: Send + Sync {
    fn total_memory_bytes(&self) -> BootdiskResult<u64>;
}

/// Reads total memory through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoMemory;

impl MemoryStats for SysinfoMemory {
    fn total_memory_bytes(&self) -> BootdiskResult<u64> {
        let mut sys = System::new();
        sys.refresh_memory();

        match sys.total_memory() {
            0 => Err(BootdiskError::Internal(
                "Unable to determine total memory".to_string(),
            )),
            total => Ok(total),
        }
    }
}
