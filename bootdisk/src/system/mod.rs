//! Host collaborators consumed by the provisioners.
//!
//! Each seam is a trait so provisioning logic can be driven by scripted
//! fakes in tests:
//! - `CmdRunner`: external partitioning, filesystem and mount tools
//! - `MountsSearcher`: the OS mount table
//! - `MemoryStats`: total physical memory
//! - `DevicePathResolver`: logical disk settings to kernel device paths

mod cmd;
mod devices;
mod memory;
mod mounts;

use std::sync::Arc;

pub use cmd::{CmdRunner, ExecCmdRunner, format_command};
pub use devices::{DevicePathResolver, PollingDevicePathResolver};
pub use memory::{MemoryStats, SysinfoMemory};
pub use mounts::{Mount, MountsSearcher, ProcMountsSearcher};

/// Bundle of host collaborators shared by every component.
#[derive(Clone)]
pub struct SystemDeps {
    pub runner: Arc<dyn CmdRunner>,
    pub mounts: Arc<dyn MountsSearcher>,
    pub memory: Arc<dyn MemoryStats>,
    pub resolver: Arc<dyn DevicePathResolver>,
}

impl SystemDeps {
    /// Collaborators backed by the running host.
    pub fn host() -> Self {
        Self {
            runner: Arc::new(ExecCmdRunner::new()),
            mounts: Arc::new(ProcMountsSearcher::default()),
            memory: Arc::new(SysinfoMemory),
            resolver: Arc::new(PollingDevicePathResolver::default()),
        }
    }
}
