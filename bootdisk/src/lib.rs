//! Disk provisioning for VM bootstrap agents.
//!
//! Turns raw block devices attached by an infrastructure provider into
//! usable storage:
//! - ephemeral scratch space (dedicated disk or borrowed root-disk space)
//! - raw ephemeral disks claimed whole for jobs
//! - persistent volumes, including live disk migration
//! - root partition growth
//! - `/tmp`, `/var/tmp`, `/var/log` and `/home` relocation onto the data volume
//!
//! Every step re-queries the OS (mount table, partition dumps) to decide
//! whether work is already done, so the whole sequence is safe to re-run
//! after an agent restart.

pub mod constants;
pub mod disk;
pub mod layout;
pub mod logging;
pub mod markers;
pub mod options;
pub mod platform;
pub mod provision;
pub mod system;

#[cfg(test)]
mod testing;

pub use bootdisk_shared::{
    BootdiskError, BootdiskResult, CommandOutput, DiskSettings, FileSystemType, ResultExt,
};
pub use layout::{FilesystemLayout, SystemDirs};
pub use logging::init_logging;
pub use options::DiskOptions;
pub use platform::{BootstrapPlan, DiskPlatform};
pub use system::SystemDeps;
