//! Provisioning operations called by the embedding agent during bootstrap.
//!
//! - `EphemeralDiskProvisioner`: swap + data scratch volume
//! - `RawEphemeralDiskLabeler`: claims whole extra disks for jobs
//! - `PersistentDiskProvisioner`: persistent volume mount, unmount and migration
//! - `RootDiskGrower`: grows the root partition and filesystem
//! - `SystemDirRelocator`: moves `/tmp`, `/var/tmp`, `/var/log`, `/home` onto the data volume

mod ephemeral;
mod persistent;
mod raw_ephemeral;
mod root_grow;
mod system_dirs;

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult};

pub use ephemeral::{EphemeralDiskProvisioner, ephemeral_partition_sizes};
pub use persistent::PersistentDiskProvisioner;
pub use raw_ephemeral::RawEphemeralDiskLabeler;
pub use root_grow::RootDiskGrower;
pub use system_dirs::SystemDirRelocator;

/// Create `path` and its parents; `mode` applies to newly created directories.
pub(crate) fn ensure_dir(path: &Path, mode: u32) -> BootdiskResult<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| {
            BootdiskError::Storage(format!(
                "Failed to create directory {}: {}",
                path.display(),
                e
            ))
        })
}
