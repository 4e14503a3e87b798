//! Provisioning policy switches.

use serde::{Deserialize, Serialize};

/// Policy flags fixed at startup and threaded through every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskOptions {
    /// Leave every disk alone; only ensure directories exist.
    pub skip_disk_setup: bool,
    /// Persistent disks arrive partitioned and formatted; mount the raw device.
    pub use_preformatted_persistent_disk: bool,
    /// Without an ephemeral disk, carve ephemeral space out of the root disk.
    pub create_partition_if_no_ephemeral_disk: bool,
    /// Wipe the ephemeral disk when the stemcell version changed.
    pub scrub_ephemeral_disk: bool,
    /// Keep the distribution's `/tmp` instead of bind-mounting the data volume.
    pub use_default_tmp_dir: bool,
    /// Group owning the relocated tmp directories.
    pub agent_group: String,
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self {
            skip_disk_setup: false,
            use_preformatted_persistent_disk: false,
            create_partition_if_no_ephemeral_disk: false,
            scrub_ephemeral_disk: false,
            use_default_tmp_dir: false,
            agent_group: "vcap".to_string(),
        }
    }
}
