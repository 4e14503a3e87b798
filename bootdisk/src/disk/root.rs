//! Locating the root filesystem's backing partition.

use std::sync::LazyLock;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, ResultExt};
use regex::Regex;

use crate::system::{CmdRunner, MountsSearcher};

/// Root partition split into whole-disk device and partition number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPartition {
    /// Whole-disk device, e.g. `/dev/vda` or `/dev/nvme0n1`.
    pub disk: String,
    /// `p` for nvme/mmcblk naming, empty otherwise.
    pub separator: String,
    pub number: u32,
}

impl RootPartition {
    pub fn path(&self) -> String {
        self.partition(self.number)
    }

    /// Path of another partition on the root disk.
    pub fn partition(&self, number: u32) -> String {
        format!("{}{}{}", self.disk, self.separator, number)
    }
}

/// nvme/mmcblk names first, they also end in digits.
static PARTITION_PATTERNS: LazyLock<Result<[Regex; 2], regex::Error>> = LazyLock::new(|| {
    Ok([
        Regex::new(r"^(/dev/(?:nvme\d+n\d+|mmcblk\d+))(p)(\d+)$")?,
        Regex::new(r"^(/dev/[a-z]+)()(\d+)$")?,
    ])
});

/// Split a canonical partition path such as `/dev/vda2` or `/dev/nvme0n1p3`.
pub fn split_partition_path(path: &str) -> BootdiskResult<Option<RootPartition>> {
    let patterns = PARTITION_PATTERNS
        .as_ref()
        .map_err(|e| BootdiskError::Internal(format!("Invalid partition pattern: {}", e)))?;

    for re in patterns {
        let Some(caps) = re.captures(path) else {
            continue;
        };
        let Ok(number) = caps[3].parse() else {
            continue;
        };
        return Ok(Some(RootPartition {
            disk: caps[1].to_string(),
            separator: caps[2].to_string(),
            number,
        }));
    }

    Ok(None)
}

/// Find the block device mounted at `/` and canonicalize it.
///
/// Pseudo entries such as `rootfs` are skipped; if several real entries
/// exist the last one wins.
pub fn find_root_partition(
    mounts: &dyn MountsSearcher,
    runner: &dyn CmdRunner,
) -> BootdiskResult<RootPartition> {
    let mounts = mounts.search_mounts().context("Searching mounts")?;
    let root = mounts
        .into_iter()
        .filter(|m| m.mount_point == "/" && m.partition_path.starts_with("/dev/"))
        .last()
        .ok_or_else(|| BootdiskError::Storage("Getting root partition device".to_string()))?;
    tracing::debug!(partition = %root.partition_path, "Found root partition");

    let output = runner
        .run_command("readlink", &["-f", &root.partition_path])
        .context("Shelling out to readlink")?;
    let real_path = output.stdout.trim();
    tracing::debug!(partition = real_path, "Resolved root partition");

    split_partition_path(real_path)?.ok_or_else(|| {
        BootdiskError::Storage(format!("Root partition has an invalid name {}", real_path))
    })
}
