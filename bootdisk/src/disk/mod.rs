//! Block device primitives.
//!
//! Leaf components consumed by the provisioners:
//! - `Partitioner`: writes partition tables (sfdisk below 2 TiB, parted at or above)
//! - `RootDevicePartitioner`: appends partitions after the root partition
//! - `Formatter`: writes ext4, xfs or swap signatures
//! - `Mounter`: mount, bind, remount and unmount through the mount table
//! - `DiskUtil`: device size and reading files off an unmounted disk
//!
//! `DiskManager` bundles them over one set of host collaborators.

mod formatter;
mod mounter;
mod parted;
mod root_device;
mod sfdisk;
mod util;

pub mod root;

use std::fmt;
use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, ResultExt};

use crate::constants::{labels, sizes};
use crate::system::{CmdRunner, SystemDeps};

pub use formatter::{FileSystem, Formatter};
pub use mounter::Mounter;
pub use parted::PartedPartitioner;
pub use root_device::RootDevicePartitioner;
pub use sfdisk::SfdiskPartitioner;
pub(crate) use sfdisk::dump_partitions;
pub use util::DiskUtil;

// ============================================================================
// Partition model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Swap,
    Linux,
    Empty,
    Unknown,
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionType::Swap => "swap",
            PartitionType::Linux => "linux",
            PartitionType::Empty => "empty",
            PartitionType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A requested partition. Size zero on the last entry means "the rest of
/// the disk".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub size_in_bytes: u64,
    pub partition_type: PartitionType,
}

impl Partition {
    pub fn swap(size_in_bytes: u64) -> Self {
        Self {
            size_in_bytes,
            partition_type: PartitionType::Swap,
        }
    }

    pub fn linux(size_in_bytes: u64) -> Self {
        Self {
            size_in_bytes,
            partition_type: PartitionType::Linux,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}B", self.partition_type, self.size_in_bytes)
    }
}

/// A partition found on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExistingPartition {
    pub number: u32,
    pub start_in_bytes: u64,
    pub end_in_bytes: u64,
    pub size_in_bytes: u64,
    pub partition_type: PartitionType,
    pub name: String,
}

// ============================================================================
// Strategy selection
// ============================================================================

/// Partition table flavour, chosen once per call from the device size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// MBR table written by `sfdisk`.
    Sfdisk,
    /// GPT table written by `parted`.
    Parted,
}

impl PartitionStrategy {
    /// `None` means the size query failed; parted copes with any size.
    pub fn for_device_size(size_in_bytes: Option<u64>) -> Self {
        match size_in_bytes {
            Some(size) if size < sizes::MAX_SFDISK_DEVICE_SIZE => PartitionStrategy::Sfdisk,
            _ => PartitionStrategy::Parted,
        }
    }
}

/// Dispatches partitioning to the selected strategy.
pub struct Partitioner {
    sfdisk: SfdiskPartitioner,
    parted: PartedPartitioner,
}

impl Partitioner {
    pub fn new(runner: Arc<dyn CmdRunner>) -> Self {
        Self {
            sfdisk: SfdiskPartitioner::new(runner.clone()),
            parted: PartedPartitioner::new(runner),
        }
    }

    pub fn partition(
        &self,
        strategy: PartitionStrategy,
        device: &str,
        partitions: &[Partition],
    ) -> BootdiskResult<()> {
        tracing::debug!(device, ?strategy, "Partitioning device");
        match strategy {
            PartitionStrategy::Sfdisk => self.sfdisk.partition(device, partitions),
            PartitionStrategy::Parted => self.parted.partition(device, partitions),
        }
    }
}

// ============================================================================
// DiskManager
// ============================================================================

/// All disk primitives over one set of host collaborators.
pub struct DiskManager {
    pub partitioner: Partitioner,
    pub root_partitioner: RootDevicePartitioner,
    pub formatter: Formatter,
    pub mounter: Mounter,
    pub disk_util: DiskUtil,
}

impl DiskManager {
    pub fn new(deps: &SystemDeps) -> Self {
        let mounter = Mounter::new(deps.runner.clone(), deps.mounts.clone());
        Self {
            partitioner: Partitioner::new(deps.runner.clone()),
            root_partitioner: RootDevicePartitioner::new(
                deps.runner.clone(),
                sizes::PARTITION_MATCH_DELTA,
            ),
            formatter: Formatter::new(deps.runner.clone()),
            disk_util: DiskUtil::new(deps.runner.clone(), mounter.clone()),
            mounter,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn is_device_mapper(device: &str) -> bool {
    device.contains(labels::DEVICE_MAPPER_PREFIX)
}

/// Path of partition `number` on `device`: `/dev/mapper/X-part1`, `/dev/xvda1`.
pub fn partition_path(device: &str, number: u32) -> String {
    if is_device_mapper(device) {
        format!("{}-part{}", device, number)
    } else {
        format!("{}{}", device, number)
    }
}

pub(crate) fn within_delta(expected: u64, actual: u64, delta: u64) -> bool {
    expected.abs_diff(actual) <= delta
}

pub(crate) fn round_up(value: u64, multiple: u64) -> u64 {
    match value % multiple {
        0 => value,
        remainder => value + multiple - remainder,
    }
}

pub(crate) fn round_down(value: u64, multiple: u64) -> u64 {
    value - value % multiple
}

/// Whether `existing` already satisfies `requested`. The last requested
/// partition is compared against whatever space the earlier ones leave.
pub(crate) fn partitions_match(
    existing: &[(PartitionType, u64)],
    requested: &[Partition],
    device_size_in_bytes: u64,
) -> bool {
    if existing.len() < requested.len() {
        return false;
    }

    let mut remaining = device_size_in_bytes;
    for (index, partition) in requested.iter().enumerate() {
        let expected = if index == requested.len() - 1 {
            remaining
        } else {
            partition.size_in_bytes
        };

        let (existing_type, existing_size) = existing[index];
        if existing_type != partition.partition_type
            || !within_delta(expected, existing_size, sizes::PARTITION_MATCH_DELTA)
        {
            return false;
        }

        remaining = remaining.saturating_sub(expected);
    }

    true
}

/// Device-mapper devices only expose new partitions after open-iscsi
/// rescans them.
pub(crate) fn settle_mapper_partition(runner: &dyn CmdRunner, device: &str) -> BootdiskResult<()> {
    runner
        .run_command("/etc/init.d/open-iscsi", &["restart"])
        .context("Shelling out to restart open-iscsi")?;

    let output = runner
        .run_command("dmsetup", &["ls"])
        .context("Shelling out to dmsetup ls")?;

    let name = device.trim_start_matches(labels::DEVICE_MAPPER_PREFIX);
    let found = output
        .stdout
        .lines()
        .any(|line| line.contains("-part1") && line.contains(name));

    if !found {
        return Err(BootdiskError::Storage(format!(
            "Partition {}-part1 does not show up",
            device
        )));
    }

    tracing::info!(partition = %format!("{}-part1", device), "Detected mapper partition");
    Ok(())
}
