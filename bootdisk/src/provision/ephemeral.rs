//! Ephemeral scratch volume.
//!
//! A dedicated ephemeral device is split into swap and data partitions.
//! Without one, and when policy allows it, the same layout is appended
//! after the root partition instead. The data partition is mounted at the
//! data directory; optionally its contents are scrubbed when the stemcell
//! version changed since the disk was last used.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, ResultExt};
use bootdisk_shared::settings::DiskSettings;

use super::ensure_dir;
use crate::constants::{permissions, sizes};
use crate::disk::root::find_root_partition;
use crate::disk::{DiskManager, FileSystem, Partition, PartitionStrategy, partition_path};
use crate::layout::FilesystemLayout;
use crate::markers::VersionMarkers;
use crate::options::DiskOptions;
use crate::system::SystemDeps;

/// Swap and data sizes for a device of `disk_size` bytes.
///
/// An explicit swap size wins (zero disables swap) but must leave room for
/// data. Otherwise swap matches physical memory when the disk holds at
/// least twice that, and the disk is split in half when it does not.
pub fn ephemeral_partition_sizes(
    disk_size: u64,
    memory: u64,
    desired_swap: Option<u64>,
) -> BootdiskResult<(u64, u64)> {
    match desired_swap {
        Some(swap) if swap >= disk_size => Err(BootdiskError::Config(format!(
            "Swap size {} leaves no room for data on a {} byte disk",
            swap, disk_size
        ))),
        Some(swap) => Ok((swap, disk_size - swap)),
        None if disk_size >= memory.saturating_mul(2) => Ok((memory, disk_size - memory)),
        None => Ok((disk_size / 2, disk_size / 2)),
    }
}

/// Partition paths produced by a successful partitioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EphemeralPartitions {
    swap: Option<String>,
    data: String,
}

pub struct EphemeralDiskProvisioner {
    options: DiskOptions,
    layout: FilesystemLayout,
    deps: SystemDeps,
    disks: Arc<DiskManager>,
}

impl EphemeralDiskProvisioner {
    pub fn new(
        options: DiskOptions,
        layout: FilesystemLayout,
        deps: SystemDeps,
        disks: Arc<DiskManager>,
    ) -> Self {
        Self {
            options,
            layout,
            deps,
            disks,
        }
    }

    /// Resolve the ephemeral device, `None` when it cannot be found.
    pub fn disk_path(&self, disk: &DiskSettings) -> Option<String> {
        if disk.path.is_empty() {
            return None;
        }

        match self.deps.resolver.resolve(disk) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(disk_id = %disk.id, error = %e, "Ephemeral disk not found");
                None
            }
        }
    }

    /// Partition, format and mount the ephemeral volume.
    ///
    /// `device_path` is empty when no ephemeral disk is attached.
    /// `desired_swap_size` overrides the memory-based swap sizing.
    pub fn setup(&self, device_path: &str, desired_swap_size: Option<u64>) -> BootdiskResult<()> {
        let mount_point = self.layout.data_dir();

        if self.options.skip_disk_setup {
            ensure_dir(&mount_point, permissions::EPHEMERAL_DIR).context("Creating data dir")?;
            tracing::info!("Disk setup skipped, leaving ephemeral disk alone");
            return self.scrub_if_enabled();
        }

        tracing::info!(device = device_path, "Setting up ephemeral disk");
        self.log_existing_contents(&mount_point)?;
        ensure_dir(&mount_point, permissions::EPHEMERAL_DIR).context("Creating data dir")?;

        let partitions = if device_path.is_empty() {
            if !self.options.create_partition_if_no_ephemeral_disk {
                return Err(BootdiskError::Config(
                    "No ephemeral disk found, cannot use root partition as ephemeral disk"
                        .to_string(),
                ));
            }
            self.partition_root_device(desired_swap_size)
                .context("Creating ephemeral partitions on root device")?
        } else {
            self.partition_ephemeral_disk(device_path, desired_swap_size)
                .context("Partitioning ephemeral disk")?
        };

        let formatter = &self.disks.formatter;
        let mounter = &self.disks.mounter;

        if let Some(swap) = &partitions.swap {
            formatter
                .format(swap, FileSystem::Swap)
                .with_context(|| format!("Formatting swap `{}'", swap))?;
        }
        formatter
            .format(&partitions.data, FileSystem::Ext4)
            .with_context(|| format!("Formatting data partition `{}' with ext4", partitions.data))?;

        if let Some(swap) = &partitions.swap {
            mounter
                .swap_on(swap)
                .with_context(|| format!("Mounting swap `{}'", swap))?;
        }
        mounter
            .mount(&partitions.data, &mount_point, &[])
            .with_context(|| {
                format!(
                    "Mounting data partition `{}' at `{}'",
                    partitions.data,
                    mount_point.display()
                )
            })?;

        self.scrub_if_enabled()
    }

    // ========================================================================
    // Partitioning
    // ========================================================================

    fn log_existing_contents(&self, mount_point: &Path) -> BootdiskResult<()> {
        let entries = match fs::read_dir(mount_point) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(BootdiskError::Io(e).context(format!(
                    "Globbing ephemeral disk mount point `{}/*'",
                    mount_point.display()
                )));
            }
        };

        let names: Vec<String> = entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        if !names.is_empty() {
            // Restarts find a populated mount point; partitioning still
            // proceeds and is skipped only if the table already matches.
            tracing::debug!(
                mount_point = %mount_point.display(),
                contents = ?names,
                "Existing ephemeral mount is not empty"
            );
        }
        Ok(())
    }

    fn partition_sizes(
        &self,
        disk_size: u64,
        desired_swap_size: Option<u64>,
    ) -> BootdiskResult<(u64, u64)> {
        let memory = self
            .deps
            .memory
            .total_memory_bytes()
            .context("Calculating partition sizes")?;
        ephemeral_partition_sizes(disk_size, memory, desired_swap_size)
    }

    fn partition_ephemeral_disk(
        &self,
        device: &str,
        desired_swap_size: Option<u64>,
    ) -> BootdiskResult<EphemeralPartitions> {
        let disk_size = self
            .disks
            .disk_util
            .block_device_size(device)
            .context("Getting device size")?;
        let strategy = PartitionStrategy::for_device_size(Some(disk_size));

        let (swap_size, data_size) = self.partition_sizes(disk_size, desired_swap_size)?;
        let partitions = requested_partitions(swap_size, data_size);
        tracing::info!(
            device,
            swap_size,
            data_size,
            ?strategy,
            "Partitioning ephemeral disk"
        );

        self.disks
            .partitioner
            .partition(strategy, device, &partitions)
            .with_context(|| format!("Partitioning ephemeral disk `{}'", device))?;

        Ok(if swap_size == 0 {
            EphemeralPartitions {
                swap: None,
                data: partition_path(device, 1),
            }
        } else {
            EphemeralPartitions {
                swap: Some(partition_path(device, 1)),
                data: partition_path(device, 2),
            }
        })
    }

    fn partition_root_device(&self, desired_swap_size: Option<u64>) -> BootdiskResult<EphemeralPartitions> {
        tracing::info!("Creating swap & ephemeral partitions on root disk");

        let root = find_root_partition(self.deps.mounts.as_ref(), self.deps.runner.as_ref())
            .context("Finding root partition device")?;

        let root_partitioner = &self.disks.root_partitioner;
        let remaining = root_partitioner
            .remaining_size_in_bytes(&root.disk, root.number)
            .context("Getting root device remaining size")?;

        if remaining < sizes::MIN_ROOT_EPHEMERAL_SPACE {
            return Err(BootdiskError::InsufficientSpace {
                found: remaining,
                required: sizes::MIN_ROOT_EPHEMERAL_SPACE,
            });
        }

        let (swap_size, data_size) = self.partition_sizes(remaining, desired_swap_size)?;
        let partitions = requested_partitions(swap_size, data_size);
        tracing::info!(
            device = %root.disk,
            swap_size,
            data_size,
            "Partitioning root device"
        );

        root_partitioner
            .partition_after(&root.disk, root.number, &partitions)
            .with_context(|| format!("Partitioning root device `{}'", root.disk))?;

        Ok(if swap_size == 0 {
            EphemeralPartitions {
                swap: None,
                data: root.partition(root.number + 1),
            }
        } else {
            EphemeralPartitions {
                swap: Some(root.partition(root.number + 1)),
                data: root.partition(root.number + 2),
            }
        })
    }

    // ========================================================================
    // Scrubbing
    // ========================================================================

    fn scrub_if_enabled(&self) -> BootdiskResult<()> {
        if !self.options.scrub_ephemeral_disk {
            return Ok(());
        }
        self.scrub().context("Scrubbing ephemeral disk")
    }

    /// Wipe the data directory if it was last used by another stemcell.
    fn scrub(&self) -> BootdiskResult<()> {
        let markers = VersionMarkers::new(&self.layout);
        let stemcell_version = markers
            .stemcell_version()
            .context("Reading stemcell version file")?;
        let agent_version = markers
            .agent_version()
            .context("Reading agent version file")?;

        if agent_version.as_deref() == Some(stemcell_version.as_str()) {
            tracing::debug!("Ephemeral disk matches stemcell version, not scrubbing");
            return Ok(());
        }

        let data_dir = self.layout.data_dir();
        tracing::info!(
            data_dir = %data_dir.display(),
            recorded = ?agent_version,
            stemcell = %stemcell_version.trim(),
            "Scrubbing ephemeral disk"
        );

        let entries = fs::read_dir(&data_dir).map_err(|e| {
            BootdiskError::Storage(format!(
                "Failed to list {}: {}",
                data_dir.display(),
                e
            ))
        })?;
        for entry in entries {
            let path = entry?.path();
            let removed = if path.is_dir() && !path.is_symlink() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| {
                BootdiskError::Storage(format!("Failed to remove {}: {}", path.display(), e))
            })?;
        }

        markers
            .record_agent_version(&stemcell_version)
            .context("Recording agent version")
    }
}

fn requested_partitions(swap_size: u64, data_size: u64) -> Vec<Partition> {
    if swap_size == 0 {
        vec![Partition::linux(data_size)]
    } else {
        vec![Partition::swap(swap_size), Partition::linux(data_size)]
    }
}
