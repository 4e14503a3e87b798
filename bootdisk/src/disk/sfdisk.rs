//! MBR partitioning with `sfdisk`.

use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, ResultExt};

use super::{Partition, PartitionType, is_device_mapper, partitions_match, settle_mapper_partition};
use crate::constants::{labels, sizes};
use crate::system::CmdRunner;

/// One entry of an `sfdisk -d` dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DumpEntry {
    pub partition_path: String,
    pub size_in_bytes: u64,
    pub partition_type: PartitionType,
}

fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    Some(rest.split(',').next().unwrap_or(rest).trim())
}

/// Parse `sfdisk -d` output. Both the legacy `Id=83` and the newer
/// `type=83` spellings are accepted.
///
/// ```text
/// /dev/sda1 : start=        1, size=  2097152, Id=82
/// /dev/sda2 : start=  2097153, size=  4194304, Id=83
/// /dev/sda3 : start=        0, size=        0, Id= 0
/// ```
pub(crate) fn parse_sfdisk_dump(stdout: &str) -> Vec<DumpEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("/dev/") && line.contains(" : "))
        .map(|line| {
            let partition_path = line.split_whitespace().next().unwrap_or("").to_string();
            let type_id = field_value(line, "Id=")
                .or_else(|| field_value(line, "type="))
                .unwrap_or("");
            let partition_type = match type_id {
                "82" => PartitionType::Swap,
                "83" => PartitionType::Linux,
                "0" | "" => PartitionType::Empty,
                _ => PartitionType::Unknown,
            };
            let sectors: u64 = field_value(line, "size=")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            DumpEntry {
                partition_path,
                size_in_bytes: sectors * sizes::SECTOR_SIZE,
                partition_type,
            }
        })
        .collect()
}

/// Whether sfdisk complained that the device carries no partition table.
pub(crate) fn is_missing_table(err: &BootdiskError) -> bool {
    err.command_output().is_some_and(|o| {
        o.contains(labels::UNRECOGNIZED_PARTITION_TABLE)
            || o.contains(labels::NO_RECOGNIZED_PARTITION_TABLE)
    })
}

/// Read the partition table of `device`; a blank device has no entries.
pub(crate) fn dump_partitions(runner: &dyn CmdRunner, device: &str) -> BootdiskResult<Vec<DumpEntry>> {
    match runner.run_command("sfdisk", &["-d", device]) {
        Ok(output) => Ok(parse_sfdisk_dump(&output.stdout)),
        Err(e) if is_missing_table(&e) => Ok(Vec::new()),
        Err(e) => Err(e.context("Shelling out to sfdisk when getting partitions")),
    }
}

/// Creates MBR tables by piping a script into `sfdisk -uM`.
pub struct SfdiskPartitioner {
    runner: Arc<dyn CmdRunner>,
}

impl SfdiskPartitioner {
    pub fn new(runner: Arc<dyn CmdRunner>) -> Self {
        Self { runner }
    }

    pub fn partition(&self, device: &str, partitions: &[Partition]) -> BootdiskResult<()> {
        if self
            .disk_matches_partitions(device, partitions)
            .with_context(|| format!("Getting partitions for {}", device))?
        {
            tracing::info!(device, "Device already partitioned as expected, skipping");
            return Ok(());
        }

        let input = sfdisk_input(partitions);
        self.runner
            .run_command_with_input(&input, "sfdisk", &["-uM", device])
            .context("Shelling out to sfdisk")?;
        tracing::info!(device, input = %input.trim_end(), "Partitioned device");

        if is_device_mapper(device) {
            settle_mapper_partition(self.runner.as_ref(), device)?;
        }

        Ok(())
    }

    pub fn device_size_in_bytes(&self, device: &str) -> BootdiskResult<u64> {
        let output = self
            .runner
            .run_command("sfdisk", &["-s", device])
            .context("Shelling out to sfdisk when getting device size")?;

        let size_in_kib: u64 = output.stdout.trim().parse().map_err(|_| {
            BootdiskError::Storage(format!(
                "Converting disk size to integer: '{}'",
                output.stdout.trim()
            ))
        })?;

        Ok(size_in_kib * sizes::KIB)
    }

    fn disk_matches_partitions(&self, device: &str, partitions: &[Partition]) -> BootdiskResult<bool> {
        let existing = dump_partitions(self.runner.as_ref(), device)?;
        if existing.len() < partitions.len() {
            return Ok(false);
        }

        let device_size = self
            .device_size_in_bytes(device)
            .with_context(|| format!("Getting device size for {}", device))?;

        let existing: Vec<_> = existing
            .iter()
            .map(|e| (e.partition_type, e.size_in_bytes))
            .collect();
        Ok(partitions_match(&existing, partitions, device_size))
    }
}

/// One `,<MiB>,<type>` line per partition; the last one takes the rest.
fn sfdisk_input(partitions: &[Partition]) -> String {
    partitions
        .iter()
        .enumerate()
        .map(|(index, partition)| {
            let kind = match partition.partition_type {
                PartitionType::Swap => "S",
                _ => "L",
            };
            if index == partitions.len() - 1 {
                format!(",,{}\n", kind)
            } else {
                format!(",{},{}\n", partition.size_in_bytes / sizes::MIB, kind)
            }
        })
        .collect()
}
