//! GPT partitioning with `parted`.

use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, CommandOutput, ResultExt};

use super::{
    ExistingPartition, Partition, PartitionType, is_device_mapper, partitions_match, round_down,
    round_up, settle_mapper_partition,
};
use crate::constants::{labels, sizes};
use crate::system::CmdRunner;

/// Parsed `parted -m <dev> unit B print` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartedTable {
    pub device_size_in_bytes: u64,
    pub partitions: Vec<ExistingPartition>,
}

fn parse_bytes(field: &str) -> Option<u64> {
    field.trim().trim_end_matches('B').parse().ok()
}

/// Parse machine-readable parted output:
///
/// ```text
/// BYT;
/// /dev/xvdf:221190815744B:xvd:512:512:gpt:Xen Virtual Block Device;
/// 1:1048576B:8590983167B:8589934592B:linux-swap(v1):bosh-partition-0:;
/// ```
pub(crate) fn parse_parted_print(device: &str, stdout: &str) -> BootdiskResult<PartedTable> {
    let parse_err = || BootdiskError::Storage(format!("Parsing existing partitions of `{}'", device));

    let mut lines = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "BYT;");

    let device_line = lines.next().ok_or_else(parse_err)?;
    let device_size_in_bytes = device_line
        .split(':')
        .nth(1)
        .and_then(parse_bytes)
        .ok_or_else(|| BootdiskError::Storage(format!("Parsing device size of `{}'", device)))?;

    let mut partitions = Vec::new();
    for line in lines {
        // PReP boot partitions on ppc64le are not ours to manage
        if line.contains("prep") {
            continue;
        }

        let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
        if fields.len() < 4 {
            return Err(parse_err());
        }

        let partition_type = match fields.get(4).copied().unwrap_or("") {
            "ext4" | "xfs" => PartitionType::Linux,
            "linux-swap(v1)" => PartitionType::Swap,
            _ => PartitionType::Unknown,
        };

        partitions.push(ExistingPartition {
            number: fields[0].parse().map_err(|_| parse_err())?,
            start_in_bytes: parse_bytes(fields[1]).ok_or_else(parse_err)?,
            end_in_bytes: parse_bytes(fields[2]).ok_or_else(parse_err)?,
            size_in_bytes: parse_bytes(fields[3]).ok_or_else(parse_err)?,
            partition_type,
            name: fields.get(5).copied().unwrap_or("").to_string(),
        });
    }

    Ok(PartedTable {
        device_size_in_bytes,
        partitions,
    })
}

pub(crate) fn run_parted_print(runner: &dyn CmdRunner, device: &str) -> BootdiskResult<CommandOutput> {
    runner.run_command("parted", &["-m", device, "unit", "B", "print"])
}

fn is_agent_partition(partition: &ExistingPartition) -> bool {
    partition.name.starts_with(labels::PARTITION_NAME_PREFIX)
}

/// Partitions to compare against a request. Once the agent has named
/// partitions on the device only those count; foreign ones are skipped.
///
/// parted reports no filesystem for a partition that was created but never
/// formatted, so an unknown type is taken to be whatever was requested in
/// that slot.
fn comparable_partitions(
    table: &PartedTable,
    requested: &[Partition],
) -> Vec<(PartitionType, u64)> {
    let has_agent_partitions = table.partitions.iter().any(is_agent_partition);

    table
        .partitions
        .iter()
        .filter(|p| !has_agent_partitions || is_agent_partition(p))
        .enumerate()
        .map(|(index, p)| {
            let partition_type = match (p.partition_type, requested.get(index)) {
                (PartitionType::Unknown, Some(wanted)) => wanted.partition_type,
                (partition_type, _) => partition_type,
            };
            (partition_type, p.size_in_bytes)
        })
        .collect()
}

/// Device space left for agent partitions once foreign ones are accounted for.
fn available_size(table: &PartedTable) -> u64 {
    if !table.partitions.iter().any(is_agent_partition) {
        return table.device_size_in_bytes;
    }

    let foreign: u64 = table
        .partitions
        .iter()
        .filter(|p| !is_agent_partition(p))
        .map(|p| p.size_in_bytes)
        .sum();
    table.device_size_in_bytes.saturating_sub(foreign)
}

/// New partitions go after the last existing one, 1 MiB aligned.
fn first_partition_start(table: &PartedTable) -> u64 {
    table
        .partitions
        .iter()
        .map(|p| p.end_in_bytes)
        .max()
        .map_or(sizes::PARTITION_ALIGNMENT, |end| {
            round_up(end + 1, sizes::PARTITION_ALIGNMENT)
        })
}

/// Creates GPT tables with named, 1 MiB aligned partitions.
pub struct PartedPartitioner {
    runner: Arc<dyn CmdRunner>,
}

impl PartedPartitioner {
    pub fn new(runner: Arc<dyn CmdRunner>) -> Self {
        Self { runner }
    }

    pub fn partition(&self, device: &str, partitions: &[Partition]) -> BootdiskResult<()> {
        let table = self
            .read_table(device)
            .with_context(|| format!("Getting existing partitions of `{}'", device))?;

        let existing = comparable_partitions(&table, partitions);
        if partitions_match(&existing, partitions, available_size(&table)) {
            tracing::info!(device, "Device already partitioned as expected, skipping");
            return Ok(());
        }

        if table.partitions.iter().any(is_agent_partition) {
            return Err(BootdiskError::Storage(format!(
                "'{}' contains a partition created by the agent. No partitioning is allowed.",
                device
            )));
        }

        let start = first_partition_start(&table);
        self.create_each_partition(device, partitions, start, table.device_size_in_bytes)?;

        if is_device_mapper(device) {
            settle_mapper_partition(self.runner.as_ref(), device)?;
        }

        Ok(())
    }

    fn read_table(&self, device: &str) -> BootdiskResult<PartedTable> {
        let output = match run_parted_print(self.runner.as_ref(), device) {
            Ok(output) if !output.contains(labels::UNRECOGNISED_DISK_LABEL) => output,
            Ok(_) => self.label_and_print(device)?,
            Err(e)
                if e.command_output()
                    .is_some_and(|o| o.contains(labels::UNRECOGNISED_DISK_LABEL)) =>
            {
                self.label_and_print(device)?
            }
            Err(e) => return Err(e.context("Running parted print")),
        };

        parse_parted_print(device, &output.stdout)
    }

    fn label_and_print(&self, device: &str) -> BootdiskResult<CommandOutput> {
        tracing::info!(device, "No disk label found, creating GPT label");
        self.runner
            .run_command("parted", &["-s", device, "mklabel", "gpt"])
            .context("Parted making label")?;
        run_parted_print(self.runner.as_ref(), device).context("Running parted print")
    }

    fn create_each_partition(
        &self,
        device: &str,
        partitions: &[Partition],
        mut start: u64,
        device_size_in_bytes: u64,
    ) -> BootdiskResult<()> {
        let alignment = sizes::PARTITION_ALIGNMENT;
        let last_byte = device_size_in_bytes.saturating_sub(1);

        for (index, partition) in partitions.iter().enumerate() {
            let mut end = if partition.size_in_bytes == 0 {
                last_byte
            } else {
                start + partition.size_in_bytes
            };
            if end > last_byte {
                tracing::info!(
                    index,
                    size = last_byte.saturating_sub(start),
                    "Partition would be larger than remaining space, reducing size"
                );
                end = last_byte;
            }
            let end = round_down(end, alignment).saturating_sub(1);

            let name = format!("{}-{}", labels::PARTITION_NAME_PREFIX, index);
            let (start_arg, end_arg) = (start.to_string(), end.to_string());
            self.runner
                .run_command(
                    "parted",
                    &["-s", device, "unit", "B", "mkpart", &name, &start_arg, &end_arg],
                )
                .with_context(|| format!("Partitioning disk `{}'", device))?;

            self.runner
                .run_command("partprobe", &[device])
                .with_context(|| format!("Partitioning disk `{}'", device))?;

            if let Err(e) = self.runner.run_command("udevadm", &["settle"]) {
                tracing::warn!(error = %e, "udevadm settle failed");
            }

            tracing::info!(device, index, start, end, "Created partition");
            start = round_up(end + 1, alignment);
        }

        Ok(())
    }
}
