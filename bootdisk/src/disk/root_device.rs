//! Appending partitions to the root disk.
//!
//! Used when no ephemeral disk is attached: swap and data partitions are
//! carved out of the space after the root partition.

use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, ResultExt};

use super::parted::{PartedTable, parse_parted_print, run_parted_print};
use super::{ExistingPartition, Partition, round_up, within_delta};
use crate::constants::sizes;
use crate::system::CmdRunner;

pub struct RootDevicePartitioner {
    runner: Arc<dyn CmdRunner>,
    delta_in_bytes: u64,
}

impl RootDevicePartitioner {
    pub fn new(runner: Arc<dyn CmdRunner>, delta_in_bytes: u64) -> Self {
        Self {
            runner,
            delta_in_bytes,
        }
    }

    /// Bytes left on `device` after partition `after_number`.
    pub fn remaining_size_in_bytes(&self, device: &str, after_number: u32) -> BootdiskResult<u64> {
        let table = self
            .read_table(device)
            .with_context(|| format!("Getting remaining size of `{}'", device))?;
        let anchor = find_partition(&table, device, after_number)?;

        Ok(table
            .device_size_in_bytes
            .saturating_sub(anchor.end_in_bytes)
            .saturating_sub(1))
    }

    /// Create `partitions` right after partition `after_number`, 1 MiB aligned.
    ///
    /// Partitions already following the anchor that match the request are
    /// accepted as-is; anything else there is an error.
    pub fn partition_after(
        &self,
        device: &str,
        after_number: u32,
        partitions: &[Partition],
    ) -> BootdiskResult<()> {
        let table = self
            .read_table(device)
            .with_context(|| format!("Getting existing partitions of `{}'", device))?;
        tracing::debug!(device, partitions = ?table.partitions, "Current partitions");

        let anchor = find_partition(&table, device, after_number)?;
        let trailing: Vec<&ExistingPartition> = table
            .partitions
            .iter()
            .filter(|p| p.number > after_number)
            .collect();

        if self.trailing_match(&trailing, partitions) {
            tracing::info!(device, "Partitions already match, skipping partitioning");
            return Ok(());
        }

        if !trailing.is_empty() {
            return Err(BootdiskError::Storage(format!(
                "Found {} unexpected partitions on `{}'",
                trailing.len(),
                device
            )));
        }

        let alignment = sizes::PARTITION_ALIGNMENT;
        let last_byte = table.device_size_in_bytes.saturating_sub(1);
        let mut start = round_up(anchor.end_in_bytes + 1, alignment);

        for (index, partition) in partitions.iter().enumerate() {
            let mut end = (start + partition.size_in_bytes).saturating_sub(1);
            if end > last_byte {
                tracing::info!(
                    index,
                    size = last_byte.saturating_sub(start),
                    "Partition would be larger than remaining space, reducing size"
                );
                end = last_byte;
            }

            tracing::info!(device, index, start, end, "Creating partition");
            let (start_arg, end_arg) = (start.to_string(), end.to_string());
            self.runner
                .run_command(
                    "parted",
                    &["-s", device, "unit", "B", "mkpart", "primary", &start_arg, &end_arg],
                )
                .with_context(|| format!("Partitioning disk `{}'", device))?;

            start = round_up(end + 1, alignment);
        }

        Ok(())
    }

    fn read_table(&self, device: &str) -> BootdiskResult<PartedTable> {
        let output = run_parted_print(self.runner.as_ref(), device)
            .with_context(|| format!("Running parted print on `{}'", device))?;
        parse_parted_print(device, &output.stdout)
    }

    fn trailing_match(&self, trailing: &[&ExistingPartition], partitions: &[Partition]) -> bool {
        trailing.len() == partitions.len()
            && trailing.iter().zip(partitions).all(|(existing, wanted)| {
                within_delta(wanted.size_in_bytes, existing.size_in_bytes, self.delta_in_bytes)
            })
    }
}

fn find_partition<'a>(
    table: &'a PartedTable,
    device: &str,
    number: u32,
) -> BootdiskResult<&'a ExistingPartition> {
    table
        .partitions
        .iter()
        .find(|p| p.number == number)
        .ok_or_else(|| {
            BootdiskError::Storage(format!("Missing partition {} on `{}'", number, device))
        })
}
