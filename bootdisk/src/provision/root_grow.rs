//! Growing the root partition and filesystem into unallocated space.

use bootdisk_shared::errors::{BootdiskResult, ResultExt};

use crate::constants::labels;
use crate::disk::root::find_root_partition;
use crate::options::DiskOptions;
use crate::system::SystemDeps;

pub struct RootDiskGrower {
    options: DiskOptions,
    deps: SystemDeps,
}

impl RootDiskGrower {
    pub fn new(options: DiskOptions, deps: SystemDeps) -> Self {
        Self { options, deps }
    }

    /// Grow the root partition with `growpart`, then its filesystem.
    ///
    /// `ephemeral_disk_path` is empty when no ephemeral disk is attached;
    /// if root space then backs the ephemeral volume, there is nothing to
    /// grow into.
    pub fn grow(&self, ephemeral_disk_path: &str) -> BootdiskResult<()> {
        if self.options.skip_disk_setup {
            return Ok(());
        }

        if ephemeral_disk_path.is_empty() && self.options.create_partition_if_no_ephemeral_disk {
            tracing::info!("Root disk space is used for ephemeral data, not growing root");
            return Ok(());
        }

        let runner = self.deps.runner.as_ref();
        if !runner.command_exists("growpart") {
            tracing::warn!("growpart not found, skipping root disk growth");
            return Ok(());
        }

        let root = find_root_partition(self.deps.mounts.as_ref(), runner)
            .context("Finding root partition device")?;
        let number = root.number.to_string();
        tracing::info!(disk = %root.disk, partition = root.number, "Growing root partition");

        match runner.run_command("growpart", &[&root.disk, &number]) {
            Ok(_) => {}
            Err(e)
                if e.command_output()
                    .is_some_and(|o| o.stdout.contains(labels::GROWPART_NOCHANGE)) =>
            {
                tracing::debug!(disk = %root.disk, "Root partition already fills the disk");
            }
            Err(e) => {
                return Err(e.context(format!("Growing root partition `{}'", root.path())));
            }
        }

        let partition = root.path();
        runner
            .run_command("resize2fs", &["-f", &partition])
            .with_context(|| format!("Resizing root filesystem on `{}'", partition))?;

        tracing::info!(partition = %partition, "Root filesystem resized");
        Ok(())
    }
}
