//! Mounting through `mount(8)` with the mount table as source of truth.

use std::path::Path;
use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, ResultExt};

use crate::system::{CmdRunner, MountsSearcher};

#[derive(Clone)]
pub struct Mounter {
    runner: Arc<dyn CmdRunner>,
    mounts: Arc<dyn MountsSearcher>,
}

impl Mounter {
    pub fn new(runner: Arc<dyn CmdRunner>, mounts: Arc<dyn MountsSearcher>) -> Self {
        Self { runner, mounts }
    }

    pub fn mount(&self, source: &str, mount_point: &Path, options: &[&str]) -> BootdiskResult<()> {
        let target = mount_point.to_string_lossy();
        let mut args: Vec<&str> = options.to_vec();
        args.push(source);
        args.push(&target);

        self.runner.run_command("mount", &args)?;
        tracing::info!(source, mount_point = %target, "Mounted");
        Ok(())
    }

    pub fn bind_mount(&self, source: &Path, target: &Path) -> BootdiskResult<()> {
        self.mount(&source.to_string_lossy(), target, &["--bind"])
    }

    /// Re-apply `options` to an existing mount without unmounting it.
    pub fn remount_in_place(&self, mount_point: &Path, options: &[&str]) -> BootdiskResult<()> {
        let target = mount_point.to_string_lossy();
        let mut flags = String::from("remount");
        for option in options {
            flags.push(',');
            flags.push_str(option);
        }

        self.runner.run_command("mount", &["-o", &flags, &target])?;
        tracing::debug!(mount_point = %target, options = %flags, "Remounted in place");
        Ok(())
    }

    /// Move whatever is mounted at `from` to `to`.
    pub fn remount(&self, from: &Path, to: &Path, options: &[&str]) -> BootdiskResult<()> {
        let source = self.is_mount_point(from)?.ok_or_else(|| {
            BootdiskError::Storage(format!(
                "Error finding device for mount point {}",
                from.display()
            ))
        })?;

        self.unmount(&from.to_string_lossy())?;
        self.mount(&source, to, options)
    }

    pub fn remount_as_readonly(&self, mount_point: &Path) -> BootdiskResult<()> {
        self.remount(mount_point, mount_point, &["-o", "ro"])
    }

    /// Unmount a device or mount point. `false` when nothing was mounted.
    pub fn unmount(&self, device_or_mount_point: &str) -> BootdiskResult<bool> {
        if !self.is_mounted(device_or_mount_point)? {
            tracing::debug!(path = device_or_mount_point, "Not mounted, nothing to unmount");
            return Ok(false);
        }

        self.runner.run_command("umount", &[device_or_mount_point])?;
        tracing::info!(path = device_or_mount_point, "Unmounted");
        Ok(true)
    }

    pub fn swap_on(&self, partition: &str) -> BootdiskResult<()> {
        let output = self
            .runner
            .run_command("swapon", &["-s"])
            .context("Checking active swap")?;

        let active = output
            .stdout
            .lines()
            .any(|line| line.split_whitespace().next() == Some(partition));
        if active {
            tracing::debug!(partition, "Swap already active");
            return Ok(());
        }

        self.runner.run_command("swapon", &[partition])?;
        tracing::info!(partition, "Enabled swap");
        Ok(())
    }

    /// Source currently mounted at `path`, if it is a mount point.
    pub fn is_mount_point(&self, path: &Path) -> BootdiskResult<Option<String>> {
        let path = path.to_string_lossy();
        let mounts = self.mounts.search_mounts().context("Searching mounts")?;

        Ok(mounts
            .into_iter()
            .filter(|m| m.mount_point == path)
            .last()
            .map(|m| m.partition_path))
    }

    /// Whether `device_or_mount_point` appears on either side of the mount table.
    pub fn is_mounted(&self, device_or_mount_point: &str) -> BootdiskResult<bool> {
        let mounts = self.mounts.search_mounts().context("Searching mounts")?;
        Ok(mounts.iter().any(|m| {
            m.partition_path == device_or_mount_point || m.mount_point == device_or_mount_point
        }))
    }
}
