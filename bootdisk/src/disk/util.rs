//! Block device queries.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, ResultExt};
use tempfile::TempDir;

use super::Mounter;
use crate::system::CmdRunner;

pub struct DiskUtil {
    runner: Arc<dyn CmdRunner>,
    mounter: Mounter,
}

impl DiskUtil {
    pub fn new(runner: Arc<dyn CmdRunner>, mounter: Mounter) -> Self {
        Self { runner, mounter }
    }

    /// Raw size of `device` in bytes, as reported by `lsblk`.
    pub fn block_device_size(&self, device: &str) -> BootdiskResult<u64> {
        let output = self
            .runner
            .run_command("lsblk", &["--nodeps", "-nb", "-o", "SIZE", device])
            .with_context(|| format!("Getting block device size of '{}'", device))?;

        output.stdout.trim().parse().map_err(|_| {
            BootdiskError::Storage(format!(
                "Converting block device size of '{}': '{}'",
                device,
                output.stdout.trim()
            ))
        })
    }

    /// Mount `disk_path` on a scratch directory and read `file_names` off it.
    pub fn files_contents(&self, disk_path: &str, file_names: &[&str]) -> BootdiskResult<Vec<Vec<u8>>> {
        if !Path::new(disk_path).exists() {
            return Err(BootdiskError::Storage(format!(
                "Failed to find disk {}",
                disk_path
            )));
        }

        let mount_dir = TempDir::new().context("Creating temporary mount point")?;
        self.files_contents_in(disk_path, mount_dir, file_names)
    }

    fn files_contents_in(
        &self,
        disk_path: &str,
        mount_dir: TempDir,
        file_names: &[&str],
    ) -> BootdiskResult<Vec<Vec<u8>>> {
        self.mounter
            .mount(disk_path, mount_dir.path(), &[])
            .with_context(|| format!("Mounting disk {}", disk_path))?;

        let contents: BootdiskResult<Vec<Vec<u8>>> = file_names
            .iter()
            .map(|name| {
                let path = mount_dir.path().join(name);
                fs::read(&path).map_err(|e| {
                    BootdiskError::Storage(format!("Failed to read {}: {}", path.display(), e))
                })
            })
            .collect();

        // Unmount by path without consulting the mount table. If that fails
        // the directory must outlive the guard, or dropping it would delete
        // files on the still-mounted disk.
        let mount_point = mount_dir.path().to_string_lossy().into_owned();
        if let Err(e) = self.runner.run_command("umount", &[&mount_point]) {
            let kept = mount_dir.keep();
            tracing::warn!(mount_point = %kept.display(), "Leaving scratch mount point in place");
            return Err(e.context(format!("Unmounting disk {}", disk_path)));
        }

        contents
    }
}
