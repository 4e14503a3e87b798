//! Filesystem and swap signature creation.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskResult, ResultExt};

use crate::system::CmdRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystem {
    Swap,
    Ext4,
    Xfs,
}

impl FileSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystem::Swap => "swap",
            FileSystem::Ext4 => "ext4",
            FileSystem::Xfs => "xfs",
        }
    }

    /// Whether a partition already carrying `existing` can be used as-is.
    ///
    /// ext4 and xfs are interchangeable for data partitions so a disk
    /// formatted by a previous configuration is never reformatted.
    fn satisfied_by(&self, existing: &str) -> bool {
        match self {
            FileSystem::Swap => existing == "swap",
            FileSystem::Ext4 | FileSystem::Xfs => existing == "ext4" || existing == "xfs",
        }
    }
}

impl fmt::Display for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Formatter {
    runner: Arc<dyn CmdRunner>,
    ext4_features_dir: PathBuf,
}

impl Formatter {
    pub fn new(runner: Arc<dyn CmdRunner>) -> Self {
        Self::with_ext4_features_dir(runner, "/sys/fs/ext4/features")
    }

    pub fn with_ext4_features_dir(runner: Arc<dyn CmdRunner>, dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            ext4_features_dir: dir.into(),
        }
    }

    /// Write `fs` onto `partition` unless a compatible one is already there.
    pub fn format(&self, partition: &str, fs: FileSystem) -> BootdiskResult<()> {
        if let Some(existing) = self
            .current_fs_type(partition)
            .filter(|existing| fs.satisfied_by(existing))
        {
            tracing::debug!(partition, existing = %existing, "Partition already formatted, skipping");
            return Ok(());
        }

        tracing::info!(partition, fs = %fs, "Formatting partition");
        match fs {
            FileSystem::Swap => self
                .runner
                .run_command("mkswap", &[partition])
                .context("Shelling out to mkswap")?,
            FileSystem::Ext4 => {
                let mut args = vec!["-t", "ext4", "-j"];
                if self.ext4_features_dir.join("lazy_itable_init").exists() {
                    args.extend(["-E", "lazy_itable_init=1"]);
                }
                args.push(partition);
                self.runner
                    .run_command("mke2fs", &args)
                    .context("Shelling out to mke2fs")?
            }
            FileSystem::Xfs => self
                .runner
                .run_command("mkfs.xfs", &[partition])
                .context("Shelling out to mkfs.xfs")?,
        };

        Ok(())
    }

    /// `TYPE` reported by `blkid -p`, `None` for a blank partition.
    fn current_fs_type(&self, partition: &str) -> Option<String> {
        let output = self.runner.run_command("blkid", &["-p", partition]).ok()?;
        let start = output.stdout.find(" TYPE=\"")? + " TYPE=\"".len();
        let rest = &output.stdout[start..];
        let end = rest.find('"')?;
        Some(rest[..end].to_string())
    }
}
