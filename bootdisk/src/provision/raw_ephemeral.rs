//! Claims whole extra disks for job use with a single named GPT partition.

use bootdisk_shared::errors::{BootdiskResult, ResultExt};
use bootdisk_shared::settings::DiskSettings;

use crate::constants::labels;
use crate::options::DiskOptions;
use crate::system::SystemDeps;

pub struct RawEphemeralDiskLabeler {
    options: DiskOptions,
    deps: SystemDeps,
}

impl RawEphemeralDiskLabeler {
    pub fn new(options: DiskOptions, deps: SystemDeps) -> Self {
        Self { options, deps }
    }

    /// Label every unlabeled disk in `disks` as `raw-ephemeral-<index>`.
    ///
    /// The index is the disk's position in `disks`, so repeated boots with
    /// the same list produce the same names.
    pub fn setup(&self, disks: &[DiskSettings]) -> BootdiskResult<()> {
        if self.options.skip_disk_setup {
            return Ok(());
        }

        tracing::info!(count = disks.len(), "Setting up raw ephemeral disks");
        for (index, disk) in disks.iter().enumerate() {
            self.label_disk(index, disk)
                .context("Setting up raw ephemeral disks")?;
        }
        Ok(())
    }

    fn label_disk(&self, index: usize, disk: &DiskSettings) -> BootdiskResult<()> {
        let device = self
            .deps
            .resolver
            .resolve(disk)
            .context("Getting real device path")?;

        let runner = self.deps.runner.as_ref();
        let labeled = match runner.run_command("parted", &["-s", &device, "p"]) {
            Ok(output) => !output.contains(labels::UNRECOGNISED_DISK_LABEL)
                && has_real_partitions(&output.stdout),
            Err(e)
                if e.command_output()
                    .is_some_and(|o| o.contains(labels::UNRECOGNISED_DISK_LABEL)) =>
            {
                false
            }
            Err(e) => {
                return Err(e.context(format!("Getting partition table of `{}'", device)));
            }
        };

        if labeled {
            tracing::debug!(device = %device, "Raw ephemeral disk already labeled");
            return Ok(());
        }

        let name = format!("{}-{}", labels::RAW_EPHEMERAL_PREFIX, index);
        tracing::info!(device = %device, name = %name, "Labeling raw ephemeral disk");
        runner
            .run_command(
                "parted",
                &["-s", &device, "mklabel", "gpt", "unit", "%", "mkpart", &name, "0", "100"],
            )
            .with_context(|| format!("Labeling raw ephemeral disk `{}'", device))?;
        Ok(())
    }
}

/// Whether human-readable `parted print` output shows a real table with
/// at least one partition row.
fn has_real_partitions(stdout: &str) -> bool {
    if stdout
        .lines()
        .any(|line| line.trim() == "Partition Table: loop")
    {
        return false;
    }

    stdout
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with("Number"))
        .skip(1)
        .any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|first| first.parse::<u32>().is_ok())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeResolution, FakeSystem};

    const LABELED: &str = "Model: Xen Virtual Block Device (xvd)
Disk /dev/xvdb: 10.7GB
Sector size (logical/physical): 512B/512B
Partition Table: gpt
Disk Flags:

Number  Start   End     Size    File system  Name             Flags
 1      1049kB  10.7GB  10.7GB               raw-ephemeral-0
";

    const EMPTY_TABLE: &str = "Model: Xen Virtual Block Device (xvd)
Disk /dev/xvdc: 10.7GB
Sector size (logical/physical): 512B/512B
Partition Table: gpt
Disk Flags:

Number  Start  End  Size  File system  Name  Flags

";

    const LOOP_TABLE: &str = "Model: Xen Virtual Block Device (xvd)
Disk /dev/xvdd: 10.7GB
Sector size (logical/physical): 512B/512B
Partition Table: loop
Disk Flags:

Number  Start  End     Size    File system  Flags
 1      0.00B  10.7GB  10.7GB  ext4
";

    fn labeler(system: &FakeSystem, options: DiskOptions) -> RawEphemeralDiskLabeler {
        RawEphemeralDiskLabeler::new(options, system.deps())
    }

    fn disks() -> Vec<DiskSettings> {
        vec![
            DiskSettings::new("raw-0", "/dev/xvdb"),
            DiskSettings::new("raw-1", "/dev/xvdc"),
        ]
    }

    #[test]
    fn test_has_real_partitions() {
        assert!(has_real_partitions(LABELED));
        assert!(!has_real_partitions(EMPTY_TABLE));
        assert!(!has_real_partitions(LOOP_TABLE));
        assert!(!has_real_partitions(""));
    }

    #[test]
    fn test_labels_unlabeled_disks_by_position() {
        let system = FakeSystem::new();
        system.runner.add_failure(
            "parted -s /dev/xvdb p",
            "",
            "Error: /dev/xvdb: unrecognised disk label",
        );
        system.runner.add_stdout("parted -s /dev/xvdc p", EMPTY_TABLE);

        labeler(&system, DiskOptions::default())
            .setup(&disks())
            .unwrap();

        assert!(system
            .runner
            .ran("parted -s /dev/xvdb mklabel gpt unit % mkpart raw-ephemeral-0 0 100"));
        assert!(system
            .runner
            .ran("parted -s /dev/xvdc mklabel gpt unit % mkpart raw-ephemeral-1 0 100"));
    }

    #[test]
    fn test_label_signal_on_stdout() {
        let system = FakeSystem::new();
        system.runner.add_stdout(
            "parted -s /dev/xvdb p",
            "Error: /dev/xvdb: unrecognised disk label\n",
        );

        labeler(&system, DiskOptions::default())
            .setup(&disks()[..1])
            .unwrap();

        assert_eq!(system.runner.count("parted -s /dev/xvdb mklabel"), 1);
    }

    #[test]
    fn test_setup_is_idempotent() {
        let system = FakeSystem::new();
        system.runner.add_stdout("parted -s /dev/xvdb p", EMPTY_TABLE);
        system.runner.add_stdout("parted -s /dev/xvdb p", LABELED);
        let labeler = labeler(&system, DiskOptions::default());

        labeler.setup(&disks()[..1]).unwrap();
        labeler.setup(&disks()[..1]).unwrap();

        assert_eq!(system.runner.count("parted -s /dev/xvdb mklabel"), 1);
        assert_eq!(system.runner.count("parted -s /dev/xvdb p"), 2);
    }

    #[test]
    fn test_other_print_failure_aborts() {
        let system = FakeSystem::new();
        system.runner.add_failure(
            "parted -s /dev/xvdb p",
            "",
            "Error: Could not stat device /dev/xvdb - No such file or directory.",
        );

        let err = labeler(&system, DiskOptions::default())
            .setup(&disks())
            .unwrap_err();

        assert!(err.to_string().starts_with("Setting up raw ephemeral disks: "));
        assert!(err.to_string().contains("Could not stat device"));
        assert_eq!(system.runner.count("parted -s /dev/xvdc"), 0);
        assert_eq!(system.runner.count("parted -s /dev/xvdb mklabel"), 0);
    }

    #[test]
    fn test_resolution_failure_aborts() {
        let system = FakeSystem::new();
        system.resolver.set("raw-0", FakeResolution::Timeout);

        let err = labeler(&system, DiskOptions::default())
            .setup(&disks())
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(err.to_string().contains("Getting real device path"));
        assert!(system.runner.commands().is_empty());
    }

    #[test]
    fn test_skip_disk_setup() {
        let system = FakeSystem::new();
        let options = DiskOptions {
            skip_disk_setup: true,
            ..DiskOptions::default()
        };

        labeler(&system, options).setup(&disks()).unwrap();
        assert!(system.runner.commands().is_empty());
    }

    #[test]
    fn test_resolved_path_is_used() {
        let system = FakeSystem::new();
        system
            .resolver
            .set("raw-0", FakeResolution::Path("/dev/nvme1n1".to_string()));

        labeler(&system, DiskOptions::default())
            .setup(&disks()[..1])
            .unwrap();

        assert!(system.runner.ran("parted -s /dev/nvme1n1 p"));
        assert!(system
            .runner
            .ran("parted -s /dev/nvme1n1 mklabel gpt unit % mkpart raw-ephemeral-0 0 100"));
    }
}
