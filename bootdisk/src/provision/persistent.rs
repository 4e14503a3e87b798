//! Persistent volume lifecycle: mount, unmount, mountability checks and
//! live migration between two attached disks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, ResultExt};
use bootdisk_shared::settings::{DiskSettings, FileSystemType};

use super::ensure_dir;
use crate::constants::permissions;
use crate::disk::{
    DiskManager, FileSystem, Partition, PartitionStrategy, PartitionType, dump_partitions,
    partition_path,
};
use crate::layout::FilesystemLayout;
use crate::markers::ManagedDiskState;
use crate::options::DiskOptions;
use crate::system::SystemDeps;

pub struct PersistentDiskProvisioner {
    options: DiskOptions,
    layout: FilesystemLayout,
    deps: SystemDeps,
    disks: Arc<DiskManager>,
    state: ManagedDiskState,
}

impl PersistentDiskProvisioner {
    pub fn new(
        options: DiskOptions,
        layout: FilesystemLayout,
        deps: SystemDeps,
        disks: Arc<DiskManager>,
    ) -> Self {
        let state = ManagedDiskState::new(&layout);
        Self {
            options,
            layout,
            deps,
            disks,
            state,
        }
    }

    /// Partition, format and mount `disk` at `mount_point`.
    ///
    /// If another disk already occupies `mount_point`, this one goes to the
    /// migration directory instead and the active mount is left alone.
    pub fn mount(&self, disk: &DiskSettings, mount_point: &Path) -> BootdiskResult<()> {
        tracing::debug!(disk_id = %disk.id, mount_point = %mount_point.display(), "Mounting persistent disk");

        let device = self
            .deps
            .resolver
            .resolve(disk)
            .context("Getting real device path")?;
        let source = self.mount_source(&device);

        let mounter = &self.disks.mounter;
        let current = mounter
            .is_mount_point(mount_point)
            .context("Checking mount point")?;
        tracing::info!(
            device = %device,
            current = ?current,
            mount_point = %mount_point.display(),
            "Resolved persistent disk"
        );

        let target = match current {
            Some(current) if current == source => {
                tracing::info!(partition = %source, mount_point = %mount_point.display(), "Already mounted, skipping");
                return self.record_managed_disk(&disk.id);
            }
            Some(_) => self.layout.store_migration_dir(),
            None => mount_point.to_path_buf(),
        };

        // Preformatted disks keep whatever filesystem they carry.
        let file_system = if self.options.use_preformatted_persistent_disk {
            None
        } else {
            Some(persistent_file_system(&disk.file_system_type)?)
        };

        ensure_dir(&target, permissions::PERSISTENT_DIR)
            .with_context(|| format!("Creating directory {}", target.display()))?;

        if let Some(file_system) = file_system {
            self.partition_and_format(&device, &source, file_system)?;
        }

        mounter
            .mount(&source, &target, &[])
            .context("Mounting partition")?;

        self.record_managed_disk(&disk.id)
    }

    /// Unmount `disk`. `false` when it was not mounted or has already been
    /// detached from the VM.
    pub fn unmount(&self, disk: &DiskSettings) -> BootdiskResult<bool> {
        tracing::debug!(disk_id = %disk.id, "Unmounting persistent disk");

        let device = match self.deps.resolver.resolve(disk) {
            Ok(device) => device,
            Err(e) if e.is_timeout() => {
                tracing::warn!(disk_id = %disk.id, "Timed out resolving persistent disk, treating as detached");
                return Ok(false);
            }
            Err(e) => return Err(e.context("Getting real device path")),
        };

        let source = self.mount_source(&device);
        let unmounted = self.disks.mounter.unmount(&source)?;

        if unmounted && self.managed_disk_id()?.as_deref() == Some(disk.id.as_str()) {
            self.state
                .clear()
                .context("Writing managed_disk_settings.json")?;
        }
        Ok(unmounted)
    }

    pub fn is_mounted(&self, disk: &DiskSettings) -> BootdiskResult<bool> {
        let device = self
            .deps
            .resolver
            .resolve(disk)
            .context("Getting real device path")?;

        let source = self.mount_source(&device);
        self.disks
            .mounter
            .is_mounted(&source)
            .with_context(|| format!("Checking whether {} is mounted", source))
    }

    /// Whether `disk` carries a partition table with at least one entry.
    pub fn is_mountable(&self, disk: &DiskSettings) -> BootdiskResult<bool> {
        let device = self
            .deps
            .resolver
            .resolve(disk)
            .context("Getting real device path")?;

        let partitions = dump_partitions(self.deps.runner.as_ref(), &device)?;
        Ok(partitions
            .iter()
            .any(|p| p.partition_type != PartitionType::Empty))
    }

    /// Copy everything from the disk at `from` onto the disk at `to`, then
    /// put the new disk in place of the old one.
    pub fn migrate(&self, from: &Path, to: &Path) -> BootdiskResult<()> {
        tracing::info!(from = %from.display(), to = %to.display(), "Migrating persistent disk");
        let mounter = &self.disks.mounter;

        mounter
            .remount_as_readonly(from)
            .context("Remounting persistent disk as readonly")?;

        let script = format!(
            "(tar -C {} -cf - .) | (tar -C {} -xpf -)",
            from.display(),
            to.display()
        );
        self.deps
            .runner
            .run_command("sh", &["-c", &script])
            .context("Copying files from old disk to new disk")?;

        mounter
            .unmount(&from.to_string_lossy())
            .context("Unmounting old persistent disk")?;

        mounter
            .remount(to, from, &[])
            .context("Remounting new disk on original mountpoint")?;

        tracing::info!(mount_point = %from.display(), "Persistent disk migrated");
        Ok(())
    }

    /// ID of the persistent disk last recorded as mounted.
    pub fn managed_disk_id(&self) -> BootdiskResult<Option<String>> {
        self.state
            .read()
            .context("Reading managed_disk_settings.json")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.layout.store_dir()
    }

    /// Path that gets mounted for `device`: the raw device for preformatted
    /// disks, its first partition otherwise.
    fn mount_source(&self, device: &str) -> String {
        if self.options.use_preformatted_persistent_disk {
            device.to_string()
        } else {
            partition_path(device, 1)
        }
    }

    fn partition_and_format(
        &self,
        device: &str,
        partition: &str,
        file_system: FileSystem,
    ) -> BootdiskResult<()> {
        let disk_size = match self.disks.disk_util.block_device_size(device) {
            Ok(size) => Some(size),
            Err(e) => {
                tracing::debug!(device, error = %e, "Persistent disk size unknown");
                None
            }
        };
        let strategy = PartitionStrategy::for_device_size(disk_size);
        tracing::debug!(device, ?disk_size, ?strategy, "Selected partitioner");

        self.disks
            .partitioner
            .partition(strategy, device, &[Partition::linux(0)])
            .context("Partitioning disk")?;

        self.disks
            .formatter
            .format(partition, file_system)
            .with_context(|| format!("Formatting partition with {}", file_system))
    }

    fn record_managed_disk(&self, disk_id: &str) -> BootdiskResult<()> {
        if self.managed_disk_id()?.as_deref() == Some(disk_id) {
            return Ok(());
        }
        self.state
            .write(disk_id)
            .context("Writing managed_disk_settings.json")
    }
}

fn persistent_file_system(requested: &FileSystemType) -> BootdiskResult<FileSystem> {
    match requested {
        FileSystemType::Unset | FileSystemType::Ext4 => Ok(FileSystem::Ext4),
        FileSystemType::Xfs => Ok(FileSystem::Xfs),
        FileSystemType::Other(other) => Err(BootdiskError::Config(format!(
            "The filesystem type \"{}\" is not supported",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeResolution, FakeSystem};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        system: FakeSystem,
        layout: FilesystemLayout,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let layout = FilesystemLayout::new(temp_dir.path());
            Self {
                _temp_dir: temp_dir,
                system: FakeSystem::new(),
                layout,
            }
        }

        fn provisioner(&self, options: DiskOptions) -> PersistentDiskProvisioner {
            let deps = self.system.deps();
            let disks = Arc::new(DiskManager::new(&deps));
            PersistentDiskProvisioner::new(options, self.layout.clone(), deps, disks)
        }

        /// Script a 10 GiB size answer for `device`.
        fn sized(&self, device: &str) {
            self.system.runner.add_stdout(
                &format!("lsblk --nodeps -nb -o SIZE {}", device),
                &(10 * crate::constants::sizes::GIB).to_string(),
            );
        }

        fn store(&self) -> String {
            self.layout.store_dir().to_string_lossy().into_owned()
        }

        fn disk_commands(&self) -> usize {
            let runner = &self.system.runner;
            runner.count("sfdisk")
                + runner.count("parted")
                + runner.count("mke2fs")
                + runner.count("mkfs.xfs")
                + runner.count("mount")
        }
    }

    fn preformatted() -> DiskOptions {
        DiskOptions {
            use_preformatted_persistent_disk: true,
            ..DiskOptions::default()
        }
    }

    #[test]
    fn test_mount_partitions_formats_and_records() {
        let fixture = Fixture::new();
        fixture.sized("/dev/sdc");
        let provisioner = fixture.provisioner(DiskOptions::default());

        provisioner
            .mount(&DiskSettings::new("vol-1", "/dev/sdc"), &fixture.layout.store_dir())
            .unwrap();

        let runner = &fixture.system.runner;
        assert_eq!(
            runner.inputs(),
            vec![("sfdisk -uM /dev/sdc".to_string(), ",,L\n".to_string())]
        );
        assert_eq!(runner.count("mke2fs"), 1);
        assert!(runner.ran(&format!("mount /dev/sdc1 {}", fixture.store())));
        assert_eq!(provisioner.managed_disk_id().unwrap(), Some("vol-1".to_string()));
        assert!(fixture.layout.store_dir().is_dir());
    }

    #[test]
    fn test_mount_twice_is_noop() {
        let fixture = Fixture::new();
        fixture.sized("/dev/sdc");
        let provisioner = fixture.provisioner(DiskOptions::default());
        let disk = DiskSettings::new("vol-1", "/dev/sdc");

        provisioner.mount(&disk, &fixture.layout.store_dir()).unwrap();
        provisioner.mount(&disk, &fixture.layout.store_dir()).unwrap();

        let runner = &fixture.system.runner;
        assert_eq!(runner.inputs().len(), 1);
        assert_eq!(runner.count("mke2fs"), 1);
        assert_eq!(runner.count("mount "), 1);
    }

    #[test]
    fn test_mount_mapper_device_uses_part_suffix() {
        let fixture = Fixture::new();
        fixture.sized("/dev/mapper/vol");
        fixture
            .system
            .runner
            .add_stdout("dmsetup ls", "vol-part1\t(252:1)\nvol\t(252:0)\n");

        fixture
            .provisioner(DiskOptions::default())
            .mount(
                &DiskSettings::new("vol-1", "/dev/mapper/vol"),
                &fixture.layout.store_dir(),
            )
            .unwrap();

        assert!(fixture
            .system
            .runner
            .ran(&format!("mount /dev/mapper/vol-part1 {}", fixture.store())));
    }

    #[test]
    fn test_mount_large_disk_uses_parted() {
        let fixture = Fixture::new();
        let size = 3 * 1024 * crate::constants::sizes::GIB;
        fixture
            .system
            .runner
            .add_stdout("lsblk --nodeps -nb -o SIZE /dev/sdd", &size.to_string());
        fixture.system.runner.add_stdout(
            "parted -m /dev/sdd unit B print",
            &format!("BYT;\n/dev/sdd:{}B:scsi:512:512:gpt:Disk;\n", size),
        );

        fixture
            .provisioner(DiskOptions::default())
            .mount(&DiskSettings::new("vol-2", "/dev/sdd"), &fixture.layout.store_dir())
            .unwrap();

        let runner = &fixture.system.runner;
        assert!(runner.inputs().is_empty());
        assert_eq!(runner.count("parted -s /dev/sdd unit B mkpart bosh-partition-0"), 1);
    }

    #[test]
    fn test_mount_xfs() {
        let fixture = Fixture::new();
        fixture.sized("/dev/sdc");
        let disk = DiskSettings::new("vol-1", "/dev/sdc").with_file_system_type(FileSystemType::Xfs);

        fixture
            .provisioner(DiskOptions::default())
            .mount(&disk, &fixture.layout.store_dir())
            .unwrap();

        assert!(fixture.system.runner.ran("mkfs.xfs /dev/sdc1"));
    }

    #[test]
    fn test_mount_rejects_unknown_filesystem() {
        let fixture = Fixture::new();
        let disk = DiskSettings::new("vol-1", "/dev/sdc")
            .with_file_system_type(FileSystemType::from("blahblah"));

        let err = fixture
            .provisioner(DiskOptions::default())
            .mount(&disk, &fixture.layout.store_dir())
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "The filesystem type \"blahblah\" is not supported"
        );
        assert_eq!(fixture.disk_commands(), 0);
    }

    #[test]
    fn test_mount_preformatted_uses_raw_device() {
        let fixture = Fixture::new();

        fixture
            .provisioner(preformatted())
            .mount(&DiskSettings::new("vol-1", "/dev/sdc"), &fixture.layout.store_dir())
            .unwrap();

        let runner = &fixture.system.runner;
        assert!(runner.inputs().is_empty());
        assert_eq!(runner.count("mke2fs"), 0);
        assert!(runner.ran(&format!("mount /dev/sdc {}", fixture.store())));
    }

    #[test]
    fn test_mount_preformatted_ignores_filesystem_type() {
        let fixture = Fixture::new();
        let disk = DiskSettings::new("vol-1", "/dev/sdc")
            .with_file_system_type(FileSystemType::from("btrfs"));

        fixture
            .provisioner(preformatted())
            .mount(&disk, &fixture.layout.store_dir())
            .unwrap();

        assert!(fixture
            .system
            .runner
            .ran(&format!("mount /dev/sdc {}", fixture.store())));
    }

    #[test]
    fn test_mount_second_disk_goes_to_migration_dir() {
        let fixture = Fixture::new();
        fixture.sized("/dev/sdc");
        fixture.system.mounts.add("/dev/sdb1", &fixture.store());

        fixture
            .provisioner(DiskOptions::default())
            .mount(&DiskSettings::new("vol-2", "/dev/sdc"), &fixture.layout.store_dir())
            .unwrap();

        let runner = &fixture.system.runner;
        assert!(runner.ran(&format!(
            "mount /dev/sdc1 {}",
            fixture.layout.store_migration_dir().display()
        )));
        assert_eq!(runner.count("umount"), 0);
        assert!(fixture.layout.store_migration_dir().is_dir());
    }

    #[test]
    fn test_mount_resolution_failure_is_fatal() {
        let fixture = Fixture::new();
        fixture.system.resolver.set("vol-1", FakeResolution::Timeout);

        let err = fixture
            .provisioner(DiskOptions::default())
            .mount(&DiskSettings::new("vol-1", "/dev/sdc"), &fixture.layout.store_dir())
            .unwrap_err();

        assert!(err.to_string().starts_with("Getting real device path"));
        assert_eq!(fixture.disk_commands(), 0);
    }

    #[test]
    fn test_mount_partition_failure() {
        let fixture = Fixture::new();
        fixture.sized("/dev/sdc");
        fixture
            .system
            .runner
            .add_failure("sfdisk -uM /dev/sdc", "", "sfdisk: cannot open /dev/sdc");

        let err = fixture
            .provisioner(DiskOptions::default())
            .mount(&DiskSettings::new("vol-1", "/dev/sdc"), &fixture.layout.store_dir())
            .unwrap_err();

        assert!(err.to_string().starts_with("Partitioning disk: "));
        assert_eq!(fixture.system.runner.count("mount"), 0);
    }

    #[test]
    fn test_unmount() {
        let fixture = Fixture::new();
        fixture.sized("/dev/sdc");
        let provisioner = fixture.provisioner(DiskOptions::default());
        let disk = DiskSettings::new("vol-1", "/dev/sdc");
        provisioner.mount(&disk, &fixture.layout.store_dir()).unwrap();

        assert!(provisioner.unmount(&disk).unwrap());
        assert!(fixture.system.runner.ran("umount /dev/sdc1"));
        assert_eq!(provisioner.managed_disk_id().unwrap(), None);

        assert!(!provisioner.unmount(&disk).unwrap());
        assert_eq!(fixture.system.runner.count("umount"), 1);
    }

    #[test]
    fn test_unmount_other_disk_keeps_state() {
        let fixture = Fixture::new();
        fixture.sized("/dev/sdc");
        let provisioner = fixture.provisioner(DiskOptions::default());
        provisioner
            .mount(&DiskSettings::new("vol-1", "/dev/sdc"), &fixture.layout.store_dir())
            .unwrap();
        fixture.system.mounts.add("/dev/sdd1", "/elsewhere");

        assert!(provisioner
            .unmount(&DiskSettings::new("vol-2", "/dev/sdd"))
            .unwrap());
        assert_eq!(provisioner.managed_disk_id().unwrap(), Some("vol-1".to_string()));
    }

    #[test]
    fn test_unmount_tolerates_resolution_timeout() {
        let fixture = Fixture::new();
        fixture.system.resolver.set("vol-1", FakeResolution::Timeout);

        let unmounted = fixture
            .provisioner(DiskOptions::default())
            .unmount(&DiskSettings::new("vol-1", "/dev/sdc"))
            .unwrap();

        assert!(!unmounted);
        assert!(fixture.system.runner.commands().is_empty());
    }

    #[test]
    fn test_unmount_fails_on_other_resolution_errors() {
        let fixture = Fixture::new();
        fixture.system.resolver.set("vol-1", FakeResolution::Failure);

        let err = fixture
            .provisioner(DiskOptions::default())
            .unmount(&DiskSettings::new("vol-1", "/dev/sdc"))
            .unwrap_err();

        assert!(err.to_string().starts_with("Getting real device path"));
    }

    #[test]
    fn test_is_mounted() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner(DiskOptions::default());
        let disk = DiskSettings::new("vol-1", "/dev/sdc");

        assert!(!provisioner.is_mounted(&disk).unwrap());
        fixture.system.mounts.add("/dev/sdc1", &fixture.store());
        assert!(provisioner.is_mounted(&disk).unwrap());

        fixture.system.resolver.set("vol-1", FakeResolution::Timeout);
        assert!(provisioner.is_mounted(&disk).is_err());
    }

    #[test]
    fn test_is_mountable() {
        let fixture = Fixture::new();
        let runner = &fixture.system.runner;
        runner.add_stdout(
            "sfdisk -d /dev/sdc",
            "# partition table of /dev/sdc\nunit: sectors\n\n\
/dev/sdc1 : start=     2048, size= 20969472, Id=83\n\
/dev/sdc2 : start=        0, size=        0, Id= 0\n",
        );
        runner.add_stdout(
            "sfdisk -d /dev/sdc",
            "/dev/sdc1 : start=        0, size=        0, Id= 0\n",
        );
        runner.add_failure(
            "sfdisk -d /dev/sdc",
            "",
            "sfdisk: /dev/sdc: does not contain a recognized partition table",
        );
        let provisioner = fixture.provisioner(DiskOptions::default());
        let disk = DiskSettings::new("vol-1", "/dev/sdc");

        assert!(provisioner.is_mountable(&disk).unwrap());
        assert!(!provisioner.is_mountable(&disk).unwrap());
        assert!(!provisioner.is_mountable(&disk).unwrap());
    }

    #[test]
    fn test_migrate() {
        let fixture = Fixture::new();
        let store = fixture.store();
        let target = fixture.layout.store_migration_dir();
        fixture.system.mounts.add("/dev/sdb1", &store);
        fixture
            .system
            .mounts
            .add("/dev/sdc1", &target.to_string_lossy());

        fixture
            .provisioner(DiskOptions::default())
            .migrate(&fixture.layout.store_dir(), &target)
            .unwrap();

        let target = target.display();
        assert_eq!(
            fixture.system.runner.commands(),
            vec![
                format!("umount {}", store),
                format!("mount -o ro /dev/sdb1 {}", store),
                format!(
                    "sh -c (tar -C {} -cf - .) | (tar -C {} -xpf -)",
                    store, target
                ),
                format!("umount {}", store),
                format!("umount {}", target),
                format!("mount /dev/sdc1 {}", store),
            ]
        );
    }

    #[test]
    fn test_migrate_copy_failure() {
        let fixture = Fixture::new();
        let store = fixture.store();
        let target = fixture.layout.store_migration_dir();
        fixture.system.mounts.add("/dev/sdb1", &store);
        fixture.system.runner.add_failure(
            &format!(
                "sh -c (tar -C {} -cf - .) | (tar -C {} -xpf -)",
                store,
                target.display()
            ),
            "",
            "tar: write error",
        );

        let err = fixture
            .provisioner(DiskOptions::default())
            .migrate(&fixture.layout.store_dir(), &target)
            .unwrap_err();

        assert!(err
            .to_string()
            .starts_with("Copying files from old disk to new disk"));
    }

    #[test]
    fn test_persistent_file_system() {
        assert_eq!(
            persistent_file_system(&FileSystemType::Unset).unwrap(),
            FileSystem::Ext4
        );
        assert_eq!(
            persistent_file_system(&FileSystemType::Xfs).unwrap(),
            FileSystem::Xfs
        );
        assert!(persistent_file_system(&FileSystemType::from("btrfs")).is_err());
    }
}
