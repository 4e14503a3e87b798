//! Entry point wiring every provisioner over one set of host collaborators.

use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskResult, ResultExt};
use bootdisk_shared::settings::DiskSettings;
use serde::{Deserialize, Serialize};

use crate::disk::DiskManager;
use crate::layout::FilesystemLayout;
use crate::options::DiskOptions;
use crate::provision::{
    EphemeralDiskProvisioner, PersistentDiskProvisioner, RawEphemeralDiskLabeler, RootDiskGrower,
    SystemDirRelocator,
};
use crate::system::SystemDeps;

/// Disks handed to the agent by the infrastructure at boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapPlan {
    pub ephemeral_disk: Option<DiskSettings>,
    /// Explicit swap size in bytes; `None` sizes swap from physical memory.
    pub swap_size: Option<u64>,
    pub raw_ephemeral_disks: Vec<DiskSettings>,
}

struct PlatformInner {
    disks: Arc<DiskManager>,
    ephemeral: EphemeralDiskProvisioner,
    raw_ephemeral: RawEphemeralDiskLabeler,
    persistent: PersistentDiskProvisioner,
    root_disk: RootDiskGrower,
    system_dirs: SystemDirRelocator,
}

/// Cheaply cloneable handle over all provisioners.
#[derive(Clone)]
pub struct DiskPlatform {
    inner: Arc<PlatformInner>,
}

impl DiskPlatform {
    pub fn new(options: DiskOptions, layout: FilesystemLayout, deps: SystemDeps) -> Self {
        let disks = Arc::new(DiskManager::new(&deps));

        let inner = PlatformInner {
            ephemeral: EphemeralDiskProvisioner::new(
                options.clone(),
                layout.clone(),
                deps.clone(),
                disks.clone(),
            ),
            raw_ephemeral: RawEphemeralDiskLabeler::new(options.clone(), deps.clone()),
            persistent: PersistentDiskProvisioner::new(
                options.clone(),
                layout.clone(),
                deps.clone(),
                disks.clone(),
            ),
            root_disk: RootDiskGrower::new(options.clone(), deps.clone()),
            system_dirs: SystemDirRelocator::new(
                options,
                layout,
                deps.runner.clone(),
                disks.mounter.clone(),
            ),
            disks,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Platform backed by the running host.
    pub fn host(options: DiskOptions, layout: FilesystemLayout) -> Self {
        Self::new(options, layout, SystemDeps::host())
    }

    pub fn ephemeral(&self) -> &EphemeralDiskProvisioner {
        &self.inner.ephemeral
    }

    pub fn raw_ephemeral(&self) -> &RawEphemeralDiskLabeler {
        &self.inner.raw_ephemeral
    }

    pub fn persistent(&self) -> &PersistentDiskProvisioner {
        &self.inner.persistent
    }

    pub fn root_disk(&self) -> &RootDiskGrower {
        &self.inner.root_disk
    }

    pub fn system_dirs(&self) -> &SystemDirRelocator {
        &self.inner.system_dirs
    }

    /// Read `file_names` off the unmounted disk at `disk_path`.
    pub fn files_contents_from_disk(
        &self,
        disk_path: &str,
        file_names: &[&str],
    ) -> BootdiskResult<Vec<Vec<u8>>> {
        self.inner.disks.disk_util.files_contents(disk_path, file_names)
    }

    /// Run the boot-time provisioning sequence, stopping at the first failure.
    pub fn bootstrap(&self, plan: &BootstrapPlan) -> BootdiskResult<()> {
        let ephemeral_path = plan
            .ephemeral_disk
            .as_ref()
            .and_then(|disk| self.ephemeral().disk_path(disk))
            .unwrap_or_default();
        tracing::info!(
            ephemeral = %ephemeral_path,
            raw_ephemeral = plan.raw_ephemeral_disks.len(),
            "Bootstrapping disks"
        );

        self.ephemeral()
            .setup(&ephemeral_path, plan.swap_size)
            .context("Setting up ephemeral disk")?;
        self.raw_ephemeral()
            .setup(&plan.raw_ephemeral_disks)
            .context("Labeling raw ephemeral disks")?;
        self.root_disk()
            .grow(&ephemeral_path)
            .context("Growing root partition")?;
        self.system_dirs()
            .setup()
            .context("Setting up system directories")?;

        tracing::info!("Disk bootstrap complete");
        Ok(())
    }
}
