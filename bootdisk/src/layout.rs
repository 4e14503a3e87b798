//! Filesystem layout of the agent's directories.
//!
//! Everything hangs off a single base directory (`/var/vcap` by default):
//! - `data/`: ephemeral disk mount point
//! - `store/`: persistent disk mount point
//! - `store_migration_target/`: second persistent disk during a migration
//! - `bosh/`: agent state, including `managed_disk_settings.json`
//! - `bosh/etc/`: stemcell metadata
//!
//! System directories relocated onto the data volume are configurable so
//! tests and chroots can point them elsewhere.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::filenames;

/// Environment variable overriding the default base directory.
pub const BASE_DIR_ENV: &str = "BOOTDISK_BASE_DIR";

pub const DEFAULT_BASE_DIR: &str = "/var/vcap";

/// System directories moved onto the data volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemDirs {
    pub home: PathBuf,
    pub tmp: PathBuf,
    pub var_tmp: PathBuf,
    pub var_log: PathBuf,
}

impl Default for SystemDirs {
    fn default() -> Self {
        Self {
            home: PathBuf::from("/home"),
            tmp: PathBuf::from("/tmp"),
            var_tmp: PathBuf::from("/var/tmp"),
            var_log: PathBuf::from("/var/log"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemLayout {
    pub base_dir: PathBuf,
    pub system: SystemDirs,
}

impl Default for FilesystemLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DIR)
    }
}

impl FilesystemLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            system: SystemDirs::default(),
        }
    }

    /// Layout rooted at `$BOOTDISK_BASE_DIR`, falling back to `/var/vcap`.
    pub fn from_env() -> Self {
        match std::env::var_os(BASE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::default(),
        }
    }

    pub fn with_system_dirs(mut self, system: SystemDirs) -> Self {
        self.system = system;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.base_dir.join("store")
    }

    pub fn store_migration_dir(&self) -> PathBuf {
        self.base_dir.join("store_migration_target")
    }

    pub fn bosh_dir(&self) -> PathBuf {
        self.base_dir.join("bosh")
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.bosh_dir().join("etc")
    }

    /// Agent-private temp directory on the data volume.
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir().join("tmp")
    }

    /// Backing directory bind-mounted over `/tmp` and `/var/tmp`.
    pub fn root_tmp_dir(&self) -> PathBuf {
        self.data_dir().join("root_tmp")
    }

    /// Backing directory bind-mounted over `/var/log`.
    pub fn root_log_dir(&self) -> PathBuf {
        self.data_dir().join("root_log")
    }

    pub fn managed_disk_settings_path(&self) -> PathBuf {
        self.bosh_dir().join(filenames::MANAGED_DISK_SETTINGS)
    }

    pub fn stemcell_version_path(&self) -> PathBuf {
        self.etc_dir().join(filenames::STEMCELL_VERSION)
    }

    pub fn agent_version_path(&self) -> PathBuf {
        self.data_dir()
            .join(filenames::AGENT_STATE_DIR)
            .join(filenames::AGENT_VERSION)
    }
}
