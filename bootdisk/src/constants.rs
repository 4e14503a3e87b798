//! Provisioning constants.
//!
//! Sizes, permissions and on-disk names shared across components.

/// Byte sizes and thresholds.
pub mod sizes {
    pub const KIB: u64 = 1024;
    pub const MIB: u64 = 1024 * KIB;
    pub const GIB: u64 = 1024 * MIB;

    /// Devices this large or larger need a GPT label (MBR tops out at 2 TiB).
    pub const MAX_SFDISK_DEVICE_SIZE: u64 = 2 * 1024 * GIB;

    /// Root-disk fallback refuses to create ephemeral partitions below this.
    pub const MIN_ROOT_EPHEMERAL_SPACE: u64 = GIB;

    /// Existing partitions within this distance of the request count as a match.
    pub const PARTITION_MATCH_DELTA: u64 = 20 * MIB;

    /// Partition boundaries are aligned to 1 MiB for HDD reads and SSD erasure.
    pub const PARTITION_ALIGNMENT: u64 = MIB;

    /// Sector size used by `sfdisk -d` dumps.
    pub const SECTOR_SIZE: u64 = 512;
}

/// Directory modes.
pub mod permissions {
    pub const EPHEMERAL_DIR: u32 = 0o750;
    pub const PERSISTENT_DIR: u32 = 0o700;
    pub const AGENT_TMP_DIR: u32 = 0o755;
    pub const ROOT_LOG_DIR: u32 = 0o775;
    pub const AUDIT_LOG_DIR: u32 = 0o750;
    pub const SYSSTAT_LOG_DIR: u32 = 0o755;
}

/// File and directory names under the agent layout.
pub mod filenames {
    pub const MANAGED_DISK_SETTINGS: &str = "managed_disk_settings.json";
    pub const STEMCELL_VERSION: &str = "stemcell_version";
    pub const AGENT_VERSION: &str = "agent_version";
    pub const AGENT_STATE_DIR: &str = ".bosh";
}

/// Names and markers written to or read from partition tables.
pub mod labels {
    /// Prefix of partitions created on GPT-labelled disks.
    pub const PARTITION_NAME_PREFIX: &str = "bosh-partition";
    pub const RAW_EPHEMERAL_PREFIX: &str = "raw-ephemeral";

    /// parted's complaint about a blank disk.
    pub const UNRECOGNISED_DISK_LABEL: &str = "unrecognised disk label";
    /// sfdisk's complaints about a blank disk (old and new wording).
    pub const UNRECOGNIZED_PARTITION_TABLE: &str = "unrecognized partition table type";
    pub const NO_RECOGNIZED_PARTITION_TABLE: &str = "does not contain a recognized partition table";

    /// growpart's answer when the partition already fills the disk.
    pub const GROWPART_NOCHANGE: &str = "NOCHANGE";

    pub const DEVICE_MAPPER_PREFIX: &str = "/dev/mapper/";
}
