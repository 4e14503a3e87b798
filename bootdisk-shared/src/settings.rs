//! Disk settings as delivered by the control plane.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Requested filesystem for a persistent disk.
///
/// Unknown names are kept verbatim so the provisioner can reject them
/// with the original spelling instead of failing at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileSystemType {
    #[default]
    Unset,
    Ext4,
    Xfs,
    Other(String),
}

impl FileSystemType {
    pub fn as_str(&self) -> &str {
        match self {
            FileSystemType::Unset => "",
            FileSystemType::Ext4 => "ext4",
            FileSystemType::Xfs => "xfs",
            FileSystemType::Other(name) => name,
        }
    }
}

impl From<String> for FileSystemType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" => FileSystemType::Unset,
            "ext4" => FileSystemType::Ext4,
            "xfs" => FileSystemType::Xfs,
            _ => FileSystemType::Other(value),
        }
    }
}

impl From<&str> for FileSystemType {
    fn from(value: &str) -> Self {
        FileSystemType::from(value.to_string())
    }
}

impl From<FileSystemType> for String {
    fn from(value: FileSystemType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FileSystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical volume attached to the VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSettings {
    /// Stable identity used for idempotency bookkeeping.
    pub id: String,
    /// Infrastructure-provided device hint.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub file_system_type: FileSystemType,
}

impl DiskSettings {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            file_system_type: FileSystemType::Unset,
        }
    }

    pub fn with_file_system_type(mut self, fs: impl Into<FileSystemType>) -> Self {
        self.file_system_type = fs.into();
        self
    }
}
