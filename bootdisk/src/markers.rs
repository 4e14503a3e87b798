//! Persisted single-value markers.
//!
//! Both markers are plain text with no framing; equality of the stored
//! string is the only compatibility rule. Writes go through a temp file in
//! the same directory followed by a rename, so a crash never leaves a torn
//! value behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bootdisk_shared::errors::{BootdiskError, BootdiskResult};
use tempfile::NamedTempFile;

use crate::layout::FilesystemLayout;

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &str) -> BootdiskResult<()> {
    let dir = path.parent().ok_or_else(|| {
        BootdiskError::Storage(format!("No parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(dir).map_err(|e| {
        BootdiskError::Storage(format!(
            "Failed to create directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        BootdiskError::Storage(format!(
            "Failed to rename into {}: {}",
            path.display(),
            e.error
        ))
    })?;

    Ok(())
}

fn read_optional(path: &Path) -> BootdiskResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BootdiskError::Storage(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// ID of the persistent disk mounted at the store directory.
#[derive(Debug, Clone)]
pub struct ManagedDiskState {
    path: PathBuf,
}

impl ManagedDiskState {
    pub fn new(layout: &FilesystemLayout) -> Self {
        Self {
            path: layout.managed_disk_settings_path(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current disk ID, `None` when nothing is recorded.
    pub fn read(&self) -> BootdiskResult<Option<String>> {
        Ok(read_optional(&self.path)?.filter(|id| !id.is_empty()))
    }

    pub fn write(&self, disk_id: &str) -> BootdiskResult<()> {
        write_atomic(&self.path, disk_id)
    }

    pub fn clear(&self) -> BootdiskResult<()> {
        write_atomic(&self.path, "")
    }
}

/// Stemcell version shipped with the image and the version last recorded
/// on the ephemeral disk.
#[derive(Debug, Clone)]
pub struct VersionMarkers {
    stemcell_path: PathBuf,
    agent_path: PathBuf,
}

impl VersionMarkers {
    pub fn new(layout: &FilesystemLayout) -> Self {
        Self {
            stemcell_path: layout.stemcell_version_path(),
            agent_path: layout.agent_version_path(),
        }
    }

    pub fn stemcell_version(&self) -> BootdiskResult<String> {
        fs::read_to_string(&self.stemcell_path).map_err(|e| {
            BootdiskError::Storage(format!(
                "Failed to read {}: {}",
                self.stemcell_path.display(),
                e
            ))
        })
    }

    pub fn agent_version(&self) -> BootdiskResult<Option<String>> {
        read_optional(&self.agent_path)
    }

    pub fn record_agent_version(&self, version: &str) -> BootdiskResult<()> {
        write_atomic(&self.agent_path, version)
    }
}
