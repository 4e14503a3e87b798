//! Device path resolution.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use bootdisk_shared::errors::{BootdiskError, BootdiskResult};
use bootdisk_shared::settings::DiskSettings;

/// Maps disk settings to a concrete kernel device path.
///
/// May block while the device appears. A timeout is reported as
/// `BootdiskError::DeviceTimeout` so callers can treat a missing disk as
/// already detached.
pub trait DevicePathResolver: Send + Sync {
    fn resolve(&self, disk: &DiskSettings) -> BootdiskResult<String>;
}

/// Polls for `DiskSettings::path` to appear, then canonicalizes it.
#[derive(Debug, Clone)]
pub struct PollingDevicePathResolver {
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for PollingDevicePathResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_millis(500))
    }
}

impl PollingDevicePathResolver {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

impl DevicePathResolver for PollingDevicePathResolver {
    fn resolve(&self, disk: &DiskSettings) -> BootdiskResult<String> {
        if disk.path.is_empty() {
            return Err(BootdiskError::Config(format!(
                "Disk {} has no device path",
                disk.id
            )));
        }

        let path = Path::new(&disk.path);
        let deadline = Instant::now() + self.timeout;
        while !path.exists() {
            if Instant::now() >= deadline {
                return Err(BootdiskError::DeviceTimeout(format!(
                    "{} ({})",
                    disk.id, disk.path
                )));
            }
            thread::sleep(self.poll_interval);
        }

        let real = fs::canonicalize(path).map_err(|e| {
            BootdiskError::Storage(format!(
                "Failed to resolve real path of {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::debug!(disk_id = %disk.id, device = %real.display(), "Resolved device path");
        Ok(real.to_string_lossy().into_owned())
    }
}
