//! OS mount table access.

use std::fs;
use std::path::PathBuf;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult};

/// One entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub partition_path: String,
    pub mount_point: String,
}

impl Mount {
    pub fn new(partition_path: impl Into<String>, mount_point: impl Into<String>) -> Self {
        Self {
            partition_path: partition_path.into(),
            mount_point: mount_point.into(),
        }
    }
}

/// Lists current mounts in table order.
pub trait MountsSearcher: Send + Sync {
    fn search_mounts(&self) -> BootdiskResult<Vec<Mount>>;
}

/// Reads `/proc/mounts` (or another file in the same format).
#[derive(Debug, Clone)]
pub struct ProcMountsSearcher {
    mounts_path: PathBuf,
}

impl Default for ProcMountsSearcher {
    fn default() -> Self {
        Self::new("/proc/mounts")
    }
}

impl ProcMountsSearcher {
    pub fn new(mounts_path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: mounts_path.into(),
        }
    }
}

impl MountsSearcher for ProcMountsSearcher {
    fn search_mounts(&self) -> BootdiskResult<Vec<Mount>> {
        let data = fs::read_to_string(&self.mounts_path).map_err(|e| {
            BootdiskError::Storage(format!(
                "Failed to read mount table {}: {}",
                self.mounts_path.display(),
                e
            ))
        })?;
        Ok(parse_mounts(&data))
    }
}

pub(crate) fn parse_mounts(data: &str) -> Vec<Mount> {
    data.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mount_point = parts.next()?;
            Some(Mount::new(unescape_mount(device), unescape_mount(mount_point)))
        })
        .collect()
}

/// Decode the `\040`-style octal escapes the kernel uses for whitespace.
fn unescape_mount(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }

        let mut octal = String::new();
        while octal.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    octal.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }

        match u8::from_str_radix(&octal, 8) {
            Ok(byte) if octal.len() == 3 => output.push(byte as char),
            _ => {
                output.push('\\');
                output.push_str(&octal);
            }
        }
    }
    output
}
