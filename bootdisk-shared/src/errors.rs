//! Error taxonomy for disk provisioning.
//!
//! Variants map onto the failure classes callers branch on:
//! - `Config`: unsupported filesystem, policy forbids the requested action
//! - `InsufficientSpace`: not enough room left on the root disk
//! - `DeviceTimeout`: device path resolution gave up waiting
//! - `CommandFailed` / `CommandSpawn`: an external tool failed or could not start
//! - `Context`: any of the above wrapped with the name of the failing step

use std::fmt;
use std::io;

use thiserror::Error;

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_status: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_status,
        }
    }

    /// Whether either stream mentions `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stdout: '{}', stderr: '{}': exit status {}",
            self.stdout.trim_end(),
            self.stderr.trim_end(),
            self.exit_status
        )
    }
}

#[derive(Error, Debug)]
pub enum BootdiskError {
    #[error("{0}")]
    Config(String),

    #[error("Insufficient remaining disk space ({found}B) for ephemeral partition (min: {required}B)")]
    InsufficientSpace { found: u64, required: u64 },

    #[error("Timed out resolving device path for {0}")]
    DeviceTimeout(String),

    #[error("Running command: '{command}', {output}")]
    CommandFailed {
        command: String,
        output: CommandOutput,
    },

    #[error("Running command: '{command}': {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<BootdiskError>,
    },
}

pub type BootdiskResult<T> = Result<T, BootdiskError>;

impl BootdiskError {
    pub fn context(self, context: impl Into<String>) -> Self {
        BootdiskError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping every `Context` layer.
    pub fn root_cause(&self) -> &BootdiskError {
        match self {
            BootdiskError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), BootdiskError::DeviceTimeout(_))
    }

    /// Output of the failed command, if this error came from one.
    pub fn command_output(&self) -> Option<&CommandOutput> {
        match self.root_cause() {
            BootdiskError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Wrap errors with the step that produced them.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> BootdiskResult<T>;

    fn with_context<C, F>(self, f: F) -> BootdiskResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BootdiskError>,
{
    fn context(self, context: impl Into<String>) -> BootdiskResult<T> {
        self.map_err(|e| Into::<BootdiskError>::into(e).context(context))
    }

    fn with_context<C, F>(self, f: F) -> BootdiskResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| Into::<BootdiskError>::into(e).context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_renders_step_and_cause() {
        let result: BootdiskResult<()> =
            Err(BootdiskError::Storage("disk gone".to_string())).context("Mounting partition");
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Mounting partition: disk gone");
    }

    #[test]
    fn test_is_timeout_looks_through_context() {
        let err = BootdiskError::DeviceTimeout("disk-1".to_string())
            .context("Getting real device path")
            .context("Unmounting");
        assert!(err.is_timeout());
        assert!(!BootdiskError::Internal("x".to_string()).is_timeout());
    }

    #[test]
    fn test_command_output_exposed() {
        let err = BootdiskError::CommandFailed {
            command: "parted -s /dev/sdb p".to_string(),
            output: CommandOutput::new("", "Error: unrecognised disk label", 1),
        }
        .context("Setting up raw ephemeral disks");

        let output = err.command_output().unwrap();
        assert!(output.contains("unrecognised disk label"));
        assert!(err.to_string().contains("exit status 1"));
    }

    #[test]
    fn test_insufficient_space_message() {
        let err = BootdiskError::InsufficientSpace {
            found: 10,
            required: 20,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient remaining disk space (10B) for ephemeral partition (min: 20B)"
        );
    }
}
