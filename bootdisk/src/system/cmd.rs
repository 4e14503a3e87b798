//! External command execution.

use std::env;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, CommandOutput};

/// Runs external tools, blocking until they exit.
///
/// A non-zero exit status is an error carrying the captured output, so
/// callers that tolerate specific failures can inspect stdout/stderr via
/// `BootdiskError::command_output`.
pub trait CmdRunner: Send + Sync {
    fn run_command(&self, name: &str, args: &[&str]) -> BootdiskResult<CommandOutput>;

    fn run_command_with_input(
        &self,
        input: &str,
        name: &str,
        args: &[&str],
    ) -> BootdiskResult<CommandOutput>;

    fn command_exists(&self, name: &str) -> bool;
}

/// Render a command line for logs and error messages.
pub fn format_command(name: &str, args: &[&str]) -> String {
    if args.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", name, args.join(" "))
    }
}

/// `CmdRunner` backed by `std::process::Command`.
#[derive(Debug, Default, Clone)]
pub struct ExecCmdRunner;

impl ExecCmdRunner {
    pub fn new() -> Self {
        Self
    }

    fn finish(command: String, output: Output) -> BootdiskResult<CommandOutput> {
        let captured = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_status: output.status.code().unwrap_or(-1),
        };

        if output.status.success() {
            tracing::trace!(command = %command, "Command succeeded");
            Ok(captured)
        } else {
            tracing::debug!(
                command = %command,
                exit_status = captured.exit_status,
                "Command failed"
            );
            Err(BootdiskError::CommandFailed {
                command,
                output: captured,
            })
        }
    }
}

impl CmdRunner for ExecCmdRunner {
    fn run_command(&self, name: &str, args: &[&str]) -> BootdiskResult<CommandOutput> {
        let command = format_command(name, args);
        tracing::debug!(command = %command, "Running command");

        let output = Command::new(name)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| BootdiskError::CommandSpawn {
                command: command.clone(),
                source: e,
            })?;

        Self::finish(command, output)
    }

    fn run_command_with_input(
        &self,
        input: &str,
        name: &str,
        args: &[&str],
    ) -> BootdiskResult<CommandOutput> {
        let command = format_command(name, args);
        tracing::debug!(command = %command, "Running command with input");

        let spawn_err = |e: std::io::Error| BootdiskError::CommandSpawn {
            command: command.clone(),
            source: e,
        };

        let mut child = Command::new(name)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).map_err(spawn_err)?;
        }

        let output = child.wait_with_output().map_err(spawn_err)?;
        Self::finish(command, output)
    }

    fn command_exists(&self, name: &str) -> bool {
        if name.contains('/') {
            return Path::new(name).is_file();
        }

        env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
            .unwrap_or(false)
    }
}
