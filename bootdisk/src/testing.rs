//! Scripted host fakes for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskError, BootdiskResult, CommandOutput};
use bootdisk_shared::settings::DiskSettings;
use parking_lot::Mutex;

use crate::system::{
    CmdRunner, DevicePathResolver, MemoryStats, Mount, MountsSearcher, SystemDeps,
    format_command,
};

enum FakeResult {
    Success(CommandOutput),
    Failure(CommandOutput),
}

/// Records every command and answers from a per-command-line script.
///
/// Unscripted commands succeed with empty output. `mount` and `umount`
/// also update the linked `FakeMounts` so later mount-table queries see
/// the effect.
pub(crate) struct FakeCmdRunner {
    results: Mutex<HashMap<String, VecDeque<FakeResult>>>,
    commands: Mutex<Vec<String>>,
    inputs: Mutex<Vec<(String, String)>>,
    missing: Mutex<Vec<String>>,
    mounts: Arc<FakeMounts>,
}

impl FakeCmdRunner {
    pub(crate) fn new(mounts: Arc<FakeMounts>) -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            missing: Mutex::new(Vec::new()),
            mounts,
        }
    }

    fn push(&self, command: &str, result: FakeResult) {
        self.results
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(result);
    }

    pub(crate) fn add_stdout(&self, command: &str, stdout: &str) {
        self.push(command, FakeResult::Success(CommandOutput::new(stdout, "", 0)));
    }

    pub(crate) fn add_failure(&self, command: &str, stdout: &str, stderr: &str) {
        self.push(command, FakeResult::Failure(CommandOutput::new(stdout, stderr, 1)));
    }

    pub(crate) fn set_missing(&self, name: &str) {
        self.missing.lock().push(name.to_string());
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub(crate) fn ran(&self, command: &str) -> bool {
        self.commands.lock().iter().any(|c| c == command)
    }

    /// Number of recorded commands starting with `prefix`.
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub(crate) fn inputs(&self) -> Vec<(String, String)> {
        self.inputs.lock().clone()
    }

    fn apply_mount_side_effects(&self, name: &str, args: &[&str]) {
        match name {
            "mount" if !args.iter().any(|a| a.starts_with("remount")) && args.len() >= 2 => {
                let source = args[args.len() - 2];
                let target = args[args.len() - 1];
                self.mounts.add(source, target);
            }
            "umount" if !args.is_empty() => self.mounts.remove(args[args.len() - 1]),
            _ => {}
        }
    }

    fn answer(&self, command: String) -> BootdiskResult<CommandOutput> {
        let next = self
            .results
            .lock()
            .get_mut(&command)
            .and_then(|queue| queue.pop_front());

        match next {
            Some(FakeResult::Failure(output)) => Err(BootdiskError::CommandFailed { command, output }),
            Some(FakeResult::Success(output)) => Ok(output),
            None => Ok(CommandOutput::default()),
        }
    }
}

impl CmdRunner for FakeCmdRunner {
    fn run_command(&self, name: &str, args: &[&str]) -> BootdiskResult<CommandOutput> {
        let command = format_command(name, args);
        self.commands.lock().push(command.clone());
        let result = self.answer(command);
        if result.is_ok() {
            self.apply_mount_side_effects(name, args);
        }
        result
    }

    fn run_command_with_input(
        &self,
        input: &str,
        name: &str,
        args: &[&str],
    ) -> BootdiskResult<CommandOutput> {
        let command = format_command(name, args);
        self.commands.lock().push(command.clone());
        self.inputs.lock().push((command.clone(), input.to_string()));
        self.answer(command)
    }

    fn command_exists(&self, name: &str) -> bool {
        !self.missing.lock().iter().any(|m| m == name)
    }
}

#[derive(Default)]
pub(crate) struct FakeMounts {
    mounts: Mutex<Vec<Mount>>,
    fail: Mutex<bool>,
}

impl FakeMounts {
    pub(crate) fn add(&self, partition_path: &str, mount_point: &str) {
        self.mounts.lock().push(Mount::new(partition_path, mount_point));
    }

    pub(crate) fn remove(&self, path: &str) {
        let mut mounts = self.mounts.lock();
        if let Some(index) = mounts
            .iter()
            .rposition(|m| m.mount_point == path || m.partition_path == path)
        {
            mounts.remove(index);
        }
    }

    pub(crate) fn fail_searches(&self) {
        *self.fail.lock() = true;
    }
}

impl MountsSearcher for FakeMounts {
    fn search_mounts(&self) -> BootdiskResult<Vec<Mount>> {
        if *self.fail.lock() {
            return Err(BootdiskError::Storage("fake mount table failure".to_string()));
        }
        Ok(self.mounts.lock().clone())
    }
}

pub(crate) struct FakeMemory {
    total: Mutex<Option<u64>>,
}

impl FakeMemory {
    pub(crate) fn set(&self, total: Option<u64>) {
        *self.total.lock() = total;
    }
}

impl MemoryStats for FakeMemory {
    fn total_memory_bytes(&self) -> BootdiskResult<u64> {
        self.total
            .lock()
            .ok_or_else(|| BootdiskError::Internal("fake memory failure".to_string()))
    }
}

pub(crate) enum FakeResolution {
    Path(String),
    Timeout,
    Failure,
}

/// Resolves `DiskSettings::path` verbatim unless scripted otherwise.
#[derive(Default)]
pub(crate) struct FakeResolver {
    overrides: Mutex<HashMap<String, FakeResolution>>,
}

impl FakeResolver {
    pub(crate) fn set(&self, disk_id: &str, resolution: FakeResolution) {
        self.overrides.lock().insert(disk_id.to_string(), resolution);
    }
}

impl DevicePathResolver for FakeResolver {
    fn resolve(&self, disk: &DiskSettings) -> BootdiskResult<String> {
        match self.overrides.lock().get(&disk.id) {
            Some(FakeResolution::Path(path)) => Ok(path.clone()),
            Some(FakeResolution::Timeout) => Err(BootdiskError::DeviceTimeout(disk.id.clone())),
            Some(FakeResolution::Failure) => {
                Err(BootdiskError::Storage("fake resolution failure".to_string()))
            }
            None => Ok(disk.path.clone()),
        }
    }
}

/// All fakes wired together.
pub(crate) struct FakeSystem {
    pub(crate) runner: Arc<FakeCmdRunner>,
    pub(crate) mounts: Arc<FakeMounts>,
    pub(crate) memory: Arc<FakeMemory>,
    pub(crate) resolver: Arc<FakeResolver>,
}

impl FakeSystem {
    pub(crate) fn new() -> Self {
        let mounts = Arc::new(FakeMounts::default());
        Self {
            runner: Arc::new(FakeCmdRunner::new(mounts.clone())),
            mounts,
            memory: Arc::new(FakeMemory {
                total: Mutex::new(Some(1024 * 1024 * 1024)),
            }),
            resolver: Arc::new(FakeResolver::default()),
        }
    }

    pub(crate) fn deps(&self) -> SystemDeps {
        SystemDeps {
            runner: self.runner.clone(),
            mounts: self.mounts.clone(),
            memory: self.memory.clone(),
            resolver: self.resolver.clone(),
        }
    }
}
