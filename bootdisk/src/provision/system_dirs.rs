//! Moves `/tmp`, `/var/tmp`, `/var/log` and `/home` onto the data volume
//! and hardens them with restrictive mount flags.
//!
//! Each target is bind-mounted only when it is not a mount point yet; the
//! hardening remount is applied on every run so a restart re-asserts the
//! flags. Mount and remount errors are returned unwrapped.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use bootdisk_shared::errors::{BootdiskResult, ResultExt};

use super::ensure_dir;
use crate::constants::permissions;
use crate::disk::Mounter;
use crate::layout::FilesystemLayout;
use crate::options::DiskOptions;
use crate::system::CmdRunner;

const HOME_MOUNT_FLAGS: &[&str] = &["nodev"];
const TMP_MOUNT_FLAGS: &[&str] = &["nodev", "noexec", "nosuid"];

pub struct SystemDirRelocator {
    options: DiskOptions,
    layout: FilesystemLayout,
    runner: Arc<dyn CmdRunner>,
    mounter: Mounter,
}

impl SystemDirRelocator {
    pub fn new(
        options: DiskOptions,
        layout: FilesystemLayout,
        runner: Arc<dyn CmdRunner>,
        mounter: Mounter,
    ) -> Self {
        Self {
            options,
            layout,
            runner,
            mounter,
        }
    }

    pub fn setup(&self) -> BootdiskResult<()> {
        self.setup_home_dir()?;
        self.setup_tmp_dir()?;
        self.setup_log_dir()
    }

    /// Bind `/home` onto itself so it can carry `nodev`.
    pub fn setup_home_dir(&self) -> BootdiskResult<()> {
        let home = &self.layout.system.home;
        if self.mounter.is_mount_point(home)?.is_none() {
            self.mounter.bind_mount(home, home)?;
        }
        self.mounter.remount_in_place(home, HOME_MOUNT_FLAGS)
    }

    pub fn setup_tmp_dir(&self) -> BootdiskResult<()> {
        let system = &self.layout.system;
        let targets = [system.tmp.as_path(), system.var_tmp.as_path()];

        ensure_dir(&self.layout.tmp_dir(), permissions::AGENT_TMP_DIR)
            .context("Creating temp dir")?;

        for target in targets {
            self.restrict_tmp_dir(target)?;
        }

        if self.options.use_default_tmp_dir {
            return Ok(());
        }

        let root_tmp = self.layout.root_tmp_dir();
        let root_tmp_arg = root_tmp.to_string_lossy();
        self.runner
            .run_command("mkdir", &["-p", &root_tmp_arg])
            .context("Creating root tmp dir")?;
        self.runner
            .run_command("chmod", &["0770", &root_tmp_arg])
            .context("Chmoding root tmp dir")?;

        for target in targets {
            if self.mounter.is_mount_point(target)?.is_none() {
                tracing::info!(target = %target.display(), "Bind mounting root tmp dir");
                self.mounter.bind_mount(&root_tmp, target)?;
                self.restrict_tmp_dir(target)?;
            }
            self.mounter.remount_in_place(target, TMP_MOUNT_FLAGS)?;
        }

        Ok(())
    }

    pub fn setup_log_dir(&self) -> BootdiskResult<()> {
        let root_log = self.layout.root_log_dir();
        let root_log_arg = root_log.to_string_lossy();

        ensure_dir(&root_log, permissions::ROOT_LOG_DIR).context("Creating root log dir")?;
        self.runner
            .run_command("chmod", &["0770", &root_log_arg])
            .context("Chmoding root log dir")?;

        ensure_dir(&root_log.join("audit"), permissions::AUDIT_LOG_DIR)
            .context("Creating audit log dir")?;
        ensure_dir(&root_log.join("sysstat"), permissions::SYSSTAT_LOG_DIR)
            .context("Creating sysstat log dir")?;

        self.runner
            .run_command("chown", &["root:syslog", &root_log_arg])
            .context("Chowning root log dir")?;

        for (name, mode) in [("btmp", "0600"), ("wtmp", "0664")] {
            let path = root_log.join(name);
            touch(&path).with_context(|| format!("Touching {}", path.display()))?;

            let path_arg = path.to_string_lossy();
            self.runner
                .run_command("chown", &["root:utmp", &path_arg])
                .with_context(|| format!("Chowning {}", path.display()))?;
            self.runner
                .run_command("chmod", &[mode, &path_arg])
                .with_context(|| format!("Chmoding {}", path.display()))?;
        }

        let var_log = &self.layout.system.var_log;
        if self.mounter.is_mount_point(var_log)?.is_none() {
            tracing::info!(target = %var_log.display(), "Bind mounting root log dir");
            self.mounter.bind_mount(&root_log, var_log)?;
        }

        Ok(())
    }

    fn restrict_tmp_dir(&self, path: &Path) -> BootdiskResult<()> {
        let owner = format!("root:{}", self.options.agent_group);
        let path_arg = path.to_string_lossy();

        self.runner
            .run_command("chown", &[&owner, &path_arg])
            .with_context(|| format!("chown {}", path.display()))?;
        self.runner
            .run_command("chmod", &["0770", &path_arg])
            .with_context(|| format!("chmod {}", path.display()))?;
        Ok(())
    }
}

fn touch(path: &Path) -> BootdiskResult<()> {
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}
