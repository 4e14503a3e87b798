//! Operator CLI driving disk provisioning from a JSON config file.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use bootdisk::{
    BootdiskError, BootdiskResult, BootstrapPlan, DiskOptions, DiskPlatform, DiskSettings,
    FileSystemType, FilesystemLayout, init_logging,
};

#[derive(Parser, Debug)]
#[command(name = "bootdisk", version, about = "Provision VM disks at boot")]
struct Cli {
    /// JSON config with options, layout, bootstrap plan and persistent disk
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set up ephemeral and raw ephemeral disks, grow root, relocate system dirs
    Bootstrap,
    /// Partition, format and mount the persistent disk
    MountPersistent {
        #[command(flatten)]
        disk: DiskArgs,
        /// Defaults to <base_dir>/store
        #[arg(long)]
        mount_point: Option<PathBuf>,
    },
    /// Unmount the persistent disk
    UnmountPersistent {
        #[command(flatten)]
        disk: DiskArgs,
    },
    /// Print whether the persistent disk is mounted
    IsMounted {
        #[command(flatten)]
        disk: DiskArgs,
    },
    /// Print whether the persistent disk has a partition table
    IsMountable {
        #[command(flatten)]
        disk: DiskArgs,
    },
    /// Copy the persistent disk onto the one at the migration target
    Migrate {
        /// Defaults to <base_dir>/store
        #[arg(long)]
        from: Option<PathBuf>,
        /// Defaults to <base_dir>/store_migration_target
        #[arg(long)]
        to: Option<PathBuf>,
    },
}

/// Persistent disk selection; falls back to `persistent_disk` in the config.
#[derive(Args, Debug, Default)]
struct DiskArgs {
    #[arg(long)]
    disk_id: Option<String>,
    #[arg(long)]
    disk_path: Option<String>,
    #[arg(long)]
    file_system: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BootdiskConfig {
    options: DiskOptions,
    layout: Option<FilesystemLayout>,
    plan: BootstrapPlan,
    persistent_disk: Option<DiskSettings>,
}

impl BootdiskConfig {
    fn load(path: Option<&Path>) -> BootdiskResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = fs::read_to_string(path).map_err(|e| {
            BootdiskError::Config(format!("Reading config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            BootdiskError::Config(format!("Parsing config {}: {}", path.display(), e))
        })
    }

    fn persistent_disk(&self, args: &DiskArgs) -> BootdiskResult<DiskSettings> {
        let mut disk = self.persistent_disk.clone().unwrap_or_default();
        if let Some(id) = &args.disk_id {
            disk.id = id.clone();
        }
        if let Some(path) = &args.disk_path {
            disk.path = path.clone();
        }
        if let Some(fs) = &args.file_system {
            disk.file_system_type = FileSystemType::from(fs.as_str());
        }

        if disk.id.is_empty() || disk.path.is_empty() {
            return Err(BootdiskError::Config(
                "No persistent disk given: set persistent_disk in the config or pass --disk-id and --disk-path"
                    .to_string(),
            ));
        }
        Ok(disk)
    }
}

fn run(cli: Cli) -> BootdiskResult<()> {
    let config = BootdiskConfig::load(cli.config.as_deref())?;
    let layout = config
        .layout
        .clone()
        .unwrap_or_else(FilesystemLayout::from_env);
    let platform = DiskPlatform::host(config.options.clone(), layout.clone());

    match cli.command {
        Command::Bootstrap => platform.bootstrap(&config.plan),
        Command::MountPersistent { disk, mount_point } => {
            let disk = config.persistent_disk(&disk)?;
            let mount_point = mount_point.unwrap_or_else(|| layout.store_dir());
            platform.persistent().mount(&disk, &mount_point)
        }
        Command::UnmountPersistent { disk } => {
            let disk = config.persistent_disk(&disk)?;
            let unmounted = platform.persistent().unmount(&disk)?;
            println!("{}", unmounted);
            Ok(())
        }
        Command::IsMounted { disk } => {
            let disk = config.persistent_disk(&disk)?;
            println!("{}", platform.persistent().is_mounted(&disk)?);
            Ok(())
        }
        Command::IsMountable { disk } => {
            let disk = config.persistent_disk(&disk)?;
            println!("{}", platform.persistent().is_mountable(&disk)?);
            Ok(())
        }
        Command::Migrate { from, to } => {
            let from = from.unwrap_or_else(|| layout.store_dir());
            let to = to.unwrap_or_else(|| layout.store_migration_dir());
            platform.persistent().migrate(&from, &to)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
