//! Types shared between the bootdisk library and its embedders.
//!
//! - `errors`: the `BootdiskError` taxonomy and `BootdiskResult` alias
//! - `settings`: disk settings handed to the agent by the control plane

pub mod errors;
pub mod settings;

pub use errors::{BootdiskError, BootdiskResult, CommandOutput, ResultExt};
pub use settings::{DiskSettings, FileSystemType};
