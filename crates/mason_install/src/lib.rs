//! The installer engine: configuration, the 15-phase state machine, binary
//! delta application, and the engine-wide resource set.

mod config;
mod error;
mod installer;
mod octodiff;
mod resources;

pub use config::{InstallerConfiguration, SystemParameters};
pub use error::{InstallError, Result};
pub use installer::{InstallOutcome, Installer, ManualDownload};
pub use octodiff::apply_delta;
pub use resources::{EngineResources, EngineSettings};
