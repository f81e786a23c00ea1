//! Immutable installer input.

use mason_core::{AbsolutePath, RelativePath};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemParameters {
    pub screen_width: u32,
    pub screen_height: u32,
    pub video_memory_bytes: u64,
}

impl Default for SystemParameters {
    fn default() -> Self {
        Self {
            screen_width: 1920,
            screen_height: 1080,
            video_memory_bytes: 8 << 30,
        }
    }
}

/// Everything an install run needs up front. The game directory may be left
/// unset; it is then resolved from the modlist's game type.
#[derive(Debug, Clone)]
pub struct InstallerConfiguration {
    pub bundle_path: AbsolutePath,
    pub install_dir: AbsolutePath,
    pub downloads_dir: AbsolutePath,
    pub game_dir: Option<AbsolutePath>,
    pub system: SystemParameters,
    /// Extra targets allowed to deviate from their directive hash, on top
    /// of the built-in allow-list.
    pub allow_modified: Vec<RelativePath>,
}

impl InstallerConfiguration {
    pub fn new(
        bundle_path: AbsolutePath,
        install_dir: AbsolutePath,
        downloads_dir: AbsolutePath,
    ) -> Self {
        Self {
            bundle_path,
            install_dir,
            downloads_dir,
            game_dir: None,
            system: SystemParameters::default(),
            allow_modified: Vec::new(),
        }
    }

    pub fn with_game_dir(mut self, game_dir: AbsolutePath) -> Self {
        self.game_dir = Some(game_dir);
        self
    }

    pub fn with_system(mut self, system: SystemParameters) -> Self {
        self.system = system;
        self
    }
}
