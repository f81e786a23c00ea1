//! Supported games and game-folder auto-detection.

use camino::Utf8PathBuf;
use mason_core::AbsolutePath;
use serde::{Deserialize, Serialize};
use sysinfo::Disks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameType {
    Morrowind,
    Oblivion,
    Skyrim,
    SkyrimSpecialEdition,
    Fallout4,
    FalloutNewVegas,
}

impl GameType {
    pub fn display_name(self) -> &'static str {
        match self {
            GameType::Morrowind => "Morrowind",
            GameType::Oblivion => "Oblivion",
            GameType::Skyrim => "Skyrim",
            GameType::SkyrimSpecialEdition => "Skyrim Special Edition",
            GameType::Fallout4 => "Fallout 4",
            GameType::FalloutNewVegas => "Fallout New Vegas",
        }
    }

    /// Name used in `.meta` sidecars and by the remote repositories.
    pub fn meta_name(self) -> &'static str {
        match self {
            GameType::Morrowind => "morrowind",
            GameType::Oblivion => "oblivion",
            GameType::Skyrim => "skyrim",
            GameType::SkyrimSpecialEdition => "skyrimse",
            GameType::Fallout4 => "fallout4",
            GameType::FalloutNewVegas => "falloutnv",
        }
    }

    pub fn main_executable(self) -> &'static str {
        match self {
            GameType::Morrowind => "Morrowind.exe",
            GameType::Oblivion => "Oblivion.exe",
            GameType::Skyrim => "TESV.exe",
            GameType::SkyrimSpecialEdition => "SkyrimSE.exe",
            GameType::Fallout4 => "Fallout4.exe",
            GameType::FalloutNewVegas => "FalloutNV.exe",
        }
    }

    fn store_folder(self) -> &'static str {
        match self {
            GameType::Morrowind => "Morrowind",
            GameType::Oblivion => "Oblivion",
            GameType::Skyrim => "Skyrim",
            GameType::SkyrimSpecialEdition => "Skyrim Special Edition",
            GameType::Fallout4 => "Fallout 4",
            GameType::FalloutNewVegas => "Fallout New Vegas",
        }
    }

    /// Candidate install locations across every mounted drive, most common
    /// layouts first.
    fn known_locations(self) -> Vec<Utf8PathBuf> {
        let mut roots: Vec<Utf8PathBuf> = Disks::new_with_refreshed_list()
            .iter()
            .filter_map(|disk| disk.mount_point().to_str().map(Utf8PathBuf::from))
            .collect();
        if roots.is_empty() {
            roots.push(Utf8PathBuf::from("/"));
        }

        let mut candidates = Vec::new();
        for root in roots {
            candidates.push(
                root.join("Program Files (x86)")
                    .join("Steam")
                    .join("steamapps")
                    .join("common")
                    .join(self.store_folder()),
            );
            candidates.push(
                root.join("SteamLibrary")
                    .join("steamapps")
                    .join("common")
                    .join(self.store_folder()),
            );
            candidates.push(root.join("Games").join(self.store_folder()));
        }
        candidates
    }

    /// Finds an install folder containing the game's main executable.
    /// An explicit override (the `MASON_GAME_DIR` environment variable) wins.
    pub fn locate(self) -> Option<AbsolutePath> {
        if let Ok(dir) = std::env::var("MASON_GAME_DIR") {
            let path = Utf8PathBuf::from(dir);
            if path.join(self.main_executable()).exists() {
                return AbsolutePath::new(path).ok();
            }
        }

        self.known_locations()
            .into_iter()
            .find(|dir| dir.join(self.main_executable()).exists())
            .and_then(|dir| AbsolutePath::new(dir).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_variant_names() {
        let json = serde_json::to_string(&GameType::SkyrimSpecialEdition).unwrap();
        assert_eq!(json, "\"SkyrimSpecialEdition\"");
        let back: GameType = serde_json::from_str("\"Fallout4\"").unwrap();
        assert_eq!(back, GameType::Fallout4);
    }

    #[test]
    fn meta_names_are_stable() {
        assert_eq!(GameType::SkyrimSpecialEdition.meta_name(), "skyrimse");
        assert_eq!(GameType::FalloutNewVegas.meta_name(), "falloutnv");
    }
}
