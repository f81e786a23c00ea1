//! Remote archives and their source states. Every source kind is a closed
//! variant; adding a new remote means a new variant here and a fetcher in the
//! download dispatcher's registry.

use mason_core::{Hash, RelativePath};
use serde::{Deserialize, Serialize};

use crate::game::GameType;

/// One input file a modlist needs, identified by content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Archive {
    pub name: String,
    pub hash: Hash,
    pub size: u64,
    pub state: ArchiveState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum ArchiveState {
    #[serde(rename_all = "PascalCase")]
    Http {
        url: String,
        #[serde(default)]
        headers: Vec<String>,
    },
    /// The catalogued CDN: content is addressed by the archive hash under a
    /// fixed mirror root.
    #[serde(rename_all = "PascalCase")]
    Cdn { url: String },
    #[serde(rename_all = "PascalCase")]
    GameFile {
        game: GameType,
        game_file: RelativePath,
        #[serde(default)]
        game_version: Option<String>,
    },
    /// Cannot be fetched automatically; the user must deliver the file.
    #[serde(rename_all = "PascalCase")]
    Manual {
        url: String,
        #[serde(default)]
        prompt: Option<String>,
    },
    #[serde(rename_all = "PascalCase")]
    Nexus {
        game_name: String,
        #[serde(rename = "ModID")]
        mod_id: u64,
        #[serde(rename = "FileID")]
        file_id: u64,
    },
    #[serde(rename_all = "PascalCase")]
    Mega { url: String },
}

impl ArchiveState {
    /// Stable identity for deduplication and logging: lowercase, `|`-joined.
    pub fn primary_key_string(&self) -> String {
        match self {
            ArchiveState::Http { url, .. } => format!("http|{}", url.to_lowercase()),
            ArchiveState::Cdn { url } => format!("cdn|{}", url.to_lowercase()),
            ArchiveState::GameFile {
                game, game_file, ..
            } => format!("gamefile|{}|{}", game.meta_name(), game_file.lookup_key()),
            ArchiveState::Manual { url, .. } => format!("manual|{}", url.to_lowercase()),
            ArchiveState::Nexus {
                game_name,
                mod_id,
                file_id,
            } => format!("nexus|{}|{mod_id}|{file_id}", game_name.to_lowercase()),
            ArchiveState::Mega { url } => format!("mega|{}", url.to_lowercase()),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, ArchiveState::Manual { .. })
    }
}
