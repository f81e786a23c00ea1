//! `.meta` sidecar lines per source state. The installer prepends the
//! `[General]` section header and the `installed=` key.

use mason_modlist::{Archive, ArchiveState};

/// Source-specific ini lines, without a section header.
pub fn meta_ini(archive: &Archive) -> Vec<String> {
    let mut lines = Vec::new();
    match &archive.state {
        ArchiveState::Http { url, .. } => {
            lines.push(format!("directURL={url}"));
        }
        ArchiveState::Cdn { url } => {
            lines.push(format!("directURL={url}"));
            lines.push("mirrored=true".to_string());
        }
        ArchiveState::GameFile {
            game, game_file, ..
        } => {
            lines.push(format!("gameName={}", game.meta_name()));
            lines.push(format!("gameFile={game_file}"));
        }
        ArchiveState::Manual { url, .. } => {
            lines.push(format!("manualURL={url}"));
        }
        ArchiveState::Nexus {
            game_name,
            mod_id,
            file_id,
        } => {
            lines.push(format!("gameName={}", game_name.to_lowercase()));
            lines.push(format!("modID={mod_id}"));
            lines.push(format!("fileID={file_id}"));
        }
        ArchiveState::Mega { url } => {
            lines.push(format!("directURL={url}"));
        }
    }
    lines.push(format!("name={}", archive.name));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use mason_core::hash_bytes;

    #[test]
    fn nexus_meta_carries_ids() {
        let archive = Archive {
            name: "SkyUI_5_2_SE.7z".into(),
            hash: hash_bytes(b"x"),
            size: 10,
            state: ArchiveState::Nexus {
                game_name: "SkyrimSpecialEdition".into(),
                mod_id: 12604,
                file_id: 35407,
            },
        };
        let lines = meta_ini(&archive);
        assert!(lines.contains(&"gameName=skyrimspecialedition".to_string()));
        assert!(lines.contains(&"modID=12604".to_string()));
        assert!(lines.contains(&"fileID=35407".to_string()));
        assert!(lines.contains(&"name=SkyUI_5_2_SE.7z".to_string()));
    }

    #[test]
    fn http_meta_records_url() {
        let archive = Archive {
            name: "a.7z".into(),
            hash: hash_bytes(b"y"),
            size: 1,
            state: ArchiveState::Http {
                url: "https://example.com/a.7z".into(),
                headers: vec![],
            },
        };
        assert_eq!(meta_ini(&archive)[0], "directURL=https://example.com/a.7z");
    }
}
