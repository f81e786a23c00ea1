//! Serialized descriptions of a container and its members, as they appear in
//! `CreateBSA` directives. The builder consumes these; the reader produces
//! entries that can be checked back against them.

use mason_core::RelativePath;
use serde::{Deserialize, Serialize};

/// Archive-level parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum ContainerState {
    #[serde(rename_all = "PascalCase")]
    Bsa {
        version: u32,
        archive_flags: u32,
        file_flags: u32,
    },
    #[serde(rename_all = "PascalCase")]
    Ba2 {
        version: u32,
        format: Ba2Format,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ba2Format {
    General,
    Dx10,
}

/// Per-member parameters, ordered by `index` inside the directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum FileState {
    #[serde(rename_all = "PascalCase")]
    BsaFile {
        path: RelativePath,
        index: usize,
        #[serde(default)]
        flip_compression: bool,
    },
    #[serde(rename_all = "PascalCase")]
    Ba2File {
        path: RelativePath,
        index: usize,
    },
    #[serde(rename_all = "PascalCase")]
    Ba2Dx10Entry {
        path: RelativePath,
        index: usize,
        height: u16,
        width: u16,
        num_mips: u8,
        pixel_format: u8,
    },
}

impl FileState {
    pub fn path(&self) -> &RelativePath {
        match self {
            FileState::BsaFile { path, .. }
            | FileState::Ba2File { path, .. }
            | FileState::Ba2Dx10Entry { path, .. } => path,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            FileState::BsaFile { index, .. }
            | FileState::Ba2File { index, .. }
            | FileState::Ba2Dx10Entry { index, .. } => *index,
        }
    }

    /// DX10 payloads are recompressed texture data; readback bytes are not
    /// comparable to the staged input, so per-file hash checks skip them.
    pub fn is_lossy(&self) -> bool {
        matches!(self, FileState::Ba2Dx10Entry { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_state_json_round_trip() {
        let state = FileState::BsaFile {
            path: RelativePath::new("meshes/chair.nif").unwrap(),
            index: 3,
            flip_compression: true,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"$type\":\"BsaFile\""));
        assert!(json.contains("\"FlipCompression\":true"));
        let back: FileState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn only_dx10_is_lossy() {
        let dds = FileState::Ba2Dx10Entry {
            path: RelativePath::new("textures/a.dds").unwrap(),
            index: 0,
            height: 512,
            width: 512,
            num_mips: 10,
            pixel_format: 99,
        };
        assert!(dds.is_lossy());
        let plain = FileState::Ba2File {
            path: RelativePath::new("sounds/a.wav").unwrap(),
            index: 1,
        };
        assert!(!plain.is_lossy());
    }
}
