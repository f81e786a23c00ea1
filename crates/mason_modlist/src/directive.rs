//! Directives: one instruction per installed file. The union of `to` paths
//! across a modlist is the installed-file manifest.

use mason_core::{Hash, RelativePath};
use mason_archives::{ContainerState, FileState};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Where inside the downloads an extraction source lives: the outer
/// archive's hash, then the inner path, possibly through nested archives.
/// Serialized as a flat array: `["<base64 hash>", "inner/a", "deeper/b"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveHashPath {
    pub archive_hash: Hash,
    pub parts: Vec<RelativePath>,
}

impl ArchiveHashPath {
    pub fn new(archive_hash: Hash, parts: Vec<RelativePath>) -> Self {
        Self {
            archive_hash,
            parts,
        }
    }
}

impl Serialize for ArchiveHashPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(1 + self.parts.len()))?;
        seq.serialize_element(&self.archive_hash)?;
        for part in &self.parts {
            seq.serialize_element(part)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for ArchiveHashPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        let mut iter = raw.into_iter();
        let archive_hash = iter
            .next()
            .ok_or_else(|| serde::de::Error::custom("empty archive hash path"))?;
        let archive_hash =
            Hash::from_base64(&archive_hash).map_err(serde::de::Error::custom)?;
        let parts = iter
            .map(RelativePath::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(serde::de::Error::custom)?;
        Ok(Self {
            archive_hash,
            parts,
        })
    }
}

/// A source slice for a merged patch, concatenated in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PatchSource {
    pub hash: Hash,
    pub relative_path: RelativePath,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum Directive {
    /// Copy one entry out of an extracted archive.
    #[serde(rename_all = "PascalCase")]
    FromArchive {
        to: RelativePath,
        hash: Hash,
        size: u64,
        archive_hash_path: ArchiveHashPath,
    },
    /// Write bytes embedded in the modlist bundle.
    #[serde(rename_all = "PascalCase")]
    InlineFile {
        to: RelativePath,
        hash: Hash,
        size: u64,
        source_data_id: String,
    },
    /// As `InlineFile`, after path-template substitution.
    #[serde(rename_all = "PascalCase")]
    RemappedInlineFile {
        to: RelativePath,
        hash: Hash,
        size: u64,
        source_data_id: String,
    },
    /// Assemble a game container from a staged directory.
    #[serde(rename_all = "PascalCase")]
    CreateBSA {
        to: RelativePath,
        hash: Hash,
        size: u64,
        #[serde(rename = "TempID")]
        temp_id: String,
        state: ContainerState,
        file_states: Vec<FileState>,
    },
    /// Apply a binary diff to the concatenation of source files.
    #[serde(rename_all = "PascalCase")]
    MergedPatch {
        to: RelativePath,
        hash: Hash,
        size: u64,
        sources: Vec<PatchSource>,
        #[serde(rename = "PatchID")]
        patch_id: String,
    },
    /// `FromArchive` plus a binary diff on the extracted bytes.
    #[serde(rename_all = "PascalCase")]
    PatchedFromArchive {
        to: RelativePath,
        hash: Hash,
        size: u64,
        archive_hash_path: ArchiveHashPath,
        from_hash: Hash,
        #[serde(rename = "PatchID")]
        patch_id: String,
    },
}

impl Directive {
    pub fn to(&self) -> &RelativePath {
        match self {
            Directive::FromArchive { to, .. }
            | Directive::InlineFile { to, .. }
            | Directive::RemappedInlineFile { to, .. }
            | Directive::CreateBSA { to, .. }
            | Directive::MergedPatch { to, .. }
            | Directive::PatchedFromArchive { to, .. } => to,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            Directive::FromArchive { hash, .. }
            | Directive::InlineFile { hash, .. }
            | Directive::RemappedInlineFile { hash, .. }
            | Directive::CreateBSA { hash, .. }
            | Directive::MergedPatch { hash, .. }
            | Directive::PatchedFromArchive { hash, .. } => *hash,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Directive::FromArchive { size, .. }
            | Directive::InlineFile { size, .. }
            | Directive::RemappedInlineFile { size, .. }
            | Directive::CreateBSA { size, .. }
            | Directive::MergedPatch { size, .. }
            | Directive::PatchedFromArchive { size, .. } => *size,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Directive::FromArchive { .. } => "FromArchive",
            Directive::InlineFile { .. } => "InlineFile",
            Directive::RemappedInlineFile { .. } => "RemappedInlineFile",
            Directive::CreateBSA { .. } => "CreateBSA",
            Directive::MergedPatch { .. } => "MergedPatch",
            Directive::PatchedFromArchive { .. } => "PatchedFromArchive",
        }
    }
}
