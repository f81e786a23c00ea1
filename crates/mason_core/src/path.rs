//! Typed paths. `RelativePath` and `AbsolutePath` are deliberately not
//! interconvertible: a relative path only becomes absolute by joining it onto
//! an absolute base.

use std::fmt;
use std::hash::{Hash as StdHash, Hasher as StdHasher};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("expected a relative path, got: {0}")]
    NotRelative(String),

    #[error("expected an absolute path, got: {0}")]
    NotAbsolute(String),

    #[error("path is not valid UTF-8: {0}")]
    NotUtf8(String),
}

/// A path inside an archive or an install tree. `/` is the canonical
/// separator; a `\` appearing in a component is significant data, not a
/// separator. Equality and hashing ignore ASCII case.
#[derive(Clone, Eq)]
pub struct RelativePath(String);

impl RelativePath {
    /// Accepts the string verbatim; only `/` separates components, and any
    /// `\` stays a data value. Rooted forms are rejected. Callers reading a
    /// format that stores `\` separators translate before constructing.
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let raw: String = path.into();
        if raw.starts_with('/') || raw.starts_with('\\') {
            return Err(PathError::NotRelative(raw));
        }
        Ok(Self(raw))
    }

    /// Builds from components already known to use `/`; any `\` present stays
    /// a data value. Used when enumerating extracted files on disk.
    pub fn from_parts(parts: &[&str]) -> Self {
        Self(parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|part| !part.is_empty())
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        let (stem, ext) = name.rsplit_once('.')?;
        (!stem.is_empty()).then_some(ext)
    }

    pub fn parent(&self) -> Option<RelativePath> {
        let (parent, _) = self.0.rsplit_once('/')?;
        Some(Self(parent.to_string()))
    }

    pub fn join(&self, child: &RelativePath) -> RelativePath {
        if self.0.is_empty() {
            child.clone()
        } else {
            Self(format!("{}/{}", self.0, child.0))
        }
    }

    /// True when the first component equals `root`, ignoring case.
    pub fn starts_with_dir(&self, root: &str) -> bool {
        self.components()
            .next()
            .is_some_and(|first| first.eq_ignore_ascii_case(root))
    }

    /// Case-insensitive lookup key. Non-ASCII case folding is intentionally
    /// not applied; the game data this engine handles is ASCII-pathed.
    pub fn lookup_key(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl PartialEq for RelativePath {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl StdHash for RelativePath {
    fn hash<H: StdHasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
    }
}

impl PartialOrd for RelativePath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RelativePath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.lookup_key().cmp(&other.lookup_key())
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelativePath({})", self.0)
    }
}

impl Serialize for RelativePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelativePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RelativePath::new(raw).map_err(serde::de::Error::custom)
    }
}

/// An absolute filesystem location, UTF-8 guaranteed.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsolutePath(Utf8PathBuf);

impl AbsolutePath {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path: Utf8PathBuf = path.into();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.into_string()));
        }
        Ok(Self(path))
    }

    pub fn from_std(path: std::path::PathBuf) -> Result<Self, PathError> {
        let utf8 = Utf8PathBuf::from_path_buf(path)
            .map_err(|p| PathError::NotUtf8(p.display().to_string()))?;
        Self::new(utf8)
    }

    pub fn as_utf8(&self) -> &Utf8Path {
        &self.0
    }

    pub fn as_std(&self) -> &std::path::Path {
        self.0.as_std_path()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Joins a relative path. `/` components become platform separators via
    /// the underlying path type; embedded `\` stays inside the component.
    pub fn join_rel(&self, rel: &RelativePath) -> AbsolutePath {
        let mut out = self.0.clone();
        for part in rel.components() {
            out.push(part);
        }
        Self(out)
    }

    pub fn join(&self, component: &str) -> AbsolutePath {
        Self(self.0.join(component))
    }

    pub fn parent(&self) -> Option<AbsolutePath> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension()
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }
}

impl fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl fmt::Debug for AbsolutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbsolutePath({})", self.0)
    }
}

impl Serialize for AbsolutePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for AbsolutePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AbsolutePath::new(Utf8PathBuf::from(raw)).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_keeps_backslashes_as_data() {
        let path = RelativePath::new(r"dir/odd\name.txt").unwrap();
        assert_eq!(path.as_str(), r"dir/odd\name.txt");
        assert_eq!(path.components().count(), 2);
        assert_eq!(path.file_name(), r"odd\name.txt");
    }

    #[test]
    fn file_name_and_extension_split_on_slash_only() {
        let path = RelativePath::new("mods/textures/a.dds").unwrap();
        assert_eq!(path.file_name(), "a.dds");
        assert_eq!(path.extension(), Some("dds"));
    }

    #[test]
    fn relative_equality_ignores_case() {
        let a = RelativePath::new("Textures/A.dds").unwrap();
        let b = RelativePath::new("textures/a.DDS").unwrap();
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn relative_rejects_rooted_paths() {
        assert!(RelativePath::new("/etc/passwd").is_err());
        assert!(RelativePath::new(r"\windows").is_err());
    }

    #[test]
    fn from_parts_preserves_backslash_data() {
        let path = RelativePath::from_parts(&["dir", r"odd\name.txt"]);
        assert_eq!(path.as_str(), r"dir/odd\name.txt");
        assert_eq!(path.file_name(), r"odd\name.txt");
    }

    #[test]
    fn parent_and_join() {
        let path = RelativePath::new("a/b/c.txt").unwrap();
        let parent = path.parent().unwrap();
        assert_eq!(parent.as_str(), "a/b");
        assert_eq!(
            parent.join(&RelativePath::new("c.txt").unwrap()).as_str(),
            "a/b/c.txt"
        );
        assert!(RelativePath::new("top.txt").unwrap().parent().is_none());
    }

    #[test]
    fn absolute_requires_rooted_input() {
        assert!(AbsolutePath::new(Utf8PathBuf::from("relative/path")).is_err());
        let abs = AbsolutePath::new(Utf8PathBuf::from("/install")).unwrap();
        let rel = RelativePath::new("mods/file.esp").unwrap();
        assert_eq!(abs.join_rel(&rel).as_str(), "/install/mods/file.esp");
    }

    #[test]
    fn starts_with_dir_ignores_case() {
        let path = RelativePath::new("Textures/armor/a.dds").unwrap();
        assert!(path.starts_with_dir("textures"));
        assert!(!path.starts_with_dir("meshes"));
    }
}
