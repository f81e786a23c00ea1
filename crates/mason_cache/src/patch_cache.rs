//! On-disk store for binary-patch intermediates, keyed by the patched
//! output's hash.

use mason_core::{AbsolutePath, Hash};

use crate::error::{CacheError, Result};

#[derive(Clone)]
pub struct PatchCache {
    root: AbsolutePath,
}

impl PatchCache {
    pub fn open(root: AbsolutePath) -> Result<Self> {
        std::fs::create_dir_all(root.as_std()).map_err(|source| CacheError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, key: Hash) -> AbsolutePath {
        // Base64 uses '/'; hex keeps the key filesystem-safe.
        self.root.join(&format!("{:016x}.patch", key.as_u64()))
    }

    pub fn get(&self, key: Hash) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match std::fs::read(path.as_std()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    pub fn put(&self, key: Hash, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        std::fs::write(path.as_std(), bytes).map_err(|source| CacheError::Io { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mason_core::hash_bytes;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            PatchCache::open(AbsolutePath::from_std(dir.path().to_path_buf()).unwrap()).unwrap();
        let key = hash_bytes(b"patched output");

        assert_eq!(cache.get(key).unwrap(), None);
        cache.put(key, b"delta bytes").unwrap();
        assert_eq!(cache.get(key).unwrap().as_deref(), Some(&b"delta bytes"[..]));
    }
}
