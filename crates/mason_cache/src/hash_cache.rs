//! Persistent `(path, size, mtime) → hash` store. A hit requires an exact
//! size and mtime match; anything else invalidates the entry.

use std::fs::File;
use std::io::BufReader;
use std::time::UNIX_EPOCH;

use mason_core::{hash_reader, AbsolutePath, CancelToken, Hash};
use mason_resources::Resource;
use tracing::{debug, trace};

use crate::db::Database;
use crate::error::{CacheError, Result};

/// On-disk identity of a file at lookup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    mtime_ms: i64,
}

fn stamp(path: &AbsolutePath) -> Result<FileStamp> {
    let meta = std::fs::metadata(path.as_std()).map_err(|source| CacheError::Io {
        path: path.clone(),
        source,
    })?;
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(FileStamp {
        size: meta.len(),
        mtime_ms,
    })
}

#[derive(Clone)]
pub struct HashCache {
    db: Database,
    resource: Resource,
}

impl HashCache {
    pub fn new(db: Database, resource: Resource) -> Self {
        Self { db, resource }
    }

    /// Cache hit, or `None` when the file changed or was never hashed.
    /// Entries that decode to the all-zero digest are purged on read.
    pub async fn lookup(&self, path: &AbsolutePath) -> Result<Option<Hash>> {
        let stamp = stamp(path)?;
        let row: Option<(i64, i64, String)> =
            sqlx::query_as("SELECT size, mtime, hash FROM hash_cache WHERE path = ?")
                .bind(path.as_str())
                .fetch_optional(self.db.pool())
                .await?;

        let Some((size, mtime_ms, encoded)) = row else {
            return Ok(None);
        };
        if size as u64 != stamp.size || mtime_ms != stamp.mtime_ms {
            trace!(%path, "hash cache entry is stale");
            return Ok(None);
        }

        match Hash::from_base64(&encoded) {
            Ok(hash) if !hash.is_null() => Ok(Some(hash)),
            _ => {
                debug!(%path, "purging null or corrupt hash cache entry");
                sqlx::query("DELETE FROM hash_cache WHERE path = ?")
                    .bind(path.as_str())
                    .execute(self.db.pool())
                    .await?;
                Ok(None)
            }
        }
    }

    /// Returns the cached hash or computes it under the hashing resource.
    pub async fn compute_or_cache(
        &self,
        path: &AbsolutePath,
        token: &CancelToken,
    ) -> Result<Hash> {
        if let Some(hash) = self.lookup(path).await? {
            return Ok(hash);
        }

        let stamp = stamp(path)?;
        let job = self
            .resource
            .begin(format!("hash {}", path), stamp.size, token)
            .await?;

        let mut hash = self.hash_blocking(path).await?;
        if hash.is_null() {
            // Recompute once; a persistent zero means the read went wrong.
            hash = self.hash_blocking(path).await?;
            if hash.is_null() {
                self.resource.finish(job);
                return Err(CacheError::NullHash(path.clone()));
            }
        }

        self.insert(path, stamp, hash).await?;
        self.resource.report_no_wait(&job, stamp.size);
        self.resource.finish(job);
        Ok(hash)
    }

    /// Force-insert for files produced by means that already know the hash.
    pub async fn write(&self, path: &AbsolutePath, hash: Hash) -> Result<()> {
        let stamp = stamp(path)?;
        self.insert(path, stamp, hash).await
    }

    async fn hash_blocking(&self, path: &AbsolutePath) -> Result<Hash> {
        let std_path = path.as_std().to_path_buf();
        let owned = path.clone();
        tokio::task::spawn_blocking(move || {
            let file = File::open(&std_path)?;
            hash_reader(BufReader::new(file))
        })
        .await
        .expect("hashing task panicked")
        .map_err(|source| CacheError::Io {
            path: owned,
            source,
        })
    }

    async fn insert(&self, path: &AbsolutePath, stamp: FileStamp, hash: Hash) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO hash_cache (path, size, mtime, hash) VALUES (?, ?, ?, ?)",
        )
        .bind(path.as_str())
        .bind(stamp.size as i64)
        .bind(stamp.mtime_ms)
        .bind(hash.to_base64())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mason_core::hash_bytes;
    use mason_resources::ResourceSettings;

    async fn cache() -> (tempfile::TempDir, HashCache, CancelToken) {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::never();
        let resource = Resource::new(
            "File Hashing",
            ResourceSettings {
                max_tasks: 2,
                max_throughput: 0,
            },
            token.clone(),
        );
        let db = Database::open_in_memory().await.unwrap();
        (dir, HashCache::new(db, resource), token)
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> AbsolutePath {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        AbsolutePath::from_std(path).unwrap()
    }

    #[tokio::test]
    async fn compute_then_hit() {
        let (dir, cache, token) = cache().await;
        let path = write_file(&dir, "a.bin", b"archive contents");

        let computed = cache.compute_or_cache(&path, &token).await.unwrap();
        assert_eq!(computed, hash_bytes(b"archive contents"));

        let hit = cache.lookup(&path).await.unwrap();
        assert_eq!(hit, Some(computed));
    }

    #[tokio::test]
    async fn modified_file_misses() {
        let (dir, cache, token) = cache().await;
        let path = write_file(&dir, "a.bin", b"before");
        cache.compute_or_cache(&path, &token).await.unwrap();

        // Same length, different bytes and mtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(path.as_std(), b"after!").unwrap();
        filetime_touch(&path);

        assert_eq!(cache.lookup(&path).await.unwrap(), None);
        let rehashed = cache.compute_or_cache(&path, &token).await.unwrap();
        assert_eq!(rehashed, hash_bytes(b"after!"));
    }

    // Force a distinct mtime even on coarse-grained filesystems.
    fn filetime_touch(path: &AbsolutePath) {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(path.as_std())
            .unwrap();
        file.set_modified(std::time::SystemTime::now()).unwrap();
    }

    #[tokio::test]
    async fn null_entries_are_purged_on_read() {
        let (dir, cache, token) = cache().await;
        let path = write_file(&dir, "a.bin", b"payload");

        // Plant a poisoned entry with the correct stamp.
        let meta = std::fs::metadata(path.as_std()).unwrap();
        let mtime_ms = meta
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        sqlx::query(
            "INSERT INTO hash_cache (path, size, mtime, hash) VALUES (?, ?, ?, ?)",
        )
        .bind(path.as_str())
        .bind(meta.len() as i64)
        .bind(mtime_ms)
        .bind(Hash::NULL.to_base64())
        .execute(cache.db.pool())
        .await
        .unwrap();

        assert_eq!(cache.lookup(&path).await.unwrap(), None);
        let recomputed = cache.compute_or_cache(&path, &token).await.unwrap();
        assert_eq!(recomputed, hash_bytes(b"payload"));
    }

    #[tokio::test]
    async fn write_records_known_hash() {
        let (dir, cache, _token) = cache().await;
        let path = write_file(&dir, "produced.bin", b"known bytes");
        let known = hash_bytes(b"known bytes");

        cache.write(&path, known).await.unwrap();
        assert_eq!(cache.lookup(&path).await.unwrap(), Some(known));
    }
}
