//! The virtual file system: a content-addressed index of everything inside
//! the downloaded archives, so the installer can answer "where does hash H
//! live?" without re-extracting. Indexes survive restarts through the disk
//! cache, keyed by the outer archive's hash; an entry is authoritative only
//! while the archive file still hashes the same.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, RwLock};

use mason_cache::{HashCache, VfsCache};
use mason_core::{
    hash_bytes, signature, AbsolutePath, CancelToken, FileSource, Hash, RelativePath, TempManager,
};
use mason_extract::{ExtractedFile, Extractor, NativeTool};
use mason_resources::Resource;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Archives nested deeper than this are indexed as opaque files.
const MAX_NESTING: usize = 3;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error(transparent)]
    Cache(#[from] mason_cache::CacheError),

    #[error(transparent)]
    Extract(#[from] mason_extract::ExtractError),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("index payload is corrupt: {0}")]
    CorruptIndex(#[from] serde_json::Error),

    #[error("archive {archive} has no entry at {path:?}")]
    EntryMissing {
        archive: Hash,
        path: Vec<RelativePath>,
    },

    #[error(transparent)]
    Cancelled(#[from] mason_core::Cancelled),
}

pub type Result<T> = std::result::Result<T, VfsError>;

/// One indexed file inside an archive. `path` is the chain of inner paths
/// from the outer archive down (one element unless archives nest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedEntry {
    pub path: Vec<RelativePath>,
    pub hash: Hash,
    pub size: u64,
}

/// Where a content hash lives.
#[derive(Debug, Clone, PartialEq)]
pub struct VfsLocation {
    pub archive_hash: Hash,
    pub path: Vec<RelativePath>,
    pub size: u64,
}

pub struct Vfs {
    cache: VfsCache,
    hash_cache: HashCache,
    extractor: Arc<Extractor>,
    invoker: Arc<dyn NativeTool>,
    resource: Resource,
    temp: Arc<TempManager>,
    by_archive: RwLock<HashMap<Hash, Arc<Vec<IndexedEntry>>>>,
    by_content: RwLock<HashMap<Hash, Vec<VfsLocation>>>,
}

impl Vfs {
    pub fn new(
        cache: VfsCache,
        hash_cache: HashCache,
        extractor: Arc<Extractor>,
        invoker: Arc<dyn NativeTool>,
        resource: Resource,
        temp: Arc<TempManager>,
    ) -> Self {
        Self {
            cache,
            hash_cache,
            extractor,
            invoker,
            resource,
            temp,
            by_archive: RwLock::new(HashMap::new()),
            by_content: RwLock::new(HashMap::new()),
        }
    }

    /// Indexes one archive, reusing the disk cache when the archive still
    /// hashes the same. Concurrency across archives is gated by the VFS
    /// resource.
    pub async fn add_archive(&self, path: &AbsolutePath, token: &CancelToken) -> Result<Hash> {
        let archive_hash = self.hash_cache.compute_or_cache(path, token).await?;
        if self
            .by_archive
            .read()
            .expect("vfs index lock")
            .contains_key(&archive_hash)
        {
            return Ok(archive_hash);
        }

        let job = self
            .resource
            .begin(format!("index {path}"), 0, token)
            .await?;
        let result = self.add_archive_inner(path, archive_hash, token).await;
        self.resource.finish(job);
        result?;
        Ok(archive_hash)
    }

    async fn add_archive_inner(
        &self,
        path: &AbsolutePath,
        archive_hash: Hash,
        token: &CancelToken,
    ) -> Result<()> {
        if let Some(payload) = self.cache.get(archive_hash).await? {
            let entries: Vec<IndexedEntry> = serde_json::from_str(&payload)?;
            debug!("{path}: reusing cached index ({} entries)", entries.len());
            self.merge(archive_hash, entries);
            return Ok(());
        }

        let source = FileSource::new(path.clone())?;
        let entries = self.index_source(&source, Vec::new(), 0, token).await?;
        info!("{path}: indexed {} entries", entries.len());
        self.cache
            .put(archive_hash, &serde_json::to_string(&entries)?)
            .await?;
        self.merge(archive_hash, entries);
        Ok(())
    }

    /// Recursively indexes one stream. Nested archives become both an entry
    /// (the archive file itself) and a subtree of entries, up to the
    /// nesting bound.
    async fn index_source(
        &self,
        source: &FileSource,
        prefix: Vec<RelativePath>,
        depth: usize,
        token: &CancelToken,
    ) -> Result<Vec<IndexedEntry>> {
        struct Leaf {
            path: Vec<RelativePath>,
            hash: Hash,
            size: u64,
            nested: Option<mason_core::TempDir>,
        }

        let temp = Arc::clone(&self.temp);
        let mut leaves: Vec<Leaf> = Vec::new();
        {
            let prefix = prefix.clone();
            let mut collect = |rel: &RelativePath,
                               file: ExtractedFile|
             -> mason_extract::Result<()> {
                let bytes = file.read_all()?;
                let mut chain = prefix.clone();
                chain.push(rel.clone());

                let mut nested = None;
                if depth + 1 < MAX_NESTING && looks_like_archive(&bytes) {
                    let dir = temp.scoped("vfs-nested")?;
                    let inner_path = dir.path().join(rel.file_name());
                    std::fs::write(inner_path.as_std(), &bytes)?;
                    nested = Some(dir);
                }

                leaves.push(Leaf {
                    path: chain,
                    hash: hash_bytes(&bytes),
                    size: bytes.len() as u64,
                    nested,
                });
                Ok(())
            };

            self.extractor
                .gathering_extract(
                    self.invoker.as_ref(),
                    source,
                    &|_| true,
                    &mut |rel, file| collect(rel, file).map(|_| ()),
                    None,
                    None,
                    token,
                )
                .await?;
        }

        let mut entries = Vec::new();
        for leaf in leaves {
            if let Some(dir) = leaf.nested {
                let inner_file = dir.path().join(
                    leaf.path
                        .last()
                        .map(|p| p.file_name())
                        .unwrap_or("nested"),
                );
                let nested_source = FileSource::new(inner_file)?;
                let subtree = Box::pin(self.index_source(
                    &nested_source,
                    leaf.path.clone(),
                    depth + 1,
                    token,
                ))
                .await;
                match subtree {
                    Ok(sub) => entries.extend(sub),
                    // An entry that merely looks like an archive stays a leaf.
                    Err(VfsError::Extract(mason_extract::ExtractError::InvalidFormat(_))) => {}
                    Err(err) => return Err(err),
                }
            }
            entries.push(IndexedEntry {
                path: leaf.path,
                hash: leaf.hash,
                size: leaf.size,
            });
        }
        Ok(entries)
    }

    fn merge(&self, archive_hash: Hash, entries: Vec<IndexedEntry>) {
        let mut by_content = self.by_content.write().expect("vfs content lock");
        for entry in &entries {
            by_content
                .entry(entry.hash)
                .or_default()
                .push(VfsLocation {
                    archive_hash,
                    path: entry.path.clone(),
                    size: entry.size,
                });
        }
        drop(by_content);
        self.by_archive
            .write()
            .expect("vfs index lock")
            .insert(archive_hash, Arc::new(entries));
    }

    /// All known locations of a content hash.
    pub fn lookup(&self, hash: Hash) -> Vec<VfsLocation> {
        self.by_content
            .read()
            .expect("vfs content lock")
            .get(&hash)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `(archive, inner path chain)` is represented in the index.
    pub fn contains(&self, archive_hash: Hash, path: &[RelativePath]) -> bool {
        self.by_archive
            .read()
            .expect("vfs index lock")
            .get(&archive_hash)
            .is_some_and(|entries| entries.iter().any(|entry| entry.path == path))
    }

    /// Extracts the requested inner paths (possibly nested) from one
    /// archive, returning their bytes keyed by the full chain.
    pub async fn gather_bytes(
        &self,
        archive_path: &AbsolutePath,
        requests: &[Vec<RelativePath>],
        token: &CancelToken,
    ) -> Result<HashMap<Vec<RelativePath>, Vec<u8>>> {
        let source = FileSource::new(archive_path.clone())?;

        // First-level names we need: plain entries plus nested containers.
        let mut only: HashSet<RelativePath> = HashSet::new();
        let mut nested: HashMap<RelativePath, Vec<Vec<RelativePath>>> = HashMap::new();
        for request in requests {
            let Some(first) = request.first() else { continue };
            only.insert(first.clone());
            if request.len() > 1 {
                nested
                    .entry(first.clone())
                    .or_default()
                    .push(request[1..].to_vec());
            }
        }

        let mut first_level: HashMap<RelativePath, Vec<u8>> = HashMap::new();
        self.extractor
            .gathering_extract(
                self.invoker.as_ref(),
                &source,
                &|_| true,
                &mut |rel, file| {
                    first_level.insert(rel.clone(), file.read_all()?);
                    Ok(())
                },
                Some(&only),
                None,
                token,
            )
            .await?;

        let mut results: HashMap<Vec<RelativePath>, Vec<u8>> = HashMap::new();
        for request in requests {
            if request.len() == 1 {
                if let Some(bytes) = first_level.get(&request[0]) {
                    results.insert(request.clone(), bytes.clone());
                }
            }
        }

        // Nested requests recurse through a temp copy of the inner archive.
        for (container, tails) in nested {
            let Some(bytes) = first_level.get(&container) else {
                continue;
            };
            let dir = self.temp.scoped("vfs-gather")?;
            let inner_path = dir.path().join(container.file_name());
            std::fs::write(inner_path.as_std(), bytes)?;
            let sub = Box::pin(self.gather_bytes(&inner_path, &tails, token)).await?;
            for (tail, bytes) in sub {
                let mut chain = vec![container.clone()];
                chain.extend(tail);
                results.insert(chain, bytes);
            }
        }

        Ok(results)
    }
}

/// Cheap archive sniff on in-memory bytes.
fn looks_like_archive(bytes: &[u8]) -> bool {
    let mut cursor = std::io::Cursor::new(bytes);
    matches!(signature::detect(&mut cursor), Ok(Some(_)))
}

/// Convenience: every regular file in the downloads directory that is not
/// engine bookkeeping.
pub fn downloadable_files(downloads: &AbsolutePath) -> std::io::Result<Vec<AbsolutePath>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(downloads.as_std())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(path) = AbsolutePath::from_std(entry.path()) else {
            continue;
        };
        let name = path.file_name().unwrap_or_default();
        if name.ends_with(".meta") || name.ends_with(".part") {
            continue;
        }
        out.push(path);
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mason_archives::BsaBuilder;
    use mason_cache::Database;
    use mason_extract::{ExtractionSettings, HostTool};
    use mason_resources::ResourceSettings;

    struct Fixture {
        _dir: tempfile::TempDir,
        vfs: Vfs,
        token: CancelToken,
        downloads: AbsolutePath,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::never();
        let temp = Arc::new(
            TempManager::new(AbsolutePath::from_std(dir.path().join("tmp")).unwrap()).unwrap(),
        );
        let downloads = AbsolutePath::from_std(dir.path().join("downloads")).unwrap();
        std::fs::create_dir_all(downloads.as_std()).unwrap();

        let settings = |n| ResourceSettings {
            max_tasks: n,
            max_throughput: 0,
        };
        let extractor = Arc::new(Extractor::new(
            ExtractionSettings::new(
                AbsolutePath::new(camino::Utf8PathBuf::from("/usr/bin/7z")).unwrap(),
                AbsolutePath::new(camino::Utf8PathBuf::from("/usr/bin/innoextract")).unwrap(),
            ),
            Arc::clone(&temp),
            Resource::new("File Extractor", settings(2), token.clone()),
        ));

        let db = Database::open_in_memory().await.unwrap();
        let hash_cache = HashCache::new(
            db.clone(),
            Resource::new("File Hashing", settings(2), token.clone()),
        );
        let vfs = Vfs::new(
            VfsCache::new(db),
            hash_cache,
            extractor,
            Arc::new(HostTool),
            Resource::new("VFS", settings(2), token.clone()),
            temp,
        );
        Fixture {
            _dir: dir,
            vfs,
            token,
            downloads,
        }
    }

    fn build_bsa(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = BsaBuilder::new(105, 0, 0x1).unwrap();
        for (path, bytes) in entries {
            builder
                .add_file(&RelativePath::new(*path).unwrap(), *bytes, false)
                .unwrap();
        }
        let mut cursor = std::io::Cursor::new(Vec::new());
        builder.write_to(&mut cursor).unwrap();
        cursor.into_inner()
    }

    #[tokio::test]
    async fn indexes_archive_and_answers_lookups() {
        let fx = fixture().await;
        let bsa = build_bsa(&[("textures/wood.dds", b"wood bytes")]);
        let archive_path = fx.downloads.join("pack.bsa");
        std::fs::write(archive_path.as_std(), &bsa).unwrap();

        let archive_hash = fx.vfs.add_archive(&archive_path, &fx.token).await.unwrap();

        let content = hash_bytes(b"wood bytes");
        let locations = fx.vfs.lookup(content);
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].archive_hash, archive_hash);
        assert_eq!(
            locations[0].path,
            vec![RelativePath::new("textures/wood.dds").unwrap()]
        );
        assert!(fx
            .vfs
            .contains(archive_hash, &locations[0].path));
    }

    #[tokio::test]
    async fn nested_archives_are_indexed_through() {
        let fx = fixture().await;
        let inner = build_bsa(&[("meshes/chair.nif", b"chair")]);
        let outer = build_bsa(&[("bundled/inner.bsa", &inner), ("readme.txt", b"hi")]);
        let archive_path = fx.downloads.join("outer.bsa");
        std::fs::write(archive_path.as_std(), &outer).unwrap();

        let archive_hash = fx.vfs.add_archive(&archive_path, &fx.token).await.unwrap();

        // The nested file is reachable by its content hash with a two-level
        // chain, and the inner archive itself is also an entry.
        let chair = fx.vfs.lookup(hash_bytes(b"chair"));
        assert_eq!(chair.len(), 1);
        assert_eq!(
            chair[0].path,
            vec![
                RelativePath::new("bundled/inner.bsa").unwrap(),
                RelativePath::new("meshes/chair.nif").unwrap(),
            ]
        );
        assert!(!fx.vfs.lookup(hash_bytes(&inner)).is_empty());
        assert!(fx.vfs.contains(archive_hash, &chair[0].path));
    }

    #[tokio::test]
    async fn cached_index_is_reused() {
        let fx = fixture().await;
        let bsa = build_bsa(&[("a.txt", b"contents")]);
        let archive_path = fx.downloads.join("pack.bsa");
        std::fs::write(archive_path.as_std(), &bsa).unwrap();

        let hash_one = fx.vfs.add_archive(&archive_path, &fx.token).await.unwrap();

        // A second VFS over the same cache database sees the payload
        // without re-extracting (the archive file could even be gone).
        let payload = fx.vfs.cache.get(hash_one).await.unwrap();
        assert!(payload.is_some());

        // Re-adding in-process is a no-op fast path.
        let hash_two = fx.vfs.add_archive(&archive_path, &fx.token).await.unwrap();
        assert_eq!(hash_one, hash_two);
    }

    #[tokio::test]
    async fn gather_bytes_resolves_nested_chains() {
        let fx = fixture().await;
        let inner = build_bsa(&[("meshes/chair.nif", b"chair bytes")]);
        let outer = build_bsa(&[("bundled/inner.bsa", &inner), ("top.txt", b"top")]);
        let archive_path = fx.downloads.join("outer.bsa");
        std::fs::write(archive_path.as_std(), &outer).unwrap();

        let top = vec![RelativePath::new("top.txt").unwrap()];
        let deep = vec![
            RelativePath::new("bundled/inner.bsa").unwrap(),
            RelativePath::new("meshes/chair.nif").unwrap(),
        ];
        let results = fx
            .vfs
            .gather_bytes(&archive_path, &[top.clone(), deep.clone()], &fx.token)
            .await
            .unwrap();

        assert_eq!(results[&top], b"top");
        assert_eq!(results[&deep], b"chair bytes");
    }
}
