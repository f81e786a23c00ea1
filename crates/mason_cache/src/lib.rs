//! Persistent state: the hash cache, the VFS index cache, the
//! network-verification TTL cache, and the binary-patch intermediate store.
//! Everything lives under one data-directory root; each store is an explicit
//! constructor-injected dependency with an open/close lifecycle.

mod db;
mod error;
mod hash_cache;
mod patch_cache;
mod verification;
mod vfs_cache;

pub use db::Database;
pub use error::{CacheError, Result};
pub use hash_cache::HashCache;
pub use patch_cache::PatchCache;
pub use verification::VerificationCache;
pub use vfs_cache::VfsCache;

use mason_core::AbsolutePath;
use mason_resources::Resource;

/// The process-wide stores, opened together from one root.
pub struct DataStores {
    pub hash_cache: HashCache,
    pub vfs_cache: VfsCache,
    pub verification_cache: VerificationCache,
    pub patch_cache: PatchCache,
    hash_db: Database,
    vfs_db: Database,
    verification_db: Database,
}

impl DataStores {
    pub async fn open(root: &AbsolutePath, hashing_resource: Resource) -> Result<Self> {
        std::fs::create_dir_all(root.as_std()).map_err(|source| CacheError::Io {
            path: root.clone(),
            source,
        })?;

        let hash_db = Database::open(&root.join("GlobalHashCache2.sqlite")).await?;
        let vfs_db = Database::open(&root.join("GlobalVFSCache5.sqlite")).await?;
        let verification_db = Database::open(&root.join("VerificationCacheV3.sqlite")).await?;

        Ok(Self {
            hash_cache: HashCache::new(hash_db.clone(), hashing_resource),
            vfs_cache: VfsCache::new(vfs_db.clone()),
            verification_cache: VerificationCache::new(verification_db.clone()),
            patch_cache: PatchCache::open(root.join("PatchCache"))?,
            hash_db,
            vfs_db,
            verification_db,
        })
    }

    pub async fn close(&self) {
        self.hash_db.close().await;
        self.vfs_db.close().await;
        self.verification_db.close().await;
    }
}
