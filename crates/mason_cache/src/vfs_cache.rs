//! Disk cache for the virtual file system: one serialized index payload per
//! outer archive, keyed by the archive's content hash.

use mason_core::Hash;

use crate::db::Database;
use crate::error::Result;

#[derive(Clone)]
pub struct VfsCache {
    db: Database,
}

impl VfsCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, archive_hash: Hash) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM vfs_cache WHERE archive_hash = ?")
                .bind(archive_hash.to_base64())
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.map(|(payload,)| payload))
    }

    pub async fn put(&self, archive_hash: Hash, payload: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO vfs_cache (archive_hash, payload) VALUES (?, ?)")
            .bind(archive_hash.to_base64())
            .bind(payload)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn remove(&self, archive_hash: Hash) -> Result<()> {
        sqlx::query("DELETE FROM vfs_cache WHERE archive_hash = ?")
            .bind(archive_hash.to_base64())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
