//! TTL cache for network-verification results ("does this remote source
//! still exist?"). Expired rows are purged on read.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::db::Database;
use crate::error::Result;

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct VerificationCache {
    db: Database,
    ttl: Duration,
}

impl VerificationCache {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT expires_at, payload FROM verification_cache WHERE key = ?")
                .bind(key)
                .fetch_optional(self.db.pool())
                .await?;

        match row {
            Some((expires_at, payload)) if expires_at > Self::now_secs() => Ok(Some(payload)),
            Some(_) => {
                sqlx::query("DELETE FROM verification_cache WHERE key = ?")
                    .bind(key)
                    .execute(self.db.pool())
                    .await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, payload: &str) -> Result<()> {
        let expires_at = Self::now_secs() + self.ttl.as_secs() as i64;
        sqlx::query(
            "INSERT OR REPLACE INTO verification_cache (key, expires_at, payload) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(expires_at)
        .bind(payload)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
