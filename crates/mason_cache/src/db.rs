//! SQLite connection handling shared by the persistent stores.

use std::time::Duration;

use mason_core::AbsolutePath;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::error::Result;

const MAX_CONNECTIONS: u32 = 5;

/// One pooled SQLite database. Each persistent store owns its own file, so
/// the schema here covers all three tables; unused ones cost nothing.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn open(path: &AbsolutePath) -> Result<Self> {
        let options = Self::base_options()
            .filename(path.as_std())
            .create_if_missing(true);
        Self::connect(options, MAX_CONNECTIONS).await
    }

    /// In-memory database for tests. Limited to one connection so every
    /// query sees the same data.
    pub async fn open_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        Self::connect(options, 1).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // WAL keeps concurrent readers cheap during hashing storms.
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(1500))
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hash_cache (
                path  TEXT PRIMARY KEY,
                size  INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                hash  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS vfs_cache (
                archive_hash TEXT PRIMARY KEY,
                payload      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS verification_cache (
                key        TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL,
                payload    TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_created() {
        let db = Database::open_in_memory().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(names.contains(&"hash_cache"));
        assert!(names.contains(&"vfs_cache"));
        assert!(names.contains(&"verification_cache"));
        db.close().await;
    }
}
