//! Database connection management.

use crate::conversation::store::SqliteConversationStore;
use crate::error::{DbError, Result};
use crate::tasks::store::SqliteTaskStore;
use anyhow::Context as _;
use sqlx::SqlitePool;
use std::path::Path;

/// SQLite connection bundle.
pub struct Db {
    /// SQLite pool for tasks, conversations and messages.
    pub sqlite: SqlitePool,
}

impl Db {
    /// Connect to `hearken.db` in the data directory and create every table.
    pub async fn connect(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let sqlite_url = format!("sqlite:{}?mode=rwc", data_dir.join("hearken.db").display());
        let sqlite = SqlitePool::connect(&sqlite_url)
            .await
            .map_err(DbError::SqliteConnect)?;

        let db = Self { sqlite };
        db.initialize().await?;
        Ok(db)
    }

    async fn initialize(&self) -> Result<()> {
        SqliteTaskStore::new(self.sqlite.clone()).initialize().await?;
        SqliteConversationStore::new(self.sqlite.clone())
            .initialize()
            .await?;
        Ok(())
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.sqlite.close().await;
    }
}

/// Timestamps are stored as unix milliseconds.
pub(crate) fn to_millis(timestamp: chrono::DateTime<chrono::Utc>) -> i64 {
    timestamp.timestamp_millis()
}

pub(crate) fn from_millis(
    millis: i64,
    column: &'static str,
) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        DbError::InvalidColumn {
            column,
            value: millis.to_string(),
        }
        .into()
    })
}
