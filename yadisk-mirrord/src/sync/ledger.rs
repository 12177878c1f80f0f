use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use time::OffsetDateTime;

use super::key::ObjectKey;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub key: String,
    pub subfolder: String,
    pub filename: String,
    pub present: bool,
    pub updated_at: i64,
}

/// Durable record of which source keys are known to be mirrored.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let ledger = Self { pool };
        ledger.init().await?;
        Ok(ledger)
    }

    pub async fn init(&self) -> Result<(), LedgerError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_present(&self, object: &ObjectKey) -> Result<(), LedgerError> {
        self.upsert(object, true, now_unix()).await
    }

    pub async fn mark_absent(&self, object: &ObjectKey) -> Result<(), LedgerError> {
        self.upsert(object, false, now_unix()).await
    }

    pub async fn upsert(
        &self,
        object: &ObjectKey,
        present: bool,
        updated_at: i64,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO ledger (key, subfolder, filename, present, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                 subfolder = excluded.subfolder,
                 filename = excluded.filename,
                 present = excluded.present,
                 updated_at = excluded.updated_at",
        )
        .bind(&object.key)
        .bind(&object.subfolder)
        .bind(&object.filename)
        .bind(if present { 1 } else { 0 })
        .bind(updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<LedgerRow>, LedgerError> {
        let row = sqlx::query(
            "SELECT key, subfolder, filename, present, updated_at FROM ledger WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_record(&row)).transpose()
    }

    /// Every row currently marked present, used to seed the per-pass index.
    pub async fn present_rows(&self) -> Result<Vec<LedgerRow>, LedgerError> {
        let rows = sqlx::query(
            "SELECT key, subfolder, filename, present, updated_at
             FROM ledger
             WHERE present = 1
             ORDER BY key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerRow, LedgerError> {
    let present: i64 = row.try_get("present")?;
    Ok(LedgerRow {
        key: row.try_get("key")?,
        subfolder: row.try_get("subfolder")?,
        filename: row.try_get("filename")?,
        present: present != 0,
        updated_at: row.try_get("updated_at")?,
    })
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn default_ledger_path() -> Result<PathBuf, LedgerError> {
    let mut path = dirs::data_dir().ok_or(LedgerError::MissingDataDir)?;
    path.push("yadisk-mirror");
    path.push("ledger.db");
    Ok(path)
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
