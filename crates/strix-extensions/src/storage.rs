//! Per-extension persistent key/value storage.
//!
//! One SQLite database backs every extension's namespace; each row is keyed
//! `(extension_id, key)` and every query is scoped by extension id, so no
//! key is ever visible across extensions. The pool allows a single
//! connection, which serializes same-key set/get: the later call's effect is
//! observable by any strictly later get.
//!
//! Handles are lazy and memoized per extension id. Purging an extension's
//! namespace (on uninstall) revokes its handle first, so in-flight operations
//! fail with [`Error::ExtensionGone`] instead of resurrecting rows.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

/// SQLite-backed storage for every extension namespace
#[derive(Clone)]
pub struct StorageBinding {
    pool: SqlitePool,
    handles: Arc<RwLock<HashMap<String, StorageHandle>>>,
}

/// Handle scoped to one extension's namespace
#[derive(Clone, Debug)]
pub struct StorageHandle {
    pool: SqlitePool,
    extension_id: String,
    revoked: Arc<AtomicBool>,
}

impl StorageBinding {
    /// Open (or create) the storage database at `db_path`
    pub async fn from_path(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Database(format!("failed to create directory: {e}")))?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let binding = Self {
            pool,
            handles: Arc::new(RwLock::new(HashMap::new())),
        };
        binding.run_migrations().await?;

        info!("extension storage initialized at {}", db_path.display());
        Ok(binding)
    }

    /// In-memory storage (for testing and ephemeral profiles)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let binding = Self {
            pool,
            handles: Arc::new(RwLock::new(HashMap::new())),
        };
        binding.run_migrations().await?;

        debug!("in-memory extension storage initialized");
        Ok(binding)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS extension_storage (
                extension_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (extension_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_extension_storage_ext
               ON extension_storage(extension_id)"#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        debug!("extension storage migrations completed");
        Ok(())
    }

    /// Lazily open the handle for `extension_id`, memoized per id
    pub async fn open(&self, extension_id: &str) -> StorageHandle {
        let mut handles = self.handles.write().await;
        handles
            .entry(extension_id.to_string())
            .or_insert_with(|| {
                debug!("opening storage namespace for {}", extension_id);
                StorageHandle {
                    pool: self.pool.clone(),
                    extension_id: extension_id.to_string(),
                    revoked: Arc::new(AtomicBool::new(false)),
                }
            })
            .clone()
    }

    /// Delete the extension's entire namespace and revoke its handle.
    ///
    /// Called during uninstall teardown, before the registry entry is
    /// removed; later operations on outstanding handles fail with
    /// [`Error::ExtensionGone`].
    #[instrument(skip(self))]
    pub async fn purge(&self, extension_id: &str) -> Result<()> {
        if let Some(handle) = self.handles.write().await.remove(extension_id) {
            handle.revoked.store(true, Ordering::SeqCst);
        }

        let result = sqlx::query("DELETE FROM extension_storage WHERE extension_id = ?1")
            .bind(extension_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        info!(
            "purged {} storage records for {}",
            result.rows_affected(),
            extension_id
        );
        Ok(())
    }

    /// Close the connection pool (runtime shutdown)
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl StorageHandle {
    /// Extension id this handle is scoped to
    #[must_use]
    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    fn check_revoked(&self) -> Result<()> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(Error::ExtensionGone(self.extension_id.clone()));
        }
        Ok(())
    }

    /// Read the value stored under `key`
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.check_revoked()?;
        let row = sqlx::query(
            "SELECT value FROM extension_storage WHERE extension_id = ?1 AND key = ?2",
        )
        .bind(&self.extension_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let raw: String = row.get("value");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Store (insert or overwrite) `value` under `key`
    #[instrument(skip(self, value), fields(extension_id = %self.extension_id))]
    pub async fn set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.check_revoked()?;
        let raw = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO extension_storage (extension_id, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (extension_id, key)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.extension_id)
        .bind(key)
        .bind(raw)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Remove `key`; unknown keys are a no-op
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.check_revoked()?;
        sqlx::query("DELETE FROM extension_storage WHERE extension_id = ?1 AND key = ?2")
            .bind(&self.extension_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Remove every key in this namespace
    pub async fn clear(&self) -> Result<()> {
        self.check_revoked()?;
        sqlx::query("DELETE FROM extension_storage WHERE extension_id = ?1")
            .bind(&self.extension_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// All records in this namespace, ordered by key
    pub async fn entries(&self) -> Result<Vec<(String, serde_json::Value)>> {
        self.check_revoked()?;
        let rows = sqlx::query(
            "SELECT key, value FROM extension_storage WHERE extension_id = ?1 ORDER BY key",
        )
        .bind(&self.extension_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let raw: String = row.get("value");
            entries.push((key, serde_json::from_str(&raw)?));
        }
        Ok(entries)
    }
}
