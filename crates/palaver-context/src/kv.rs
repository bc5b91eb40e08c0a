//! Key-value persistence collaborator.
//!
//! The store only needs `get`/`put`/`delete` on string values; history is
//! written as JSON. Two implementations ship here: SQLite for the gateway
//! and an in-memory map for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::db::init_db;
use crate::error::{ContextError, Result};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Returns `true` when something was deleted.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Recover the guard even if another thread panicked while holding the lock;
/// the protected data is plain values that stay consistent per statement.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// SQLite-backed store. Statements run on the blocking pool against a
/// single shared connection.
pub struct SqliteKeyValueStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteKeyValueStore {
    /// Wrap an open connection, creating the table if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    async fn with_connection<T, F>(&self, func: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || func(&lock(&db)))
            .await
            .map_err(|e| ContextError::Task(e.to_string()))?
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_connection(move |db| {
            let value = db
                .query_row(
                    "SELECT value FROM kv_store WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        let now = Utc::now().to_rfc3339();
        self.with_connection(move |db| {
            db.execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                rusqlite::params![key, value, now],
            )?;
            debug!(key = %key, bytes = value.len(), "kv put");
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_connection(move |db| {
            let n = db.execute("DELETE FROM kv_store WHERE key = ?1", rusqlite::params![key])?;
            Ok(n > 0)
        })
        .await
    }
}

/// Process-local store; contents vanish on restart.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.map).get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.map).insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(lock(&self.map).remove(key).is_some())
    }
}
