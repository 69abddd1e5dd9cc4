//! SQLite-backed context store

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

use super::{stamp_append, stamp_put, Ack, ContextStore};
use crate::error::MemoryError;
use crate::types::ContextRecord;

/// Context store persisted in SQLite
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the context database
    pub fn open(path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MemoryError::fault(format!("create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Context store opened: {}", path.display());
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), MemoryError> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contexts (
                key TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS context_backups (
                key TEXT PRIMARY KEY,
                record TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn read(tx: &Transaction<'_>, table: &str, key: &str) -> Result<Option<ContextRecord>, MemoryError> {
        let sql = format!("SELECT record FROM {} WHERE key = ?1", table);
        let raw: Option<String> = tx
            .query_row(&sql, params![key], |row| row.get(0))
            .optional()?;
        raw.map(|r| serde_json::from_str(&r).map_err(MemoryError::from))
            .transpose()
    }

    /// Write `next`, moving the current record to the backup table
    fn replace(
        tx: &Transaction<'_>,
        previous: Option<&ContextRecord>,
        next: &ContextRecord,
    ) -> Result<(), MemoryError> {
        if let Some(prev) = previous {
            tx.execute(
                "INSERT INTO context_backups (key, record) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET record = excluded.record",
                params![prev.key, serde_json::to_string(prev)?],
            )?;
        }
        tx.execute(
            "INSERT INTO contexts (key, record, version, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                record = excluded.record,
                version = excluded.version,
                updated_at = excluded.updated_at",
            params![
                next.key,
                serde_json::to_string(next)?,
                next.version as i64,
                next.timestamp.to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ContextStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<ContextRecord>, MemoryError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT record FROM contexts WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    async fn put(&self, key: &str, record: ContextRecord) -> Result<Ack, MemoryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let previous = Self::read(&tx, "contexts", key)?;
        let stamped = stamp_put(key, previous.as_ref(), record)?;
        Self::replace(&tx, previous.as_ref(), &stamped)?;
        tx.commit()?;

        debug!("Context put (sqlite): {} v{}", key, stamped.version);
        Ok(Ack {
            key: stamped.key,
            version: stamped.version,
            timestamp: stamped.timestamp,
        })
    }

    async fn recover_from_backup(&self, key: &str) -> Result<ContextRecord, MemoryError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT record FROM context_backups WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(r) => Ok(serde_json::from_str(&r)?),
            None => Err(MemoryError::Unrecoverable(key.to_string())),
        }
    }

    async fn append(
        &self,
        key: &str,
        entry: Value,
        schema: Option<Value>,
        history_limit: usize,
    ) -> Result<ContextRecord, MemoryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let previous = Self::read(&tx, "contexts", key)?;
        let record = stamp_append(key, previous.as_ref(), entry, schema, history_limit);
        Self::replace(&tx, previous.as_ref(), &record)?;
        tx.commit()?;

        Ok(record)
    }

    async fn probe(&self) -> Result<(), MemoryError> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
