//! Context Memory
//!
//! Owns every [`ContextRecord`]. Nothing else holds shared mutable context;
//! all access goes through [`ContextStore`].
//!
//! - Writes are last-writer-wins per key, ordered by when the write lands
//! - Timestamps never go backwards for a key
//! - Each write keeps the previous record as the key's backup snapshot

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::error::MemoryError;
use crate::types::ContextRecord;

pub use sqlite::SqliteStore;

/// Acknowledgement of a successful write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub key: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl Ack {
    fn of(record: &ContextRecord) -> Self {
        Self {
            key: record.key.clone(),
            version: record.version,
            timestamp: record.timestamp,
        }
    }
}

/// Context storage backend
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Backend name for status reporting
    fn backend(&self) -> &'static str;

    /// Current record for a key, if any
    async fn get(&self, key: &str) -> Result<Option<ContextRecord>, MemoryError>;

    /// Replace a key's record; rejects records older than the stored one
    async fn put(&self, key: &str, record: ContextRecord) -> Result<Ack, MemoryError>;

    /// Last snapshot taken before the current record
    async fn recover_from_backup(&self, key: &str) -> Result<ContextRecord, MemoryError>;

    /// Atomically append a result to a key's history
    async fn append(
        &self,
        key: &str,
        entry: Value,
        schema: Option<Value>,
        history_limit: usize,
    ) -> Result<ContextRecord, MemoryError>;

    /// Liveness check
    async fn probe(&self) -> Result<(), MemoryError>;
}

/// Stamp a replacement record against the one it supersedes
pub(crate) fn stamp_put(
    key: &str,
    previous: Option<&ContextRecord>,
    mut record: ContextRecord,
) -> Result<ContextRecord, MemoryError> {
    if let Some(prev) = previous {
        if record.timestamp < prev.timestamp {
            return Err(MemoryError::StaleWrite {
                key: key.to_string(),
            });
        }
    }
    record.key = key.to_string();
    record.version = previous.map(|p| p.version + 1).unwrap_or(1);
    Ok(record)
}

/// Build the record that results from appending to `previous`
pub(crate) fn stamp_append(
    key: &str,
    previous: Option<&ContextRecord>,
    entry: Value,
    schema: Option<Value>,
    history_limit: usize,
) -> ContextRecord {
    let mut record = previous
        .cloned()
        .unwrap_or_else(|| ContextRecord::empty(key));

    record.history.push(entry);
    if history_limit > 0 && record.history.len() > history_limit {
        let excess = record.history.len() - history_limit;
        record.history.drain(..excess);
    }
    if schema.is_some() {
        record.cached_schema = schema;
    }

    let now = Utc::now();
    record.timestamp = match previous {
        Some(prev) if prev.timestamp > now => prev.timestamp,
        _ => now,
    };
    record.key = key.to_string();
    record.version = previous.map(|p| p.version + 1).unwrap_or(1);
    record
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<ContextRecord>,
    backup: Option<ContextRecord>,
}

/// Process-local context store
#[derive(Default)]
pub struct InMemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a current record
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.current.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContextStore for InMemoryStore {
    fn backend(&self) -> &'static str {
        "in_memory"
    }

    async fn get(&self, key: &str) -> Result<Option<ContextRecord>, MemoryError> {
        Ok(self.slots.lock().get(key).and_then(|s| s.current.clone()))
    }

    async fn put(&self, key: &str, record: ContextRecord) -> Result<Ack, MemoryError> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_default();

        let stamped = stamp_put(key, slot.current.as_ref(), record)?;
        let ack = Ack::of(&stamped);
        slot.backup = slot.current.replace(stamped);

        debug!("Context put: {} v{}", key, ack.version);
        Ok(ack)
    }

    async fn recover_from_backup(&self, key: &str) -> Result<ContextRecord, MemoryError> {
        self.slots
            .lock()
            .get(key)
            .and_then(|s| s.backup.clone())
            .ok_or_else(|| MemoryError::Unrecoverable(key.to_string()))
    }

    async fn append(
        &self,
        key: &str,
        entry: Value,
        schema: Option<Value>,
        history_limit: usize,
    ) -> Result<ContextRecord, MemoryError> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_default();

        let record = stamp_append(key, slot.current.as_ref(), entry, schema, history_limit);
        slot.backup = slot.current.replace(record.clone());

        debug!("Context append: {} v{} ({} entries)", key, record.version, record.history.len());
        Ok(record)
    }

    async fn probe(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}
