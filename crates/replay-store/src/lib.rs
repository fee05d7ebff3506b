//! SQLite storage for sticky replay sessions.
//!
//! [`SqliteSessionStore`] implements [`SessionStore`] on top of a small
//! key-value table, so a replay survives a process restart the same way a
//! browser session survives a reload.
//!
//! # Thread Safety
//!
//! `rusqlite::Connection` is `Send` but not `Sync`. The store wraps it in a
//! `Mutex` so one instance can be shared with the engine behind an `Arc`.
//!
//! # Schema
//!
//! One `replay_kv` table keyed by name. `updated_at` is stored as TEXT in
//! ISO 8601 with millisecond precision (e.g. `2024-01-15T10:30:00.000Z`),
//! so lexicographic order matches chronological order.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use replay_core::{SessionStore, StoreError};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp for {key}: {timestamp}")]
    TimestampParse {
        key: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        Self::Backend(Box::new(e))
    }
}

/// A stored entry with its last write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Session store backed by a SQLite file.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish_non_exhaustive()
    }
}

impl SqliteSessionStore {
    /// Opens a store at the given path, creating it if necessary.
    ///
    /// The schema is initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Opens an in-memory store, gone when dropped.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Creates the schema. Idempotent.
    fn init(&self) -> Result<(), DbError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS replay_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads a value.
    pub fn read(&self, key: &str) -> Result<Option<String>, DbError> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM replay_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Inserts or replaces a value, stamping it with `now`.
    pub fn write(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<(), DbError> {
        self.conn().execute(
            "
            INSERT INTO replay_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            ",
            params![key, value, format_timestamp(now)],
        )?;
        Ok(())
    }

    /// Deletes a value. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool, DbError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM replay_kv WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    /// Reads a value with its write time.
    pub fn entry(&self, key: &str) -> Result<Option<StoredEntry>, DbError> {
        let row: Option<(String, String)> = self
            .conn()
            .query_row(
                "SELECT value, updated_at FROM replay_kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(value, updated_at)| {
            Ok(StoredEntry {
                key: key.to_string(),
                value,
                updated_at: parse_timestamp(key, &updated_at)?,
            })
        })
        .transpose()
    }
}

impl SessionStore for SqliteSessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read(key)?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Ok(self.write(key, value, Utc::now())?)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let existed = self.delete(key)?;
        tracing::trace!(key, existed, "removed stored entry");
        Ok(())
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(key: &str, timestamp: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            key: key.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use replay_core::REPLAY_SESSION_KEY;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, secs).unwrap()
    }

    #[test]
    fn open_in_memory_store() {
        let store = SqliteSessionStore::open_in_memory();
        assert!(store.is_ok());
    }

    #[test]
    fn init_is_idempotent() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.write("k", "v", ts(0)).unwrap();
        store.init().unwrap();
        assert_eq!(store.read("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn missing_key_reads_none() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        assert_eq!(store.read(REPLAY_SESSION_KEY).unwrap(), None);
        assert_eq!(store.entry(REPLAY_SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn write_replaces_value_and_timestamp() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.write("k", "first", ts(0)).unwrap();
        store.write("k", "second", ts(30)).unwrap();

        let entry = store.entry("k").unwrap().unwrap();
        assert_eq!(entry.value, "second");
        assert_eq!(entry.updated_at, ts(30));
    }

    #[test]
    fn delete_reports_whether_key_existed() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.write("k", "v", ts(0)).unwrap();
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
        assert_eq!(store.read("k").unwrap(), None);
    }

    #[test]
    fn session_store_trait_round_trips() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let store: &dyn SessionStore = &store;

        store.set(REPLAY_SESSION_KEY, "{}").unwrap();
        assert_eq!(store.get(REPLAY_SESSION_KEY).unwrap().as_deref(), Some("{}"));
        store.remove(REPLAY_SESSION_KEY).unwrap();
        store.remove(REPLAY_SESSION_KEY).unwrap();
        assert_eq!(store.get(REPLAY_SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn corrupt_timestamp_is_reported() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO replay_kv (key, value, updated_at) VALUES ('k', 'v', 'yesterday')",
                [],
            )
            .unwrap();

        let err = store.entry("k").unwrap_err();
        assert!(matches!(err, DbError::TimestampParse { ref key, .. } if key == "k"));
    }

    #[test]
    fn db_errors_become_backend_store_errors() {
        let err = DbError::Sqlite(rusqlite::Error::InvalidQuery);
        assert!(matches!(StoreError::from(err), StoreError::Backend(_)));
    }
}
