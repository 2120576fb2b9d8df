//! SQLite database shared by the local store, the mutation queue and the
//! response cache.
//!
//! Every operation runs on the blocking pool inside a scoped transaction:
//! it commits when the closure succeeds and rolls back when the transaction
//! is dropped on any other path (error or panic).

pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction};

use crate::error::StorageError;

/// How long a writer waits for another connection to release the file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to one SQLite connection. Clones share the connection.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at the given path.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // WAL lets the cache worker and the application read while the other writes
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StorageError> {
    conn.execute_batch(schema::SCHEMA)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("fieldsync").join("fieldsync.db"))
  }

  /// Run `f` inside a transaction on the blocking pool.
  pub async fn transact<T, F>(&self, f: F) -> Result<T, StorageError>
  where
    T: Send + 'static,
    F: FnOnce(&Transaction<'_>) -> Result<T, StorageError> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      // A panicking closure rolled its transaction back while unwinding
      let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
      let tx = guard.transaction()?;
      let value = f(&tx)?;
      tx.commit()?;
      Ok(value)
    })
    .await
    .map_err(|e| StorageError::Task(e.to_string()))?
  }

  /// Execute raw SQL outside of a transaction.
  pub async fn execute_batch(&self, sql: &'static str) -> Result<(), StorageError> {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
      guard.execute_batch(sql)?;
      Ok(())
    })
    .await
    .map_err(|e| StorageError::Task(e.to_string()))?
  }
}

/// Format a timestamp so that lexical order matches chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`format_ts`].
pub fn parse_ts(column: &'static str, s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Corrupt {
      column,
      reason: format!("bad timestamp '{}': {}", s, e),
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration as ChronoDuration;

  #[tokio::test]
  async fn test_failed_closure_rolls_back() {
    let db = Database::open_in_memory().unwrap();

    let result: Result<(), StorageError> = db
      .transact(|tx| {
        tx.execute(
          "INSERT INTO records (local_id, sync_status, last_modified, payload)
           VALUES ('L1', 'pending', '2026-01-01T00:00:00.000000Z', '{}')",
          [],
        )?;
        Err(StorageError::Task("boom".into()))
      })
      .await;
    assert!(result.is_err());

    let count: i64 = db
      .transact(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?))
      .await
      .unwrap();
    assert_eq!(count, 0);
  }

  #[tokio::test]
  async fn test_panicking_closure_releases_connection() {
    let db = Database::open_in_memory().unwrap();

    let result: Result<(), StorageError> = db.transact(|_| panic!("closure panicked")).await;
    assert!(matches!(result, Err(StorageError::Task(_))));

    // The connection is usable again afterwards
    let count: i64 = db
      .transact(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?))
      .await
      .unwrap();
    assert_eq!(count, 0);
  }

  #[test]
  fn test_timestamps_sort_lexically() {
    let earlier = Utc::now();
    let later = earlier + ChronoDuration::milliseconds(1);
    assert!(format_ts(earlier) < format_ts(later));
    let parsed = parse_ts("ts", &format_ts(earlier)).unwrap();
    assert_eq!(parsed.timestamp_micros(), earlier.timestamp_micros());
  }

  #[test]
  fn test_open_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("fieldsync.db");
    Database::open(&path).unwrap();
    assert!(path.exists());
  }
}
