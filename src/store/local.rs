use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::db::{format_ts, parse_ts, Database};
use crate::error::StorageError;
use crate::model::{Payload, Record, SyncStatus};

use super::Persisted;

/// Durable keyed storage for domain records.
#[derive(Clone)]
pub struct LocalStore {
  db: Database,
}

impl LocalStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Insert or replace a record, keyed by `local_id`.
  ///
  /// A failed write is logged and reported through [`Persisted::warning`];
  /// the record itself is handed back either way.
  pub async fn put(&self, record: Record) -> Persisted<Record> {
    let row = record.clone();
    match self.db.transact(move |tx| upsert_record(tx, &row)).await {
      Ok(()) => Persisted::durable(record),
      Err(e) => {
        warn!(
          local_id = %record.local_id,
          error = %e,
          "Record not persisted, keeping in-memory copy"
        );
        Persisted::degraded(record, e)
      }
    }
  }

  pub async fn get(&self, local_id: &str) -> Result<Option<Record>, StorageError> {
    let local_id = local_id.to_string();
    self.db.transact(move |tx| read_record(tx, &local_id)).await
  }

  /// All records, most recently modified first.
  pub async fn get_all(&self) -> Result<Vec<Record>, StorageError> {
    self
      .db
      .transact(|tx| {
        let mut stmt = tx.prepare(
          "SELECT local_id, remote_id, sync_status, last_modified, payload
           FROM records ORDER BY last_modified DESC",
        )?;
        let rows = stmt.query_map([], RawRecord::from_row)?;
        let mut records = Vec::new();
        for row in rows {
          records.push(row?.into_record()?);
        }
        Ok(records)
      })
      .await
  }

  /// Look up a record by its server-assigned id.
  pub async fn find_by_remote_id(&self, id: &str) -> Result<Option<Record>, StorageError> {
    let id = id.to_string();
    self
      .db
      .transact(move |tx| {
        tx.query_row(
          "SELECT local_id, remote_id, sync_status, last_modified, payload
           FROM records WHERE remote_id = ?",
          params![id],
          RawRecord::from_row,
        )
        .optional()?
        .map(RawRecord::into_record)
        .transpose()
      })
      .await
  }

  /// Delete every record.
  pub async fn clear(&self) -> Result<(), StorageError> {
    self
      .db
      .transact(|tx| {
        tx.execute("DELETE FROM records", [])?;
        Ok(())
      })
      .await
  }
}

pub(crate) fn upsert_record(conn: &Connection, record: &Record) -> Result<(), StorageError> {
  let payload = serde_json::to_string(&record.payload)?;
  conn.execute(
    "INSERT INTO records (local_id, remote_id, sync_status, last_modified, payload)
     VALUES (?, ?, ?, ?, ?)
     ON CONFLICT(local_id) DO UPDATE SET
       remote_id = COALESCE(excluded.remote_id, records.remote_id),
       sync_status = excluded.sync_status,
       last_modified = excluded.last_modified,
       payload = excluded.payload",
    params![
      record.local_id,
      record.id,
      record.sync_status.as_str(),
      format_ts(record.last_modified),
      payload
    ],
  )?;
  Ok(())
}

/// Server id stored for `local_id`, if any.
pub(crate) fn stored_remote_id(
  conn: &Connection,
  local_id: &str,
) -> Result<Option<String>, StorageError> {
  let id = conn
    .query_row(
      "SELECT remote_id FROM records WHERE local_id = ?",
      params![local_id],
      |r| r.get::<_, Option<String>>(0),
    )
    .optional()?;
  Ok(id.flatten())
}

pub(crate) fn read_record(
  conn: &Connection,
  local_id: &str,
) -> Result<Option<Record>, StorageError> {
  conn
    .query_row(
      "SELECT local_id, remote_id, sync_status, last_modified, payload
       FROM records WHERE local_id = ?",
      params![local_id],
      RawRecord::from_row,
    )
    .optional()?
    .map(RawRecord::into_record)
    .transpose()
}

/// Columns of a `records` row before decoding.
struct RawRecord {
  local_id: String,
  remote_id: Option<String>,
  sync_status: String,
  last_modified: String,
  payload: String,
}

impl RawRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      local_id: row.get(0)?,
      remote_id: row.get(1)?,
      sync_status: row.get(2)?,
      last_modified: row.get(3)?,
      payload: row.get(4)?,
    })
  }

  fn into_record(self) -> Result<Record, StorageError> {
    let sync_status = SyncStatus::parse(&self.sync_status).ok_or_else(|| StorageError::Corrupt {
      column: "records.sync_status",
      reason: format!("unknown status '{}'", self.sync_status),
    })?;
    let payload: Payload = serde_json::from_str(&self.payload)?;

    Ok(Record {
      local_id: self.local_id,
      id: self.remote_id,
      sync_status,
      last_modified: parse_ts("records.last_modified", &self.last_modified)?,
      payload,
    })
  }
}
