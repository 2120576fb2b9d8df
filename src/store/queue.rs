use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::{format_ts, parse_ts, Database};
use crate::error::{RemoteError, StorageError};
use crate::model::{Payload, Record, SyncStatus};
use crate::remote::{Mutation, RemoteRecord};
use crate::sync::RetryPolicy;

use super::local::{read_record, stored_remote_id, upsert_record};

/// Kind of pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Upsert,
}

/// A pending write for one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
  pub local_id: String,
  pub operation: Operation,
  /// Server id known when the entry was written
  pub remote_id: Option<String>,
  /// Payload snapshot sent on drain
  pub payload: Payload,
  pub last_modified: DateTime<Utc>,
  pub enqueued_at: DateTime<Utc>,
  /// Bumped every time a new edit replaces the entry
  pub revision: i64,
  pub attempts: u32,
  pub next_attempt_at: DateTime<Utc>,
  pub last_error: Option<String>,
  /// Given up on; stays queued until edited again or retried by hand
  pub dead_letter: bool,
}

impl QueueEntry {
  /// The idempotent upsert this entry stands for.
  pub fn mutation(&self) -> Mutation {
    Mutation {
      id: self.remote_id.clone(),
      client_ref: self.local_id.clone(),
      last_modified: self.last_modified,
      payload: self.payload.clone(),
    }
  }
}

/// Outcome of reconciling a successful upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
  /// Entry removed, record marked synced
  Synced(Record),
  /// A newer edit replaced the entry while the upsert was in flight;
  /// only the server id was recorded
  Superseded,
  /// The record was cleared while the upsert was in flight
  Discarded,
}

/// Outcome of recording a failed upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
  Retrying {
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
  },
  DeadLettered,
  /// The entry changed under us; the failure no longer applies
  Stale,
}

/// Live entries a drain cycle may consider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drainable {
  /// Entries to send now, in enqueue order
  pub ready: Vec<QueueEntry>,
  /// Entries still backing off
  pub waiting: usize,
}

/// Durable ordered set of pending writes, at most one per record.
#[derive(Clone)]
pub struct MutationQueue {
  db: Database,
}

impl MutationQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Write `record` as pending and queue its upsert in one transaction,
  /// replacing any entry it already has.
  ///
  /// A record handed in without a server id keeps the one already stored.
  pub async fn enqueue(&self, record: &Record) -> Result<QueueEntry, StorageError> {
    let mut record = record.clone();
    record.sync_status = SyncStatus::Pending;
    self
      .db
      .transact(move |tx| {
        if record.id.is_none() {
          record.id = stored_remote_id(tx, &record.local_id)?;
        }
        upsert_record(tx, &record)?;
        enqueue_tx(tx, &record, Utc::now())
      })
      .await
  }

  /// All entries in enqueue order, dead letters included.
  pub async fn entries(&self) -> Result<Vec<QueueEntry>, StorageError> {
    self
      .db
      .transact(|tx| select_entries(tx, "SELECT * FROM mutation_queue ORDER BY seq"))
      .await
  }

  pub async fn dead_letters(&self) -> Result<Vec<QueueEntry>, StorageError> {
    self
      .db
      .transact(|tx| {
        select_entries(
          tx,
          "SELECT * FROM mutation_queue WHERE dead_letter = 1 ORDER BY seq",
        )
      })
      .await
  }

  /// Live entries in enqueue order, split by whether they may be sent at
  /// `now`. Without `respect_backoff` every live entry is ready.
  pub async fn drainable(
    &self,
    now: DateTime<Utc>,
    respect_backoff: bool,
  ) -> Result<Drainable, StorageError> {
    let entries = self
      .db
      .transact(|tx| {
        select_entries(
          tx,
          "SELECT * FROM mutation_queue WHERE dead_letter = 0 ORDER BY seq",
        )
      })
      .await?;

    let mut drainable = Drainable::default();
    for entry in entries {
      if respect_backoff && entry.next_attempt_at > now {
        drainable.waiting += 1;
      } else {
        drainable.ready.push(entry);
      }
    }
    Ok(drainable)
  }

  pub async fn get(&self, local_id: &str) -> Result<Option<QueueEntry>, StorageError> {
    let local_id = local_id.to_string();
    self.db.transact(move |tx| read_entry(tx, &local_id)).await
  }

  /// Number of records with a pending write.
  pub async fn len(&self) -> Result<usize, StorageError> {
    self
      .db
      .transact(|tx| {
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM mutation_queue", [], |r| r.get(0))?;
        Ok(count as usize)
      })
      .await
  }

  /// Revive dead-lettered entries with a fresh attempt budget.
  pub async fn retry_dead_letters(&self) -> Result<usize, StorageError> {
    let now = format_ts(Utc::now());
    self
      .db
      .transact(move |tx| {
        let revived = tx.execute(
          "UPDATE mutation_queue
           SET dead_letter = 0, attempts = 0, next_attempt_at = ?, last_error = NULL
           WHERE dead_letter = 1",
          params![now],
        )?;
        Ok(revived)
      })
      .await
  }

  /// Reconcile a successful upsert of `entry`.
  ///
  /// The entry is removed and the record marked synced only if no newer edit
  /// replaced the entry meanwhile. Server fields are merged into the record.
  pub async fn complete(
    &self,
    entry: &QueueEntry,
    remote: RemoteRecord,
  ) -> Result<Completion, StorageError> {
    let local_id = entry.local_id.clone();
    let revision = entry.revision;
    self
      .db
      .transact(move |tx| {
        let Some(mut record) = read_record(tx, &local_id)? else {
          tx.execute(
            "DELETE FROM mutation_queue WHERE local_id = ? AND revision = ?",
            params![local_id, revision],
          )?;
          return Ok(Completion::Discarded);
        };

        let current_revision: Option<i64> = tx
          .query_row(
            "SELECT revision FROM mutation_queue WHERE local_id = ?",
            params![local_id],
            |r| r.get(0),
          )
          .optional()?;

        if current_revision.is_some_and(|r| r != revision) {
          // Keep the newer edit queued but let it upsert by server id
          tx.execute(
            "UPDATE mutation_queue SET remote_id = ? WHERE local_id = ?",
            params![remote.id, local_id],
          )?;
          record.id = Some(remote.id);
          upsert_record(tx, &record)?;
          return Ok(Completion::Superseded);
        }

        tx.execute(
          "DELETE FROM mutation_queue WHERE local_id = ?",
          params![local_id],
        )?;
        record.id = Some(remote.id);
        record.sync_status = SyncStatus::Synced;
        if let Some(server_modified) = remote.last_modified {
          record.last_modified = server_modified;
        }
        record.payload.merge_from(remote.payload);
        upsert_record(tx, &record)?;
        Ok(Completion::Synced(record))
      })
      .await
  }

  /// Record a failed upsert of `entry` and schedule its next attempt.
  pub async fn record_failure(
    &self,
    entry: &QueueEntry,
    error: &RemoteError,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
  ) -> Result<FailureOutcome, StorageError> {
    let attempts = entry.attempts.saturating_add(1);
    let give_up = !error.is_retryable() || policy.is_exhausted(attempts);
    let next_attempt_at = now + policy.delay_for(attempts);
    let local_id = entry.local_id.clone();
    let revision = entry.revision;
    let message = error.to_string();

    let updated = self
      .db
      .transact(move |tx| {
        let updated = tx.execute(
          "UPDATE mutation_queue
           SET attempts = ?, next_attempt_at = ?, last_error = ?
           WHERE local_id = ? AND revision = ?",
          params![
            attempts,
            format_ts(next_attempt_at),
            message,
            local_id,
            revision
          ],
        )?;
        if updated > 0 && give_up {
          dead_letter_tx(tx, &local_id, revision, &message)?;
        }
        Ok(updated)
      })
      .await?;

    if updated == 0 {
      debug!(local_id = %entry.local_id, "Entry replaced during upsert, ignoring failure");
      return Ok(FailureOutcome::Stale);
    }
    if give_up {
      warn!(local_id = %entry.local_id, attempts, error = %error, "Mutation dead-lettered");
      return Ok(FailureOutcome::DeadLettered);
    }
    Ok(FailureOutcome::Retrying {
      attempts,
      next_attempt_at,
    })
  }

  /// Give up on `entry` without another attempt.
  ///
  /// Returns false when a newer edit replaced the entry meanwhile; the newer
  /// edit stays live.
  pub async fn dead_letter(&self, entry: &QueueEntry, reason: &str) -> Result<bool, StorageError> {
    let local_id = entry.local_id.clone();
    let revision = entry.revision;
    let message = reason.to_string();
    let updated = self
      .db
      .transact(move |tx| dead_letter_tx(tx, &local_id, revision, &message))
      .await?;

    if updated {
      warn!(local_id = %entry.local_id, reason, "Mutation dead-lettered");
    }
    Ok(updated)
  }

  /// Drop every queued entry.
  pub async fn clear(&self) -> Result<(), StorageError> {
    self
      .db
      .transact(|tx| {
        tx.execute("DELETE FROM mutation_queue", [])?;
        Ok(())
      })
      .await
  }
}

/// Insert or replace the entry for `record`.
///
/// Replacing moves the entry to the back of the queue, bumps its revision and
/// resets its retry state, since it now carries a different mutation.
pub(crate) fn enqueue_tx(
  conn: &Connection,
  record: &Record,
  now: DateTime<Utc>,
) -> Result<QueueEntry, StorageError> {
  let payload = serde_json::to_string(&record.payload)?;
  let now_str = format_ts(now);
  conn.execute(
    "INSERT INTO mutation_queue
       (local_id, seq, operation, remote_id, payload, last_modified, enqueued_at,
        revision, attempts, next_attempt_at, last_error, dead_letter)
     VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM mutation_queue), 'upsert',
             ?2, ?3, ?4, ?5, 1, 0, ?5, NULL, 0)
     ON CONFLICT(local_id) DO UPDATE SET
       seq = excluded.seq,
       remote_id = COALESCE(excluded.remote_id, mutation_queue.remote_id),
       payload = excluded.payload,
       last_modified = excluded.last_modified,
       enqueued_at = excluded.enqueued_at,
       revision = mutation_queue.revision + 1,
       attempts = 0,
       next_attempt_at = excluded.next_attempt_at,
       last_error = NULL,
       dead_letter = 0",
    params![
      record.local_id,
      record.id,
      payload,
      format_ts(record.last_modified),
      now_str
    ],
  )?;

  read_entry(conn, &record.local_id)?.ok_or_else(|| StorageError::Corrupt {
    column: "mutation_queue",
    reason: format!("entry for {} missing after enqueue", record.local_id),
  })
}

fn dead_letter_tx(
  conn: &Connection,
  local_id: &str,
  revision: i64,
  reason: &str,
) -> Result<bool, StorageError> {
  let updated = conn.execute(
    "UPDATE mutation_queue SET dead_letter = 1, last_error = ?
     WHERE local_id = ? AND revision = ?",
    params![reason, local_id, revision],
  )?;
  Ok(updated > 0)
}

fn read_entry(conn: &Connection, local_id: &str) -> Result<Option<QueueEntry>, StorageError> {
  conn
    .query_row(
      "SELECT * FROM mutation_queue WHERE local_id = ?",
      params![local_id],
      RawEntry::from_row,
    )
    .optional()?
    .map(RawEntry::into_entry)
    .transpose()
}

fn select_entries(conn: &Connection, sql: &str) -> Result<Vec<QueueEntry>, StorageError> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt.query_map([], RawEntry::from_row)?;
  let mut entries = Vec::new();
  for row in rows {
    entries.push(row?.into_entry()?);
  }
  Ok(entries)
}

/// Columns of a `mutation_queue` row before decoding.
struct RawEntry {
  local_id: String,
  remote_id: Option<String>,
  payload: String,
  last_modified: String,
  enqueued_at: String,
  revision: i64,
  attempts: u32,
  next_attempt_at: String,
  last_error: Option<String>,
  dead_letter: bool,
}

impl RawEntry {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      local_id: row.get("local_id")?,
      remote_id: row.get("remote_id")?,
      payload: row.get("payload")?,
      last_modified: row.get("last_modified")?,
      enqueued_at: row.get("enqueued_at")?,
      revision: row.get("revision")?,
      attempts: row.get("attempts")?,
      next_attempt_at: row.get("next_attempt_at")?,
      last_error: row.get("last_error")?,
      dead_letter: row.get("dead_letter")?,
    })
  }

  fn into_entry(self) -> Result<QueueEntry, StorageError> {
    Ok(QueueEntry {
      local_id: self.local_id,
      operation: Operation::Upsert,
      remote_id: self.remote_id,
      payload: serde_json::from_str(&self.payload)?,
      last_modified: parse_ts("mutation_queue.last_modified", &self.last_modified)?,
      enqueued_at: parse_ts("mutation_queue.enqueued_at", &self.enqueued_at)?,
      revision: self.revision,
      attempts: self.attempts,
      next_attempt_at: parse_ts("mutation_queue.next_attempt_at", &self.next_attempt_at)?,
      last_error: self.last_error,
      dead_letter: self.dead_letter,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::LocalStore;
  use std::time::Duration;

  fn setup() -> (LocalStore, MutationQueue) {
    let db = Database::open_in_memory().unwrap();
    (LocalStore::new(db.clone()), MutationQueue::new(db))
  }

  fn remote_for(entry: &QueueEntry, id: &str) -> RemoteRecord {
    RemoteRecord {
      id: id.to_string(),
      client_ref: Some(entry.local_id.clone()),
      last_modified: None,
      payload: entry.payload.clone(),
    }
  }

  #[tokio::test]
  async fn test_reedit_replaces_entry_instead_of_appending() {
    let (_, queue) = setup();
    let mut record = Record::with_local_id("L1", Payload::titled("leak"));
    let first = queue.enqueue(&record).await.unwrap();

    record.payload.title = Some("leak, repaired".into());
    let second = queue.enqueue(&record).await.unwrap();

    assert_eq!(queue.len().await.unwrap(), 1);
    assert_eq!(second.revision, first.revision + 1);
    let entries = queue.entries().await.unwrap();
    assert_eq!(entries[0].payload.title.as_deref(), Some("leak, repaired"));
  }

  #[tokio::test]
  async fn test_entries_follow_enqueue_order() {
    let (_, queue) = setup();
    for id in ["L1", "L2", "L3"] {
      queue
        .enqueue(&Record::with_local_id(id, Payload::titled(id)))
        .await
        .unwrap();
    }
    // Editing L1 again moves it to the back
    queue
      .enqueue(&Record::with_local_id("L1", Payload::titled("again")))
      .await
      .unwrap();

    let order: Vec<_> = queue
      .entries()
      .await
      .unwrap()
      .into_iter()
      .map(|e| e.local_id)
      .collect();
    assert_eq!(order, vec!["L2", "L3", "L1"]);
  }

  #[tokio::test]
  async fn test_complete_marks_record_synced_and_removes_entry() {
    let (store, queue) = setup();
    let entry = queue
      .enqueue(&Record::with_local_id("L1", Payload::titled("leak")))
      .await
      .unwrap();

    let completion = queue
      .complete(&entry, remote_for(&entry, "srv-1"))
      .await
      .unwrap();

    assert!(matches!(completion, Completion::Synced(_)));
    assert_eq!(queue.len().await.unwrap(), 0);
    let record = store.get("L1").await.unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.id.as_deref(), Some("srv-1"));
  }

  #[tokio::test]
  async fn test_complete_keeps_newer_edit_queued() {
    let (store, queue) = setup();
    let mut record = Record::with_local_id("L1", Payload::titled("leak"));
    let in_flight = queue.enqueue(&record).await.unwrap();

    record.payload.title = Some("leak, repaired".into());
    queue.enqueue(&record).await.unwrap();

    let completion = queue
      .complete(&in_flight, remote_for(&in_flight, "srv-1"))
      .await
      .unwrap();
    assert_eq!(completion, Completion::Superseded);

    let entry = queue.get("L1").await.unwrap().unwrap();
    assert_eq!(entry.remote_id.as_deref(), Some("srv-1"));
    assert_eq!(entry.payload.title.as_deref(), Some("leak, repaired"));

    let stored = store.get("L1").await.unwrap().unwrap();
    assert!(stored.is_pending());
    assert_eq!(stored.payload.title.as_deref(), Some("leak, repaired"));
  }

  #[tokio::test]
  async fn test_transient_failures_back_off_then_dead_letter() {
    let (_, queue) = setup();
    let policy = RetryPolicy {
      max_attempts: 2,
      base_delay: Duration::from_secs(10),
      max_delay: Duration::from_secs(60),
    };
    let err = RemoteError::Transient("offline".into());
    let now = Utc::now();

    let entry = queue
      .enqueue(&Record::with_local_id("L1", Payload::titled("leak")))
      .await
      .unwrap();
    let outcome = queue
      .record_failure(&entry, &err, &policy, now)
      .await
      .unwrap();
    assert_eq!(
      outcome,
      FailureOutcome::Retrying {
        attempts: 1,
        next_attempt_at: now + chrono::Duration::seconds(10),
      }
    );

    let entry = queue.get("L1").await.unwrap().unwrap();
    let outcome = queue
      .record_failure(&entry, &err, &policy, now)
      .await
      .unwrap();
    assert_eq!(outcome, FailureOutcome::DeadLettered);
    assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
    // Still counted as pending
    assert_eq!(queue.len().await.unwrap(), 1);

    assert_eq!(queue.retry_dead_letters().await.unwrap(), 1);
    let revived = queue.get("L1").await.unwrap().unwrap();
    assert!(!revived.dead_letter);
    assert_eq!(revived.attempts, 0);
  }

  #[tokio::test]
  async fn test_authorization_failure_is_dead_lettered_immediately() {
    let (_, queue) = setup();
    let entry = queue
      .enqueue(&Record::with_local_id("L1", Payload::titled("leak")))
      .await
      .unwrap();

    let outcome = queue
      .record_failure(
        &entry,
        &RemoteError::Authorization("outside scope".into()),
        &RetryPolicy::default(),
        Utc::now(),
      )
      .await
      .unwrap();

    assert_eq!(outcome, FailureOutcome::DeadLettered);
  }

  #[tokio::test]
  async fn test_failure_for_replaced_entry_is_stale() {
    let (_, queue) = setup();
    let mut record = Record::with_local_id("L1", Payload::titled("leak"));
    let old = queue.enqueue(&record).await.unwrap();
    record.payload.title = Some("newer".into());
    queue.enqueue(&record).await.unwrap();

    let outcome = queue
      .record_failure(
        &old,
        &RemoteError::Transient("offline".into()),
        &RetryPolicy::default(),
        Utc::now(),
      )
      .await
      .unwrap();

    assert_eq!(outcome, FailureOutcome::Stale);
    assert_eq!(queue.get("L1").await.unwrap().unwrap().attempts, 0);
  }

  #[tokio::test]
  async fn test_enqueue_marks_record_pending_and_keeps_server_id() {
    let (store, queue) = setup();
    let mut synced = Record::with_local_id("L1", Payload::titled("leak"));
    synced.id = Some("srv-1".into());
    synced.sync_status = SyncStatus::Synced;
    store.put(synced).await;

    let entry = queue
      .enqueue(&Record::with_local_id("L1", Payload::titled("leak, repaired")))
      .await
      .unwrap();

    assert_eq!(entry.remote_id.as_deref(), Some("srv-1"));
    assert_eq!(entry.mutation().id.as_deref(), Some("srv-1"));
    let stored = store.get("L1").await.unwrap().unwrap();
    assert!(stored.is_pending());
    assert_eq!(stored.id.as_deref(), Some("srv-1"));
  }

  #[tokio::test]
  async fn test_drainable_skips_dead_letters_and_backoff() {
    let (_, queue) = setup();
    let now = Utc::now();
    let policy = RetryPolicy {
      max_attempts: 5,
      base_delay: Duration::from_secs(60),
      max_delay: Duration::from_secs(60),
    };
    for id in ["L1", "L2", "L3"] {
      queue
        .enqueue(&Record::with_local_id(id, Payload::titled(id)))
        .await
        .unwrap();
    }
    let l1 = queue.get("L1").await.unwrap().unwrap();
    queue
      .record_failure(&l1, &RemoteError::Transient("timeout".into()), &policy, now)
      .await
      .unwrap();
    let l3 = queue.get("L3").await.unwrap().unwrap();
    assert!(queue.dead_letter(&l3, "bad payload").await.unwrap());

    let periodic = queue.drainable(now, true).await.unwrap();
    let ready: Vec<_> = periodic.ready.iter().map(|e| e.local_id.as_str()).collect();
    assert_eq!(ready, vec!["L2"]);
    assert_eq!(periodic.waiting, 1);

    let manual = queue.drainable(now, false).await.unwrap();
    let ready: Vec<_> = manual.ready.iter().map(|e| e.local_id.as_str()).collect();
    assert_eq!(ready, vec!["L1", "L2"]);
    assert_eq!(manual.waiting, 0);
  }

  #[tokio::test]
  async fn test_dead_letter_keeps_entry_until_retried() {
    let (store, queue) = setup();
    let entry = queue
      .enqueue(&Record::with_local_id("L1", Payload::titled("leak")))
      .await
      .unwrap();

    assert!(queue.dead_letter(&entry, "schema mismatch").await.unwrap());

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("schema mismatch"));
    assert_eq!(queue.len().await.unwrap(), 1);
    assert!(store.get("L1").await.unwrap().unwrap().is_pending());

    assert_eq!(queue.retry_dead_letters().await.unwrap(), 1);
    assert!(queue.dead_letters().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_dead_letter_ignores_replaced_entry() {
    let (_, queue) = setup();
    let mut record = Record::with_local_id("L1", Payload::titled("leak"));
    let old = queue.enqueue(&record).await.unwrap();
    record.payload.title = Some("newer".into());
    queue.enqueue(&record).await.unwrap();

    assert!(!queue.dead_letter(&old, "schema mismatch").await.unwrap());
    assert!(queue.dead_letters().await.unwrap().is_empty());
  }
}
