//! The Sync API consumed by the UI layer.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::SyncError;
use crate::model::{Record, SyncStatus};
use crate::remote::{Mutation, RemoteApi, RemoteRecord};
use crate::store::{LocalStore, MutationQueue, Persisted, QueueEntry};

use super::engine::{EntryOutcome, SyncEngine, SyncReport, Trigger};
use super::network::NetworkMonitor;
use super::retry::RetryPolicy;

/// Settings for a [`SyncService`].
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
  pub retry: RetryPolicy,
  /// Drain on a timer as well as on reconnect
  pub periodic: Option<Duration>,
  /// Resource scopes pulled from the remote
  pub scopes: Vec<String>,
}

/// Status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Indicators {
  pub online: bool,
  /// True only while a drain cycle runs
  pub syncing: bool,
  pub pending: usize,
}

/// Outcome of merging remote records into the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
  pub merged: usize,
  /// Records with unsynced local edits, left untouched
  pub skipped: usize,
}

/// Offline-first sync service.
///
/// Create one with [`SyncService::init`], share it by reference or `Arc`, and
/// stop its background work with [`SyncService::dispose`].
pub struct SyncService {
  store: LocalStore,
  queue: MutationQueue,
  engine: Arc<SyncEngine>,
  monitor: Arc<NetworkMonitor>,
  remote: Arc<dyn RemoteApi>,
  scopes: Vec<String>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
  /// Wire the store, queue and engine together and start listening for
  /// reconnects. Must be called inside a Tokio runtime.
  pub fn init(
    db: Database,
    remote: Arc<dyn RemoteApi>,
    monitor: Arc<NetworkMonitor>,
    options: SyncOptions,
  ) -> Self {
    let store = LocalStore::new(db.clone());
    let queue = MutationQueue::new(db);
    let engine = Arc::new(SyncEngine::new(
      queue.clone(),
      Arc::clone(&remote),
      Arc::clone(&monitor),
      options.retry,
    ));
    let triggers = engine.spawn_triggers(monitor.edges(), options.periodic);

    Self {
      store,
      queue,
      engine,
      monitor,
      remote,
      scopes: options.scopes,
      tasks: Mutex::new(vec![triggers]),
    }
  }

  /// Tie a background task to this service's lifetime.
  pub fn attach(&self, task: JoinHandle<()>) {
    self
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(task);
  }

  /// Stop background tasks. Queued work stays on disk for the next run.
  pub async fn dispose(self) {
    let tasks = self.tasks.into_inner().unwrap_or_else(PoisonError::into_inner);
    for task in &tasks {
      task.abort();
    }
    join_all(tasks).await;
    debug!("Sync service disposed");
  }

  pub fn monitor(&self) -> &Arc<NetworkMonitor> {
    &self.monitor
  }

  /// Save a record locally and push it if online.
  ///
  /// Offline, or when the push fails transiently, the record comes back
  /// pending and stays queued. Only a permanent rejection of the write
  /// (e.g. the resource is outside the caller's scope) is an error.
  pub async fn save(&self, mut record: Record) -> Result<Persisted<Record>, SyncError> {
    record.payload.validate().map_err(SyncError::Invalid)?;
    record.last_modified = Utc::now();
    record.sync_status = SyncStatus::Pending;

    let entry = match self.queue.enqueue(&record).await {
      Ok(entry) => {
        record.id = entry.remote_id.clone();
        entry
      }
      Err(e) => {
        warn!(local_id = %record.local_id, error = %e, "Save not persisted, continuing in memory");
        let record = self.push_unpersisted(record).await;
        return Ok(Persisted::degraded(record, e));
      }
    };

    if !self.monitor.is_online() {
      debug!(local_id = %record.local_id, "Offline, save queued");
      return Ok(Persisted::durable(record));
    }

    match self.engine.push(&entry).await {
      EntryOutcome::Synced(synced) => Ok(Persisted::durable(synced)),
      EntryOutcome::DeadLettered(err) => Err(SyncError::dead_lettered(&record.local_id, err)),
      EntryOutcome::Superseded
      | EntryOutcome::Retrying
      | EntryOutcome::InFlight
      | EntryOutcome::Gone => Ok(Persisted::durable(record)),
    }
  }

  /// Best-effort push of a record the disk refused to hold.
  async fn push_unpersisted(&self, mut record: Record) -> Record {
    if !self.monitor.is_online() {
      return record;
    }
    let mutation = Mutation {
      id: record.id.clone(),
      client_ref: record.local_id.clone(),
      last_modified: record.last_modified,
      payload: record.payload.clone(),
    };
    match self.remote.upsert(&mutation).await {
      Ok(remote) => {
        record.id = Some(remote.id);
        record.sync_status = SyncStatus::Synced;
        record.payload.merge_from(remote.payload);
      }
      Err(e) => warn!(local_id = %record.local_id, error = %e, "Direct upsert failed"),
    }
    record
  }

  pub async fn get(&self, local_id: &str) -> Result<Option<Record>, SyncError> {
    Ok(self.store.get(local_id).await?)
  }

  /// All local records, most recently modified first.
  pub async fn get_all(&self) -> Result<Vec<Record>, SyncError> {
    Ok(self.store.get_all().await?)
  }

  /// Number of records with unsynced edits.
  pub async fn pending_count(&self) -> Result<usize, SyncError> {
    Ok(self.queue.len().await?)
  }

  /// Drain the queue now.
  pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
    Ok(self.engine.drain(Trigger::Manual).await?)
  }

  /// Delete all local records and pending writes (e.g. on logout).
  pub async fn clear_all(&self) -> Result<(), SyncError> {
    self.queue.clear().await?;
    self.store.clear().await?;
    info!("Local records and pending writes cleared");
    Ok(())
  }

  /// Mutations the engine gave up on.
  pub async fn dead_letters(&self) -> Result<Vec<QueueEntry>, SyncError> {
    Ok(self.queue.dead_letters().await?)
  }

  /// Give dead-lettered mutations a fresh attempt budget.
  pub async fn retry_dead_letters(&self) -> Result<usize, SyncError> {
    Ok(self.queue.retry_dead_letters().await?)
  }

  pub async fn indicators(&self) -> Indicators {
    let pending = match self.queue.len().await {
      Ok(pending) => pending,
      Err(e) => {
        warn!(error = %e, "Failed to count pending writes");
        0
      }
    };
    Indicators {
      online: self.monitor.is_online(),
      syncing: self.engine.is_syncing(),
      pending,
    }
  }

  /// Fetch the caller's scoped records and merge them into the local store.
  ///
  /// Records with pending local edits are left alone; their queued upsert
  /// wins when it drains (last write wins).
  pub async fn pull(&self) -> Result<PullReport, SyncError> {
    let remote_records = self.remote.fetch(&self.scopes).await?;
    let mut report = PullReport::default();

    for remote in remote_records {
      let existing = self.find_local(&remote).await?;
      let record = match existing {
        Some(local) if local.is_pending() => {
          report.skipped += 1;
          continue;
        }
        Some(mut local) => {
          local.id = Some(remote.id);
          local.payload = remote.payload;
          if let Some(modified) = remote.last_modified {
            local.last_modified = modified;
          }
          local
        }
        None => Record {
          local_id: remote
            .client_ref
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
          id: Some(remote.id),
          sync_status: SyncStatus::Synced,
          last_modified: remote.last_modified.unwrap_or_else(Utc::now),
          payload: remote.payload,
        },
      };

      let persisted = self.store.put(record).await;
      if let Some(e) = persisted.warning {
        return Err(e.into());
      }
      report.merged += 1;
    }

    info!(merged = report.merged, skipped = report.skipped, "Pulled remote records");
    Ok(report)
  }

  async fn find_local(&self, remote: &RemoteRecord) -> Result<Option<Record>, SyncError> {
    if let Some(found) = self.store.find_by_remote_id(&remote.id).await? {
      return Ok(Some(found));
    }
    match &remote.client_ref {
      Some(local_id) => Ok(self.store.get(local_id).await?),
      None => Ok(None),
    }
  }
}
