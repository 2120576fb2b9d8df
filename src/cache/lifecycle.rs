//! Partition versioning and TTL sweeps.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::StorageError;

use super::storage::{CacheStorage, Partition, PartitionInfo, PartitionKind};
use super::worker::WorkerEvent;

/// Outcome of activating the running version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
  pub version: String,
  /// Partitions deleted because they belong to another version
  pub deleted: Vec<String>,
}

/// Outcome of one TTL sweep over the API partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  pub partition: String,
  pub evicted: usize,
  pub cutoff: DateTime<Utc>,
}

/// Keeps cache storage bounded: one version's partitions, and API entries no
/// older than the configured maximum age.
pub struct CacheLifecycleManager<S: CacheStorage> {
  storage: Arc<S>,
  version: String,
  shell: Partition,
  api: Partition,
  api_max_age: chrono::Duration,
}

impl<S: CacheStorage> CacheLifecycleManager<S> {
  pub fn new(storage: Arc<S>, namespace: &str, version: &str, api_max_age: Duration) -> Self {
    // Ages beyond chrono's range are effectively unbounded
    let api_max_age = chrono::Duration::from_std(api_max_age)
      .unwrap_or_else(|_| chrono::Duration::weeks(52 * 1000));
    Self {
      storage,
      version: version.to_string(),
      shell: Partition::new(namespace, PartitionKind::Shell, version),
      api: Partition::new(namespace, PartitionKind::Api, version),
      api_max_age,
    }
  }

  /// Register the running version's partitions and delete every other one.
  pub async fn activate(&self) -> Result<ActivationReport, StorageError> {
    self.storage.register_partition(&self.shell).await?;
    self.storage.register_partition(&self.api).await?;

    let mut deleted = Vec::new();
    for partition in self.storage.partitions().await? {
      if partition.name == self.shell.name || partition.name == self.api.name {
        continue;
      }
      let entries = self.storage.delete_partition(&partition.name).await?;
      tracing::info!(partition = %partition.name, entries, "Deleted stale cache partition");
      deleted.push(partition.name);
    }

    Ok(ActivationReport {
      version: self.version.clone(),
      deleted,
    })
  }

  pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
    self.sweep_at(Utc::now()).await
  }

  /// Evict API entries captured more than the maximum age before `now`.
  pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StorageError> {
    let cutoff = now
      .checked_sub_signed(self.api_max_age)
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let evicted = self
      .storage
      .evict_expired(&self.api.name, cutoff)
      .await?;

    if evicted > 0 {
      tracing::debug!(partition = %self.api.name, evicted, "Swept expired API responses");
    }

    Ok(SweepReport {
      partition: self.api.name.clone(),
      evicted,
      cutoff,
    })
  }

  pub async fn partitions(&self) -> Result<Vec<PartitionInfo>, StorageError> {
    self.storage.partitions().await
  }

  /// Sweep every `every`, starting one interval from now.
  pub fn spawn_sweeper(
    self: &Arc<Self>,
    every: Duration,
    events: broadcast::Sender<WorkerEvent>,
  ) -> JoinHandle<()> {
    let this = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        match this.sweep().await {
          Ok(report) => {
            // No subscribers is fine
            let _ = events.send(WorkerEvent::Swept(report));
          }
          Err(e) => tracing::warn!(error = %e, "Cache sweep failed"),
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::request::CachedResponse;
  use crate::cache::storage::{CacheEntry, SqliteStorage};
  use crate::db::Database;

  fn storage() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()))
  }

  fn manager(storage: &Arc<SqliteStorage>, version: &str) -> CacheLifecycleManager<SqliteStorage> {
    CacheLifecycleManager::new(
      Arc::clone(storage),
      "app",
      version,
      Duration::from_secs(3600),
    )
  }

  async fn put(
    storage: &SqliteStorage,
    partition: &Partition,
    key: &str,
    captured_at: DateTime<Utc>,
  ) {
    storage
      .store(CacheEntry {
        partition: partition.name.clone(),
        version: partition.version.clone(),
        request_key: key.to_string(),
        url: format!("https://app.test/{}", key),
        response: CachedResponse::new(200, "x"),
        captured_at,
      })
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_activation_keeps_only_current_version() {
    let storage = storage();
    manager(&storage, "v1").activate().await.unwrap();
    let now = Utc::now();
    put(&storage, &Partition::new("app", PartitionKind::Shell, "v1"), "a", now).await;
    put(&storage, &Partition::new("app", PartitionKind::Api, "v1"), "b", now).await;
    put(&storage, &Partition::new("app", PartitionKind::Shell, "v2"), "c", now).await;

    let report = manager(&storage, "v2").activate().await.unwrap();
    assert_eq!(report.deleted, vec!["app-api-v1".to_string(), "app-shell-v1".to_string()]);

    let names: Vec<String> = storage
      .partitions()
      .await
      .unwrap()
      .into_iter()
      .map(|p| p.name)
      .collect();
    assert_eq!(names, vec!["app-api-v2".to_string(), "app-shell-v2".to_string()]);
    assert!(storage.lookup("app-shell-v2", "c").await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_activation_is_idempotent() {
    let storage = storage();
    let manager = manager(&storage, "v1");
    manager.activate().await.unwrap();
    let again = manager.activate().await.unwrap();
    assert!(again.deleted.is_empty());
    assert_eq!(manager.partitions().await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_sweep_evicts_only_expired_api_entries() {
    let storage = storage();
    let manager = manager(&storage, "v1");
    manager.activate().await.unwrap();

    let now = Utc::now();
    let api = Partition::new("app", PartitionKind::Api, "v1");
    let shell = Partition::new("app", PartitionKind::Shell, "v1");
    put(&storage, &api, "expired", now - chrono::Duration::minutes(61)).await;
    put(&storage, &api, "fresh", now - chrono::Duration::minutes(59)).await;
    put(&storage, &shell, "asset", now - chrono::Duration::days(30)).await;

    let report = manager.sweep_at(now).await.unwrap();
    assert_eq!(report.evicted, 1);
    assert_eq!(report.partition, "app-api-v1");
    assert!(storage.lookup(&api.name, "expired").await.unwrap().is_none());
    assert!(storage.lookup(&api.name, "fresh").await.unwrap().is_some());
    assert!(storage.lookup(&shell.name, "asset").await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_sweeper_runs_on_its_own_interval() {
    let storage = storage();
    let manager = Arc::new(manager(&storage, "v1"));
    manager.activate().await.unwrap();
    let api = Partition::new("app", PartitionKind::Api, "v1");
    put(&storage, &api, "expired", Utc::now() - chrono::Duration::hours(2)).await;

    let (events, mut rx) = broadcast::channel(8);
    let handle = manager.spawn_sweeper(Duration::from_millis(50), events);

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .unwrap()
      .unwrap();
    match event {
      WorkerEvent::Swept(report) => assert_eq!(report.evicted, 1),
      other => panic!("unexpected event: {:?}", other),
    }
    handle.abort();
  }
}
