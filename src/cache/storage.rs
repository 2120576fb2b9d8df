//! Cache storage trait and SQLite implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::{format_ts, parse_ts, Database};
use crate::error::StorageError;

use super::request::CachedResponse;

/// What a partition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
  Shell,
  Api,
}

impl PartitionKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      PartitionKind::Shell => "shell",
      PartitionKind::Api => "api",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "shell" => Some(PartitionKind::Shell),
      "api" => Some(PartitionKind::Api),
      _ => None,
    }
  }
}

/// A named, versioned group of cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
  pub name: String,
  pub kind: PartitionKind,
  pub version: String,
}

impl Partition {
  /// Partition names are `{namespace}-{kind}-{version}`.
  pub fn new(namespace: &str, kind: PartitionKind, version: &str) -> Self {
    Self {
      name: format!("{}-{}-{}", namespace, kind.as_str(), version),
      kind,
      version: version.to_string(),
    }
  }
}

/// A partition as found in storage, with its entry count.
///
/// Entries written under a partition that was never registered show up with
/// `kind: None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
  pub name: String,
  pub kind: Option<PartitionKind>,
  pub version: Option<String>,
  pub entries: usize,
}

/// A stored response.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub partition: String,
  pub version: String,
  pub request_key: String,
  pub url: String,
  pub response: CachedResponse,
  pub captured_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
#[async_trait]
pub trait CacheStorage: Send + Sync + 'static {
  /// Get the entry stored for a request key.
  async fn lookup(
    &self,
    partition: &str,
    request_key: &str,
  ) -> Result<Option<CacheEntry>, StorageError>;

  /// Store an entry, replacing any previous one for the same key.
  async fn store(&self, entry: CacheEntry) -> Result<(), StorageError>;

  /// Record a partition as belonging to the running version.
  async fn register_partition(&self, partition: &Partition) -> Result<(), StorageError>;

  /// All partitions, including unregistered ones that still hold entries.
  async fn partitions(&self) -> Result<Vec<PartitionInfo>, StorageError>;

  /// Delete a partition and its entries. Returns the number of entries removed.
  async fn delete_partition(&self, name: &str) -> Result<usize, StorageError>;

  /// Delete entries captured at or before `cutoff`.
  async fn evict_expired(
    &self,
    partition: &str,
    cutoff: DateTime<Utc>,
  ) -> Result<usize, StorageError>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

#[async_trait]
impl CacheStorage for NoopStorage {
  async fn lookup(&self, _: &str, _: &str) -> Result<Option<CacheEntry>, StorageError> {
    Ok(None) // Always miss
  }

  async fn store(&self, _entry: CacheEntry) -> Result<(), StorageError> {
    Ok(()) // Discard
  }

  async fn register_partition(&self, _partition: &Partition) -> Result<(), StorageError> {
    Ok(())
  }

  async fn partitions(&self) -> Result<Vec<PartitionInfo>, StorageError> {
    Ok(Vec::new())
  }

  async fn delete_partition(&self, _name: &str) -> Result<usize, StorageError> {
    Ok(0)
  }

  async fn evict_expired(
    &self,
    _partition: &str,
    _cutoff: DateTime<Utc>,
  ) -> Result<usize, StorageError> {
    Ok(0)
  }
}

/// SQLite-based cache storage, sharing the application database.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

#[async_trait]
impl CacheStorage for SqliteStorage {
  async fn lookup(
    &self,
    partition: &str,
    request_key: &str,
  ) -> Result<Option<CacheEntry>, StorageError> {
    let partition = partition.to_string();
    let request_key = request_key.to_string();
    self
      .db
      .transact(move |tx| {
        let row = tx
          .query_row(
            "SELECT version, url, status, headers, body, captured_at FROM cache_entries
             WHERE partition = ?1 AND request_key = ?2",
            params![partition, request_key],
            |row| {
              Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u16>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, String>(5)?,
              ))
            },
          )
          .optional()?;

        let Some((version, url, status, headers, body, captured_at)) = row else {
          return Ok(None);
        };

        Ok(Some(CacheEntry {
          partition,
          version,
          request_key,
          url,
          response: CachedResponse {
            status,
            headers: serde_json::from_str(&headers)?,
            body,
          },
          captured_at: parse_ts("captured_at", &captured_at)?,
        }))
      })
      .await
  }

  async fn store(&self, entry: CacheEntry) -> Result<(), StorageError> {
    self
      .db
      .transact(move |tx| {
        let headers = serde_json::to_string(&entry.response.headers)?;
        tx.execute(
          "INSERT OR REPLACE INTO cache_entries
             (partition, request_key, version, url, status, headers, body, captured_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          params![
            entry.partition,
            entry.request_key,
            entry.version,
            entry.url,
            entry.response.status,
            headers,
            entry.response.body,
            format_ts(entry.captured_at),
          ],
        )?;
        Ok(())
      })
      .await
  }

  async fn register_partition(&self, partition: &Partition) -> Result<(), StorageError> {
    let partition = partition.clone();
    self
      .db
      .transact(move |tx| {
        tx.execute(
          "INSERT OR IGNORE INTO cache_partitions (name, kind, version, created_at)
           VALUES (?1, ?2, ?3, ?4)",
          params![
            partition.name,
            partition.kind.as_str(),
            partition.version,
            format_ts(Utc::now()),
          ],
        )?;
        Ok(())
      })
      .await
  }

  async fn partitions(&self) -> Result<Vec<PartitionInfo>, StorageError> {
    self
      .db
      .transact(|tx| {
        let mut stmt = tx.prepare(
          "SELECT p.name, p.kind, p.version,
                  (SELECT COUNT(*) FROM cache_entries e WHERE e.partition = p.name)
           FROM cache_partitions p
           UNION ALL
           SELECT e.partition, NULL, MAX(e.version), COUNT(*)
           FROM cache_entries e
           WHERE e.partition NOT IN (SELECT name FROM cache_partitions)
           GROUP BY e.partition
           ORDER BY 1",
        )?;

        let rows = stmt.query_map([], |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, i64>(3)?,
          ))
        })?;

        let mut partitions = Vec::new();
        for row in rows {
          let (name, kind, version, entries) = row?;
          partitions.push(PartitionInfo {
            name,
            kind: kind.as_deref().and_then(PartitionKind::parse),
            version,
            entries: entries.max(0) as usize,
          });
        }
        Ok(partitions)
      })
      .await
  }

  async fn delete_partition(&self, name: &str) -> Result<usize, StorageError> {
    let name = name.to_string();
    self
      .db
      .transact(move |tx| {
        let removed = tx.execute(
          "DELETE FROM cache_entries WHERE partition = ?1",
          params![name],
        )?;
        tx.execute("DELETE FROM cache_partitions WHERE name = ?1", params![name])?;
        Ok(removed)
      })
      .await
  }

  async fn evict_expired(
    &self,
    partition: &str,
    cutoff: DateTime<Utc>,
  ) -> Result<usize, StorageError> {
    let partition = partition.to_string();
    self
      .db
      .transact(move |tx| {
        let removed = tx.execute(
          "DELETE FROM cache_entries WHERE partition = ?1 AND captured_at <= ?2",
          params![partition, format_ts(cutoff)],
        )?;
        Ok(removed)
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn entry(partition: &Partition, key: &str, captured_at: DateTime<Utc>) -> CacheEntry {
    CacheEntry {
      partition: partition.name.clone(),
      version: partition.version.clone(),
      request_key: key.to_string(),
      url: format!("https://app.test/{}", key),
      response: CachedResponse::new(200, key.as_bytes().to_vec())
        .with_header("content-type", "application/json"),
      captured_at,
    }
  }

  #[test]
  fn test_partition_names() {
    let p = Partition::new("fieldsync", PartitionKind::Api, "v2");
    assert_eq!(p.name, "fieldsync-api-v2");
  }

  #[tokio::test]
  async fn test_store_and_lookup() {
    let storage = SqliteStorage::new(Database::open_in_memory().unwrap());
    let shell = Partition::new("app", PartitionKind::Shell, "v1");
    let now = Utc::now();

    storage.store(entry(&shell, "k1", now)).await.unwrap();
    let found = storage.lookup(&shell.name, "k1").await.unwrap().unwrap();
    assert_eq!(found.response.body, b"k1".to_vec());
    assert_eq!(found.response.header("Content-Type"), Some("application/json"));
    assert_eq!(found.captured_at.timestamp_micros(), now.timestamp_micros());

    assert!(storage.lookup(&shell.name, "missing").await.unwrap().is_none());
    assert!(storage.lookup("app-shell-v2", "k1").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_partitions_include_unregistered() {
    let storage = SqliteStorage::new(Database::open_in_memory().unwrap());
    let v1 = Partition::new("app", PartitionKind::Api, "v1");
    let v2 = Partition::new("app", PartitionKind::Api, "v2");
    storage.register_partition(&v2).await.unwrap();
    storage.register_partition(&v2).await.unwrap();
    storage.store(entry(&v1, "a", Utc::now())).await.unwrap();
    storage.store(entry(&v2, "b", Utc::now())).await.unwrap();
    storage.store(entry(&v2, "c", Utc::now())).await.unwrap();

    let partitions = storage.partitions().await.unwrap();
    assert_eq!(
      partitions,
      vec![
        PartitionInfo {
          name: "app-api-v1".into(),
          kind: None,
          version: Some("v1".into()),
          entries: 1,
        },
        PartitionInfo {
          name: "app-api-v2".into(),
          kind: Some(PartitionKind::Api),
          version: Some("v2".into()),
          entries: 2,
        },
      ]
    );

    assert_eq!(storage.delete_partition("app-api-v1").await.unwrap(), 1);
    assert_eq!(storage.partitions().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_evict_is_inclusive_and_scoped() {
    let storage = SqliteStorage::new(Database::open_in_memory().unwrap());
    let api = Partition::new("app", PartitionKind::Api, "v1");
    let shell = Partition::new("app", PartitionKind::Shell, "v1");
    let now = Utc::now();

    storage.store(entry(&api, "old", now - Duration::hours(2))).await.unwrap();
    storage.store(entry(&api, "edge", now - Duration::hours(1))).await.unwrap();
    storage.store(entry(&api, "recent", now)).await.unwrap();
    storage.store(entry(&shell, "old", now - Duration::hours(2))).await.unwrap();

    let evicted = storage
      .evict_expired(&api.name, now - Duration::hours(1))
      .await
      .unwrap();
    assert_eq!(evicted, 2);
    assert!(storage.lookup(&api.name, "edge").await.unwrap().is_none());
    assert!(storage.lookup(&api.name, "recent").await.unwrap().is_some());
    assert!(storage.lookup(&shell.name, "old").await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    let api = Partition::new("app", PartitionKind::Api, "v1");
    storage.store(entry(&api, "k", Utc::now())).await.unwrap();
    assert!(storage.lookup(&api.name, "k").await.unwrap().is_none());
  }
}
