//! HTTP response cache for offline support.
//!
//! This module provides a two-partition cache that:
//! - Serves shell assets cache-first and revalidates them in the background
//! - Serves API reads network-first, falling back to the last stored copy
//! - Versions its partitions and drops every other version on activation
//! - Sweeps expired API responses on an interval independent of the TTL
//!
//! Everything runs inside a [`CacheWorker`] task reached through a
//! [`CacheHandle`].

mod fetch;
mod layer;
mod lifecycle;
mod request;
mod storage;
mod traits;
mod worker;

#[cfg(test)]
pub(crate) mod fake;

pub use fetch::HttpFetcher;
pub use layer::ResponseCache;
pub use lifecycle::{ActivationReport, CacheLifecycleManager, SweepReport};
pub use request::{
  request_key, CacheRequest, CachedResponse, RequestClass, RequestRules, CAPTURED_AT_HEADER,
};
pub use storage::{
  CacheEntry, CacheStorage, NoopStorage, Partition, PartitionInfo, PartitionKind, SqliteStorage,
};
pub use traits::{CacheResult, CacheSource, Fetcher};
pub use worker::{CacheHandle, CacheSettings, CacheWorker, WorkerEvent};
