//! Core traits and types for the response cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CacheError;

use super::request::{CacheRequest, CachedResponse};

/// Network side of the cache: performs the real request.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Send the request. Any HTTP response is `Ok`; only transport failures
  /// are errors.
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse, CacheError>;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Served from cache while a refresh runs in the background.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Neither network nor cache could answer; `data` is the designated fallback.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the network
  Network,
  /// Cached copy served first, refreshed in the background
  Cache,
  /// Network unavailable, serving the last cached copy
  Offline,
  /// Network unavailable and nothing cached
  Fallback,
}
