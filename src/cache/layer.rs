//! Cache layer that decides, per request, whether the network or the cache
//! answers.

use chrono::Utc;
use std::sync::Arc;

use crate::error::CacheError;

use super::request::{CacheRequest, CachedResponse, RequestClass, RequestRules, CAPTURED_AT_HEADER};
use super::storage::{CacheEntry, CacheStorage, Partition, PartitionKind};
use super::traits::{CacheResult, Fetcher};

/// Response cache for shell assets and API reads.
///
/// Shell requests are cache-first with a background refresh. API reads are
/// network-first and fall back to the last stored copy. Everything else is
/// passed through untouched.
pub struct ResponseCache<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  rules: Arc<RequestRules>,
  shell: Partition,
  api: Partition,
}

impl<S: CacheStorage> ResponseCache<S> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    rules: RequestRules,
    namespace: &str,
    version: &str,
  ) -> Self {
    Self {
      storage,
      fetcher,
      rules: Arc::new(rules),
      shell: Partition::new(namespace, PartitionKind::Shell, version),
      api: Partition::new(namespace, PartitionKind::Api, version),
    }
  }

  /// Partitions written by this version.
  pub fn partitions(&self) -> [&Partition; 2] {
    [&self.shell, &self.api]
  }

  /// Answer a request.
  ///
  /// Only passthrough requests and API reads with nothing cached can fail;
  /// shell requests always produce a response.
  pub async fn handle(
    &self,
    request: CacheRequest,
  ) -> Result<CacheResult<CachedResponse>, CacheError> {
    match self.rules.classify(&request) {
      RequestClass::Shell => Ok(self.shell_first(request).await),
      RequestClass::Api => self.network_first(request).await,
      RequestClass::Passthrough => {
        let response = self.fetcher.fetch(&request).await?;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  async fn shell_first(&self, request: CacheRequest) -> CacheResult<CachedResponse> {
    let key = request.cache_key();

    if let Some(cached) = self.lookup(&self.shell, &key).await {
      // Serve now, refresh for next time
      let this = self.clone();
      tokio::spawn(async move {
        this.revalidate(request, key).await;
      });
      return CacheResult::from_cache(cached.response, cached.captured_at);
    }

    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        if response.is_success() {
          self.remember(&self.shell, &request, key, &response).await;
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        tracing::debug!(url = %request.url, error = %e, "Shell fetch failed with nothing cached");
        self.fallback(&request).await
      }
    }
  }

  async fn revalidate(&self, request: CacheRequest, key: String) {
    match self.fetcher.fetch(&request).await {
      Ok(response) if response.is_success() => {
        self.remember(&self.shell, &request, key, &response).await;
      }
      Ok(response) => {
        tracing::debug!(
          url = %request.url,
          status = response.status,
          "Revalidation kept cached copy"
        );
      }
      Err(e) => {
        tracing::debug!(url = %request.url, error = %e, "Revalidation failed");
      }
    }
  }

  /// The cached fallback document, or a synthetic offline response.
  async fn fallback(&self, request: &CacheRequest) -> CacheResult<CachedResponse> {
    if let Some(fallback) = self.rules.fallback_for(request) {
      if let Some(cached) = self.lookup(&self.shell, &fallback.cache_key()).await {
        return CacheResult::offline(cached.response, cached.captured_at);
      }
    }
    CacheResult::fallback(CachedResponse::offline())
  }

  async fn network_first(
    &self,
    request: CacheRequest,
  ) -> Result<CacheResult<CachedResponse>, CacheError> {
    let key = request.cache_key();

    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        if response.is_success() {
          self.remember(&self.api, &request, key, &response).await;
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.lookup(&self.api, &key).await {
        Some(cached) => {
          tracing::debug!(url = %request.url, "Serving cached API response while offline");
          Ok(CacheResult::offline(cached.response, cached.captured_at))
        }
        None => Err(e),
      },
    }
  }

  /// Cache failures degrade to a miss.
  async fn lookup(&self, partition: &Partition, key: &str) -> Option<CacheEntry> {
    match self.storage.lookup(&partition.name, key).await {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!(partition = %partition.name, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  async fn remember(
    &self,
    partition: &Partition,
    request: &CacheRequest,
    key: String,
    response: &CachedResponse,
  ) {
    let captured_at = Utc::now();
    let response = response
      .clone()
      .with_header(CAPTURED_AT_HEADER, captured_at.to_rfc3339());
    let entry = CacheEntry {
      partition: partition.name.clone(),
      version: partition.version.clone(),
      request_key: key,
      url: request.url.to_string(),
      response,
      captured_at,
    };

    if let Err(e) = self.storage.store(entry).await {
      tracing::warn!(partition = %partition.name, error = %e, "Failed to cache response");
    }
  }
}

impl<S: CacheStorage> Clone for ResponseCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      rules: Arc::clone(&self.rules),
      shell: self.shell.clone(),
      api: self.api.clone(),
    }
  }
}
