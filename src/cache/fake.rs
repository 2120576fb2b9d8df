//! In-memory fetcher for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::CacheError;

use super::request::{CacheRequest, CachedResponse};
use super::traits::Fetcher;

/// Answers from a URL table; unknown URLs get a 404.
#[derive(Default)]
pub struct FakeFetcher {
  responses: Mutex<HashMap<String, CachedResponse>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: CachedResponse) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn go_offline(&self) {
    self.offline.store(true, Ordering::SeqCst);
  }

  pub fn go_online(&self) {
    self.offline.store(false, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Fetcher for FakeFetcher {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse, CacheError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.offline.load(Ordering::SeqCst) {
      return Err(CacheError::Network("connection refused".into()));
    }
    let responses = self.responses.lock().unwrap();
    Ok(
      responses
        .get(request.url.as_str())
        .cloned()
        .unwrap_or_else(|| CachedResponse::new(404, "not found")),
    )
  }
}
