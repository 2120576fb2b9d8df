//! Requests and responses as seen by the cache, request keys and
//! classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::CacheConfig;

/// Header added to stored copies, holding the capture time (RFC 3339).
pub const CAPTURED_AT_HEADER: &str = "x-captured-at";

/// An outgoing request passing through the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl CacheRequest {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Only reads are ever answered from the cache.
  pub fn is_read(&self) -> bool {
    self.method == "GET"
  }

  pub fn cache_key(&self) -> String {
    request_key(&self.method, &self.url)
  }
}

/// A response body with its status and headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Synthetic response for when neither network nor cache can answer.
  pub fn offline() -> Self {
    Self::new(503, "offline").with_header("content-type", "text/plain; charset=utf-8")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Set a header, replacing any existing value.
  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.into()));
    self
  }

  /// Capture time of a stored copy.
  pub fn captured_at(&self) -> Option<DateTime<Utc>> {
    let raw = self.header(CAPTURED_AT_HEADER)?;
    DateTime::parse_from_rfc3339(raw)
      .ok()
      .map(|dt| dt.with_timezone(&Utc))
  }
}

/// Caching strategy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Static bundle and assets: cache-first, revalidated in the background
  Shell,
  /// Domain data reads: network-first, cached copy as offline fallback
  Api,
  /// Writes and anything unrecognised go straight to the network
  Passthrough,
}

/// Path-based rules deciding which strategy a request gets.
#[derive(Debug, Clone)]
pub struct RequestRules {
  pub api_prefixes: Vec<String>,
  pub shell_paths: Vec<String>,
  pub shell_prefixes: Vec<String>,
  pub shell_extensions: Vec<String>,
  /// Shell path served when a shell request cannot be answered
  pub fallback_path: String,
}

impl RequestRules {
  pub fn classify(&self, request: &CacheRequest) -> RequestClass {
    if !request.is_read() {
      return RequestClass::Passthrough;
    }

    let path = request.url.path();
    if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return RequestClass::Api;
    }

    let extension = path
      .rsplit('/')
      .next()
      .and_then(|segment| segment.rsplit_once('.'))
      .map(|(_, ext)| ext.to_ascii_lowercase());
    let is_shell = self.shell_paths.iter().any(|p| p == path)
      || self.shell_prefixes.iter().any(|p| path.starts_with(p.as_str()))
      || extension.is_some_and(|ext| self.shell_extensions.contains(&ext));

    if is_shell {
      RequestClass::Shell
    } else {
      RequestClass::Passthrough
    }
  }

  /// The fallback document on the same origin as `request`.
  pub fn fallback_for(&self, request: &CacheRequest) -> Option<CacheRequest> {
    request.url.join(&self.fallback_path).ok().map(CacheRequest::get)
  }
}

impl From<&CacheConfig> for RequestRules {
  fn from(config: &CacheConfig) -> Self {
    Self {
      api_prefixes: config.api_prefixes.clone(),
      shell_paths: config.shell_paths.clone(),
      shell_prefixes: config.shell_prefixes.clone(),
      shell_extensions: config
        .shell_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect(),
      fallback_path: config.fallback_path.clone(),
    }
  }
}

/// Stable, fixed-length key for a request.
///
/// Fragments are dropped and query parameters sorted, so equivalent URLs
/// share one entry.
pub fn request_key(method: &str, url: &Url) -> String {
  let input = format!("{}:{}", method.to_uppercase(), normalize_url(url));

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);

  let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
  if pairs.is_empty() {
    url.set_query(None);
  } else {
    pairs.sort();
    url.query_pairs_mut().clear().extend_pairs(pairs.iter());
  }
  url.to_string()
}
