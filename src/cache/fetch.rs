//! HTTP implementation of [`Fetcher`].

use async_trait::async_trait;
use reqwest::{Client, Method};

use crate::error::CacheError;

use super::request::{CacheRequest, CachedResponse};
use super::traits::Fetcher;

/// Sends cache requests over HTTP, attaching the API token when one is set.
#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
  token: Option<String>,
}

impl HttpFetcher {
  pub fn new(client: Client, token: Option<String>) -> Self {
    Self { client, token }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse, CacheError> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| CacheError::Network(format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| CacheError::Network(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| CacheError::Network(e.to_string()))?
      .to_vec();

    Ok(CachedResponse {
      status,
      headers,
      body,
    })
  }
}
