use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Response};
use tracing::debug;
use url::Url;

use crate::config::RemoteConfig;
use crate::error::RemoteError;

use super::{Mutation, RemoteApi, RemoteRecord};

/// Remote API client over HTTP.
/// Clone is cheap - reqwest::Client shares its connection pool.
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, token: Option<String>) -> Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    // Url::join replaces the last segment unless the base ends with a slash
    let mut base = config.url.clone();
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    Ok(Self {
      client,
      base,
      token,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(path)
      .map_err(|e| RemoteError::Rejected(format!("invalid endpoint {}: {}", path, e)))
  }

  fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn check(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status.as_u16(), &body))
  }
}

#[async_trait]
impl RemoteApi for HttpRemote {
  async fn upsert(&self, mutation: &Mutation) -> Result<RemoteRecord, RemoteError> {
    let url = self.endpoint("records/upsert")?;
    debug!(identity = mutation.identity(), "Sending upsert");

    let response = self
      .authorize(self.client.post(url))
      .json(mutation)
      .send()
      .await?;
    let response = Self::check(response).await?;

    Ok(response.json().await?)
  }

  async fn fetch(&self, scopes: &[String]) -> Result<Vec<RemoteRecord>, RemoteError> {
    let mut url = self.endpoint("records")?;
    {
      let mut query = url.query_pairs_mut();
      for scope in scopes {
        query.append_pair("scope", scope);
      }
    }

    let response = self.authorize(self.client.get(url)).send().await?;
    let response = Self::check(response).await?;

    Ok(response.json().await?)
  }
}
