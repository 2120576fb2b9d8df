//! Contract of the remote collaborator that owns the authoritative records.

mod client;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::model::Payload;

pub use client::HttpRemote;

/// One idempotent upsert sent to the remote.
///
/// The remote deduplicates on `id` when present and on `client_ref`
/// otherwise, so replaying the same mutation never creates a second record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub client_ref: String,
  pub last_modified: DateTime<Utc>,
  #[serde(flatten)]
  pub payload: Payload,
}

impl Mutation {
  /// The deduplication key the remote will use.
  pub fn identity(&self) -> &str {
    self.id.as_deref().unwrap_or(&self.client_ref)
  }
}

/// Canonical record as returned by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client_ref: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_modified: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub payload: Payload,
}

/// Authenticated backend exposing filtered reads and idempotent upserts.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// Insert or update one record, keyed by its identity.
  async fn upsert(&self, mutation: &Mutation) -> Result<RemoteRecord, RemoteError>;

  /// Fetch the records belonging to the given resource scopes.
  async fn fetch(&self, scopes: &[String]) -> Result<Vec<RemoteRecord>, RemoteError>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_mutation_wire_format_is_flat() {
    let mutation = Mutation {
      id: None,
      client_ref: "L1".into(),
      last_modified: "2026-10-19T08:00:00Z".parse().unwrap(),
      payload: Payload::titled("leak").with_field("severity", json!(2)),
    };
    let value = serde_json::to_value(&mutation).unwrap();
    assert_eq!(value["clientRef"], "L1");
    assert_eq!(value["title"], "leak");
    assert_eq!(value["severity"], 2);
    assert!(value.get("id").is_none());
    assert_eq!(mutation.identity(), "L1");
  }

  #[test]
  fn test_remote_record_collects_unknown_fields() {
    let record: RemoteRecord = serde_json::from_value(json!({
      "id": "srv-1",
      "clientRef": "L1",
      "title": "leak",
      "assignee": "kim"
    }))
    .unwrap();
    assert_eq!(record.id, "srv-1");
    assert_eq!(record.client_ref.as_deref(), Some("L1"));
    assert_eq!(record.payload.extra.get("assignee"), Some(&json!("kim")));
  }
}
