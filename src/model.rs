//! Domain records kept on the device and reconciled with the remote.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Keys owned by the record envelope or the wire format.
/// Payload extension fields may not use them.
const RESERVED_KEYS: &[&str] = &["id", "localId", "clientRef", "syncStatus", "lastModified"];

/// Whether a record's latest edit has reached the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  Synced,
  Pending,
}

impl SyncStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      SyncStatus::Synced => "synced",
      SyncStatus::Pending => "pending",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "synced" => Some(SyncStatus::Synced),
      "pending" => Some(SyncStatus::Pending),
      _ => None,
    }
  }
}

/// Domain fields of a record.
///
/// The declared fields are typed; anything else the remote or a newer client
/// sends is kept in `extra` and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  /// Resource (site, building, asset) the record is scoped to
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resource_id: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Payload {
  pub fn titled(title: impl Into<String>) -> Self {
    Self {
      title: Some(title.into()),
      ..Self::default()
    }
  }

  /// Set an extension field.
  pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
    self.extra.insert(key.into(), value);
    self
  }

  /// Structural validation run before a save is accepted.
  pub fn validate(&self) -> Result<(), String> {
    if matches!(&self.title, Some(t) if t.trim().is_empty()) {
      return Err("title must not be blank".to_string());
    }
    if matches!(&self.resource_id, Some(r) if r.trim().is_empty()) {
      return Err("resourceId must not be blank".to_string());
    }
    if let Some(key) = self
      .extra
      .keys()
      .find(|k| RESERVED_KEYS.contains(&k.as_str()))
    {
      return Err(format!("field '{}' is reserved", key));
    }
    Ok(())
  }

  /// Overlay fields returned by the server onto this payload.
  pub fn merge_from(&mut self, server: Payload) {
    if server.title.is_some() {
      self.title = server.title;
    }
    if server.description.is_some() {
      self.description = server.description;
    }
    if server.status.is_some() {
      self.status = server.status;
    }
    if server.resource_id.is_some() {
      self.resource_id = server.resource_id;
    }
    self.extra.extend(server.extra);
  }
}

/// A domain entity (e.g. a defect report) held in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
  /// Client-generated key, stable for the record's lifetime
  pub local_id: String,
  /// Server-assigned identity, absent until the first successful write
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub sync_status: SyncStatus,
  pub last_modified: DateTime<Utc>,
  pub payload: Payload,
}

impl Record {
  /// A new record created by a user action.
  pub fn new(payload: Payload) -> Self {
    Self::with_local_id(Uuid::new_v4().to_string(), payload)
  }

  pub fn with_local_id(local_id: impl Into<String>, payload: Payload) -> Self {
    Self {
      local_id: local_id.into(),
      id: None,
      sync_status: SyncStatus::Pending,
      last_modified: Utc::now(),
      payload,
    }
  }

  pub fn is_pending(&self) -> bool {
    self.sync_status == SyncStatus::Pending
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_unknown_fields_round_trip() {
    let raw = json!({
      "title": "leak",
      "resourceId": "site-7",
      "severity": 3,
      "photos": ["a.jpg"]
    });
    let payload: Payload = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(payload.title.as_deref(), Some("leak"));
    assert_eq!(payload.resource_id.as_deref(), Some("site-7"));
    assert_eq!(payload.extra.get("severity"), Some(&json!(3)));
    assert_eq!(serde_json::to_value(&payload).unwrap(), raw);
  }

  #[test]
  fn test_validate_rejects_blank_and_reserved() {
    assert!(Payload::titled("leak").validate().is_ok());
    assert!(Payload::titled("  ").validate().is_err());
    assert!(Payload::titled("leak")
      .with_field("clientRef", json!("x"))
      .validate()
      .is_err());
  }

  #[test]
  fn test_merge_from_server_keeps_local_fields() {
    let mut local = Payload::titled("leak");
    local.description = Some("under sink".into());

    let mut server = Payload::titled("Leak");
    server.extra.insert("ticket".into(), json!("T-9"));
    local.merge_from(server);

    assert_eq!(local.title.as_deref(), Some("Leak"));
    assert_eq!(local.description.as_deref(), Some("under sink"));
    assert_eq!(local.extra.get("ticket"), Some(&json!("T-9")));
  }

  #[test]
  fn test_new_record_is_pending_without_id() {
    let record = Record::new(Payload::titled("leak"));
    assert!(record.is_pending());
    assert!(record.id.is_none());
    assert!(!record.local_id.is_empty());
  }
}
