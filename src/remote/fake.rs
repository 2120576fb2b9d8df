//! In-memory remote used by tests.
//!
//! Behaves like the real backend: upserts are deduplicated on identity and
//! failures can be injected per client reference or for the next call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::RemoteError;

use super::{Mutation, RemoteApi, RemoteRecord};

#[derive(Default)]
pub struct FakeRemote {
  records: Mutex<HashMap<String, RemoteRecord>>,
  next_id: AtomicUsize,
  upserts: AtomicUsize,
  fail_next: Mutex<VecDeque<RemoteError>>,
  fail_for: Mutex<HashMap<String, RemoteError>>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of upsert calls received, failed ones included.
  pub fn upsert_calls(&self) -> usize {
    self.upserts.load(Ordering::SeqCst)
  }

  /// Records currently held by the remote.
  pub fn records(&self) -> Vec<RemoteRecord> {
    self.records.lock().unwrap().values().cloned().collect()
  }

  /// Fail the next upsert with `err`.
  pub fn fail_next(&self, err: RemoteError) {
    self.fail_next.lock().unwrap().push_back(err);
  }

  /// Fail every upsert for `client_ref` until [`FakeRemote::heal`] is called.
  pub fn fail_for(&self, client_ref: &str, err: RemoteError) {
    self
      .fail_for
      .lock()
      .unwrap()
      .insert(client_ref.to_string(), err);
  }

  pub fn heal(&self, client_ref: &str) {
    self.fail_for.lock().unwrap().remove(client_ref);
  }

  /// Seed a record as if another client had written it.
  pub fn seed(&self, record: RemoteRecord) {
    self
      .records
      .lock()
      .unwrap()
      .insert(record.id.clone(), record);
  }
}

#[async_trait]
impl RemoteApi for FakeRemote {
  async fn upsert(&self, mutation: &Mutation) -> Result<RemoteRecord, RemoteError> {
    self.upserts.fetch_add(1, Ordering::SeqCst);

    if let Some(err) = self.fail_next.lock().unwrap().pop_front() {
      return Err(err);
    }
    if let Some(err) = self.fail_for.lock().unwrap().get(&mutation.client_ref) {
      return Err(err.clone());
    }

    let mut records = self.records.lock().unwrap();
    let existing_id = match &mutation.id {
      Some(id) => Some(id.clone()),
      None => records
        .values()
        .find(|r| r.client_ref.as_deref() == Some(mutation.client_ref.as_str()))
        .map(|r| r.id.clone()),
    };
    let id = existing_id
      .unwrap_or_else(|| format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1));

    let record = RemoteRecord {
      id: id.clone(),
      client_ref: Some(mutation.client_ref.clone()),
      last_modified: Some(Utc::now()),
      payload: mutation.payload.clone(),
    };
    records.insert(id, record.clone());
    Ok(record)
  }

  async fn fetch(&self, scopes: &[String]) -> Result<Vec<RemoteRecord>, RemoteError> {
    let records = self.records.lock().unwrap();
    Ok(
      records
        .values()
        .filter(|r| {
          r.payload
            .resource_id
            .as_ref()
            .is_some_and(|scope| scopes.contains(scope))
        })
        .cloned()
        .collect(),
    )
  }
}
