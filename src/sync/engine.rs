//! Drains the mutation queue against the remote.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{RemoteError, StorageError};
use crate::model::Record;
use crate::remote::RemoteApi;
use crate::store::{Completion, Drainable, FailureOutcome, MutationQueue, QueueEntry};

use super::network::{Edge, NetworkMonitor};
use super::retry::RetryPolicy;

/// What started a drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  /// Offline to online transition
  Reconnected,
  /// Periodic timer
  Periodic,
  /// Explicit call
  Manual,
}

impl Trigger {
  /// Only the timer waits for an entry's backoff to elapse; a reconnect or
  /// an explicit request tries everything that is not dead-lettered.
  fn respects_backoff(self) -> bool {
    matches!(self, Trigger::Periodic)
  }
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
  pub succeeded: usize,
  pub failed: usize,
  /// Entries left for a later cycle without a remote call (offline,
  /// backing off, or already in flight)
  pub deferred: usize,
}

/// Result of pushing a single entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
  Synced(Record),
  /// Sent, but a newer edit is still queued
  Superseded,
  Retrying,
  DeadLettered(RemoteError),
  /// Another cycle is sending this entry right now
  InFlight,
  /// Already drained or dead-lettered by another cycle
  Gone,
}

/// Drains queued mutations, one idempotent upsert per entry.
pub struct SyncEngine {
  queue: MutationQueue,
  remote: Arc<dyn RemoteApi>,
  monitor: Arc<NetworkMonitor>,
  policy: RetryPolicy,
  in_flight: Mutex<HashSet<String>>,
  active_cycles: AtomicUsize,
}

impl SyncEngine {
  pub fn new(
    queue: MutationQueue,
    remote: Arc<dyn RemoteApi>,
    monitor: Arc<NetworkMonitor>,
    policy: RetryPolicy,
  ) -> Self {
    Self {
      queue,
      remote,
      monitor,
      policy,
      in_flight: Mutex::new(HashSet::new()),
      active_cycles: AtomicUsize::new(0),
    }
  }

  /// Whether a drain cycle is running.
  pub fn is_syncing(&self) -> bool {
    self.active_cycles.load(Ordering::SeqCst) > 0
  }

  /// Run one drain cycle over a fresh snapshot of the queue.
  ///
  /// Entries are attempted in enqueue order. A failing entry is recorded and
  /// skipped; it never blocks the entries behind it.
  pub async fn drain(&self, trigger: Trigger) -> Result<SyncReport, StorageError> {
    let Drainable { ready, waiting } = self
      .queue
      .drainable(Utc::now(), trigger.respects_backoff())
      .await?;
    let _active = ActiveCycle::enter(&self.active_cycles);
    let mut report = SyncReport {
      deferred: waiting,
      ..SyncReport::default()
    };

    for entry in ready {
      if !self.monitor.is_online() {
        report.deferred += 1;
        continue;
      }

      match self.push(&entry).await {
        EntryOutcome::Synced(_) | EntryOutcome::Superseded => report.succeeded += 1,
        EntryOutcome::Retrying | EntryOutcome::DeadLettered(_) => report.failed += 1,
        EntryOutcome::InFlight => report.deferred += 1,
        EntryOutcome::Gone => {}
      }
    }

    if report != SyncReport::default() {
      info!(
        ?trigger,
        succeeded = report.succeeded,
        failed = report.failed,
        deferred = report.deferred,
        "Drain cycle finished"
      );
    }
    Ok(report)
  }

  /// Send one entry and reconcile the result.
  pub async fn push(&self, entry: &QueueEntry) -> EntryOutcome {
    let Some(_claim) = Claim::acquire(&self.in_flight, &entry.local_id) else {
      debug!(local_id = %entry.local_id, "Entry already in flight");
      return EntryOutcome::InFlight;
    };

    // Another cycle may have finished or replaced this entry since the snapshot
    let entry = match self.queue.get(&entry.local_id).await {
      Ok(Some(current)) if !current.dead_letter => current,
      Ok(_) => return EntryOutcome::Gone,
      Err(e) => {
        warn!(local_id = %entry.local_id, error = %e, "Failed to reload queue entry");
        return EntryOutcome::Retrying;
      }
    };
    let entry = &entry;

    match self.remote.upsert(&entry.mutation()).await {
      Ok(remote) => match self.queue.complete(entry, remote).await {
        Ok(Completion::Synced(record)) => EntryOutcome::Synced(record),
        Ok(Completion::Superseded) | Ok(Completion::Discarded) => EntryOutcome::Superseded,
        Err(e) => {
          // The upsert is idempotent, so the next cycle can safely replay it
          warn!(local_id = %entry.local_id, error = %e, "Failed to record sync result");
          EntryOutcome::Retrying
        }
      },
      Err(err) => {
        warn!(local_id = %entry.local_id, error = %err, "Upsert failed");
        match self
          .queue
          .record_failure(entry, &err, &self.policy, Utc::now())
          .await
        {
          Ok(FailureOutcome::DeadLettered) => EntryOutcome::DeadLettered(err),
          Ok(_) => EntryOutcome::Retrying,
          Err(e) => {
            warn!(local_id = %entry.local_id, error = %e, "Failed to record upsert failure");
            if err.is_retryable() {
              EntryOutcome::Retrying
            } else {
              EntryOutcome::DeadLettered(err)
            }
          }
        }
      }
    }
  }

  /// Drain on every reconnect edge and, if set, every `period`.
  ///
  /// The task ends when the edge channel closes or the handle is aborted.
  pub fn spawn_triggers(
    self: &Arc<Self>,
    mut edges: broadcast::Receiver<Edge>,
    period: Option<Duration>,
  ) -> JoinHandle<()> {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = period.map(|p| {
        let mut ticker = tokio::time::interval_at(Instant::now() + p, p);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
      });

      loop {
        let trigger = tokio::select! {
          edge = edges.recv() => match edge {
            Ok(Edge::CameOnline) => Trigger::Reconnected,
            Ok(Edge::WentOffline) => continue,
            // Missed edges still mean we may have come back online
            Err(RecvError::Lagged(_)) => Trigger::Reconnected,
            Err(RecvError::Closed) => break,
          },
          _ = next_tick(&mut ticker) => Trigger::Periodic,
        };

        if let Err(e) = engine.drain(trigger).await {
          warn!(?trigger, error = %e, "Drain cycle failed to read the queue");
        }
      }
    })
  }
}

async fn next_tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(ticker) => {
      ticker.tick().await;
    }
    None => std::future::pending::<()>().await,
  }
}

/// Counts a running cycle for the syncing indicator.
struct ActiveCycle<'a>(&'a AtomicUsize);

impl<'a> ActiveCycle<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for ActiveCycle<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Marks a record as being sent; released on drop.
struct Claim<'a> {
  set: &'a Mutex<HashSet<String>>,
  local_id: String,
}

impl<'a> Claim<'a> {
  fn acquire(set: &'a Mutex<HashSet<String>>, local_id: &str) -> Option<Self> {
    let mut guard = set.lock().unwrap_or_else(PoisonError::into_inner);
    if !guard.insert(local_id.to_string()) {
      return None;
    }
    Some(Self {
      set,
      local_id: local_id.to_string(),
    })
  }
}

impl Drop for Claim<'_> {
  fn drop(&mut self) {
    let mut guard = self.set.lock().unwrap_or_else(PoisonError::into_inner);
    guard.remove(&self.local_id);
  }
}
