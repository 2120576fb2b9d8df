//! Durable local state: the record store and the pending-mutation queue.

mod local;
mod queue;

use crate::error::StorageError;

pub use local::LocalStore;
pub use queue::{Completion, Drainable, FailureOutcome, MutationQueue, Operation, QueueEntry};

/// Result of a local write that keeps going when the disk refuses it.
///
/// `value` is always usable; `warning` is set when the write did not reach
/// durable storage and may be lost on restart.
#[derive(Debug)]
pub struct Persisted<T> {
  pub value: T,
  pub warning: Option<StorageError>,
}

impl<T> Persisted<T> {
  pub fn durable(value: T) -> Self {
    Self {
      value,
      warning: None,
    }
  }

  pub fn degraded(value: T, warning: StorageError) -> Self {
    Self {
      value,
      warning: Some(warning),
    }
  }

  pub fn is_durable(&self) -> bool {
    self.warning.is_none()
  }

  pub fn into_inner(self) -> T {
    self.value
  }
}
