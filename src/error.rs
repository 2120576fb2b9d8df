//! Error taxonomy shared by the store, the sync engine and the response cache.

use thiserror::Error;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Local persistence failed.
///
/// Writes that hit this keep going with their in-memory value; the caller is
/// warned that durability is not guaranteed for that write.
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("database error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("failed to prepare storage location: {0}")]
  Io(#[from] std::io::Error),

  #[error("storage task failed: {0}")]
  Task(String),

  #[error("corrupt value in {column}: {reason}")]
  Corrupt { column: &'static str, reason: String },
}

/// Failure reported by the remote collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
  /// Connectivity problem or temporary server trouble; retried on a later trigger.
  #[error("transient network error: {0}")]
  Transient(String),

  /// Caller may not mutate the target resource; never retried.
  #[error("not authorized: {0}")]
  Authorization(String),

  /// Server refused the mutation for any other reason; never retried.
  #[error("rejected by server: {0}")]
  Rejected(String),
}

impl RemoteError {
  /// Whether the failed call may succeed if replayed later.
  pub fn is_retryable(&self) -> bool {
    matches!(self, RemoteError::Transient(_))
  }

  /// Map an HTTP status and response body onto the taxonomy.
  pub fn from_status(status: u16, body: &str) -> Self {
    let truncated = truncate_body(body);
    match status {
      401 | 403 => RemoteError::Authorization(format!("status {}: {}", status, truncated)),
      408 | 429 | 500..=599 => RemoteError::Transient(format!("status {}: {}", status, truncated)),
      _ => RemoteError::Rejected(format!("status {}: {}", status, truncated)),
    }
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      RemoteError::Rejected(format!("invalid response: {}", err))
    } else {
      RemoteError::Transient(err.to_string())
    }
  }
}

/// Errors surfaced by the Sync API.
///
/// Offline saves never produce one of these; the record comes back pending.
#[derive(Error, Debug)]
pub enum SyncError {
  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Remote(#[from] RemoteError),

  #[error("not authorized to modify record {local_id}: {reason}")]
  Authorization { local_id: String, reason: String },

  #[error("record {local_id} was rejected: {reason}")]
  Rejected { local_id: String, reason: String },

  #[error("invalid record: {0}")]
  Invalid(String),
}

impl SyncError {
  /// Surface a mutation the engine gave up on.
  pub fn dead_lettered(local_id: &str, err: RemoteError) -> Self {
    match err {
      RemoteError::Authorization(reason) => SyncError::Authorization {
        local_id: local_id.to_string(),
        reason,
      },
      RemoteError::Rejected(reason) | RemoteError::Transient(reason) => SyncError::Rejected {
        local_id: local_id.to_string(),
        reason,
      },
    }
  }
}

/// Errors from the response cache worker.
#[derive(Error, Debug)]
pub enum CacheError {
  #[error("network request failed: {0}")]
  Network(String),

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error("cache worker is not running")]
  WorkerGone,
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
  if body.len() <= MAX_ERROR_BODY_LENGTH {
    return body.to_string();
  }
  let mut end = MAX_ERROR_BODY_LENGTH;
  while !body.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}
