//! Offline-first record sync and response caching.
//!
//! Records are saved to a local SQLite store first and pushed to the remote
//! when connectivity allows; a mutation queue keeps every unsynced edit until
//! the remote acknowledges it. A separate cache worker answers HTTP reads
//! from versioned partitions when the network cannot.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::Config;
pub use db::Database;
pub use error::{CacheError, RemoteError, StorageError, SyncError};
pub use model::{Payload, Record, SyncStatus};
pub use store::Persisted;
pub use sync::{SyncOptions, SyncReport, SyncService};
