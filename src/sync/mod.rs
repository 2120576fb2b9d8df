//! Offline-first synchronization: connectivity tracking, the drain engine and
//! the Sync API built on top of them.

mod engine;
mod network;
mod retry;
mod service;

pub use engine::{EntryOutcome, SyncEngine, SyncReport, Trigger};
pub use network::{probe, Connectivity, Edge, NetworkMonitor};
pub use retry::RetryPolicy;
pub use service::{Indicators, PullReport, SyncOptions, SyncService};
