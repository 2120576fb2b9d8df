//! The cache worker: an isolated task that owns the response cache and its
//! lifecycle. The rest of the application talks to it through a
//! [`CacheHandle`] only.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::CacheError;

use super::layer::ResponseCache;
use super::lifecycle::{ActivationReport, CacheLifecycleManager, SweepReport};
use super::request::{CacheRequest, CachedResponse, RequestRules};
use super::storage::{CacheStorage, PartitionInfo};
use super::traits::{CacheResult, Fetcher};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 16;

/// Settings the worker runs with.
#[derive(Debug, Clone)]
pub struct CacheSettings {
  pub namespace: String,
  pub version: String,
  pub api_max_age: Duration,
  pub sweep_interval: Duration,
  pub rules: RequestRules,
}

/// Lifecycle notifications from the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
  Activated(ActivationReport),
  Swept(SweepReport),
}

enum Command {
  Fetch {
    request: CacheRequest,
    reply: oneshot::Sender<Result<CacheResult<CachedResponse>, CacheError>>,
  },
  Sweep {
    reply: oneshot::Sender<Result<SweepReport, CacheError>>,
  },
  Partitions {
    reply: oneshot::Sender<Result<Vec<PartitionInfo>, CacheError>>,
  },
}

/// Cloneable handle to a running cache worker.
///
/// The worker stops once every handle is dropped.
#[derive(Clone)]
pub struct CacheHandle {
  commands: mpsc::Sender<Command>,
  events: broadcast::Sender<WorkerEvent>,
}

impl CacheHandle {
  /// Send a request through the cache.
  pub async fn fetch(
    &self,
    request: CacheRequest,
  ) -> Result<CacheResult<CachedResponse>, CacheError> {
    self
      .call(|reply| Command::Fetch { request, reply })
      .await?
  }

  /// Run a TTL sweep now.
  pub async fn sweep(&self) -> Result<SweepReport, CacheError> {
    self.call(|reply| Command::Sweep { reply }).await?
  }

  pub async fn partitions(&self) -> Result<Vec<PartitionInfo>, CacheError> {
    self.call(|reply| Command::Partitions { reply }).await?
  }

  pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
    self.events.subscribe()
  }

  async fn call<T>(
    &self,
    command: impl FnOnce(oneshot::Sender<T>) -> Command,
  ) -> Result<T, CacheError> {
    let (reply, response) = oneshot::channel();
    self
      .commands
      .send(command(reply))
      .await
      .map_err(|_| CacheError::WorkerGone)?;
    response.await.map_err(|_| CacheError::WorkerGone)
  }
}

/// Owns the cache state on its own task.
pub struct CacheWorker<S: CacheStorage> {
  cache: ResponseCache<S>,
  lifecycle: Arc<CacheLifecycleManager<S>>,
  events: broadcast::Sender<WorkerEvent>,
  sweep_interval: Duration,
}

impl<S: CacheStorage> CacheWorker<S> {
  /// Start the worker. It activates the current version before serving any
  /// command.
  pub fn spawn(
    storage: S,
    fetcher: Arc<dyn Fetcher>,
    settings: CacheSettings,
  ) -> (CacheHandle, JoinHandle<()>) {
    let storage = Arc::new(storage);
    let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
    let (events, _) = broadcast::channel(EVENT_BUFFER);

    let worker = Self {
      cache: ResponseCache::new(
        Arc::clone(&storage),
        fetcher,
        settings.rules,
        &settings.namespace,
        &settings.version,
      ),
      lifecycle: Arc::new(CacheLifecycleManager::new(
        storage,
        &settings.namespace,
        &settings.version,
        settings.api_max_age,
      )),
      events: events.clone(),
      sweep_interval: settings.sweep_interval,
    };

    let handle = CacheHandle { commands, events };
    (handle, tokio::spawn(worker.run(rx)))
  }

  async fn run(self, mut rx: mpsc::Receiver<Command>) {
    match self.lifecycle.activate().await {
      Ok(report) => {
        tracing::info!(
          version = %report.version,
          deleted = report.deleted.len(),
          "Cache activated"
        );
        let _ = self.events.send(WorkerEvent::Activated(report));
      }
      Err(e) => tracing::warn!(error = %e, "Cache activation failed"),
    }

    let sweeper = self
      .lifecycle
      .spawn_sweeper(self.sweep_interval, self.events.clone());

    while let Some(command) = rx.recv().await {
      match command {
        Command::Fetch { request, reply } => {
          // Fetches run concurrently so a slow origin does not stall the worker
          let cache = self.cache.clone();
          tokio::spawn(async move {
            let _ = reply.send(cache.handle(request).await);
          });
        }
        Command::Sweep { reply } => {
          let result = self.lifecycle.sweep().await.map_err(CacheError::from);
          if let Ok(report) = &result {
            let _ = self.events.send(WorkerEvent::Swept(report.clone()));
          }
          let _ = reply.send(result);
        }
        Command::Partitions { reply } => {
          let _ = reply.send(self.lifecycle.partitions().await.map_err(CacheError::from));
        }
      }
    }

    sweeper.abort();
    tracing::debug!("Cache worker stopped");
  }
}
