use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};
use url::Url;

use fieldsync::cache::{
  CacheHandle, CacheRequest, CacheWorker, HttpFetcher, NoopStorage, SqliteStorage, WorkerEvent,
};
use fieldsync::remote::HttpRemote;
use fieldsync::sync::{probe, NetworkMonitor};
use fieldsync::{Config, Database, Payload, Record, SyncService};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first record sync and response caching")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the remote as unreachable without probing it
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create or edit a record
  Save {
    /// Edit the record with this local id instead of creating one
    #[arg(long)]
    local_id: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    resource: Option<String>,
    /// Extra field as key=value (value parsed as JSON when possible)
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, serde_json::Value)>,
  },
  /// List local records
  List,
  /// Show the number of unsynced records
  Pending,
  /// Drain the mutation queue now
  Sync,
  /// Merge remote records for the configured scopes
  Pull,
  /// Delete all local records and queued mutations
  Clear,
  /// List mutations that were given up on
  DeadLetters,
  /// Requeue dead-lettered mutations
  Retry,
  /// Send a request through the response cache
  Fetch {
    url: Url,
    #[arg(long, default_value = "GET")]
    method: String,
  },
  /// Evict expired API responses now
  Sweep,
  /// List cache partitions
  Partitions,
  /// Keep probing, syncing and sweeping until interrupted
  Watch,
}

fn parse_field(raw: &str) -> Result<(String, serde_json::Value), String> {
  let (key, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
  let value =
    serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.into()));
  Ok((key.to_string(), value))
}

/// Log to a daily file in the data directory, and warnings to stderr.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=fieldsync=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let appender = tracing_appender::rolling::daily(log_dir, "fieldsync.log");
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN),
    )
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let db_path = config.database_path()?;

  let log_dir = db_path
    .parent()
    .map(|p| p.join("logs"))
    .ok_or_else(|| eyre!("Invalid database path: {}", db_path.display()))?;
  std::fs::create_dir_all(&log_dir)?;
  let _guard = init_tracing(&log_dir);
  info!(db = %db_path.display(), "fieldsync starting");

  let token = Config::api_token();
  let client = reqwest::Client::builder()
    .timeout(Duration::from_secs(config.remote.timeout_secs))
    .build()
    .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

  let initial = if args.offline {
    fieldsync::sync::Connectivity::Offline
  } else {
    probe(&client, &config.probe_url()).await
  };
  let monitor = Arc::new(NetworkMonitor::new(initial));

  let db = Database::open(&db_path)?;
  let remote = Arc::new(HttpRemote::new(&config.remote, token.clone())?);
  let service = SyncService::init(db, remote, Arc::clone(&monitor), config.sync_options());

  let context = Context {
    config: &config,
    db_path: &db_path,
    client,
    token,
  };
  let result = run(&service, args.command, context).await;
  service.dispose().await;
  result
}

/// What commands need besides the sync service.
struct Context<'a> {
  config: &'a Config,
  db_path: &'a Path,
  client: reqwest::Client,
  token: Option<String>,
}

impl Context<'_> {
  fn start_cache(&self) -> Result<(CacheHandle, JoinHandle<()>)> {
    let fetcher = Arc::new(HttpFetcher::new(self.client.clone(), self.token.clone()));
    let settings = self.config.cache.settings();

    if !self.config.cache.enabled {
      return Ok(CacheWorker::spawn(NoopStorage, fetcher, settings));
    }

    // The worker gets its own connection to the shared file
    let db = Database::open(self.db_path)?;
    Ok(CacheWorker::spawn(SqliteStorage::new(db), fetcher, settings))
  }
}

async fn run(service: &SyncService, command: Command, context: Context<'_>) -> Result<()> {
  match command {
    Command::Save {
      local_id,
      title,
      description,
      status,
      resource,
      fields,
    } => {
      let mut record = match &local_id {
        Some(id) => service
          .get(id)
          .await?
          .unwrap_or_else(|| Record::with_local_id(id.clone(), Payload::default())),
        None => Record::new(Payload::default()),
      };
      let payload = &mut record.payload;
      payload.title = title.or(payload.title.take());
      payload.description = description.or(payload.description.take());
      payload.status = status.or(payload.status.take());
      payload.resource_id = resource.or(payload.resource_id.take());
      payload.extra.extend(fields);

      let saved = service.save(record).await?;
      if let Some(warning) = &saved.warning {
        warn!(error = %warning, "Record kept in memory only");
      }
      print_json(&saved.value)?;
    }
    Command::List => print_json(&service.get_all().await?)?,
    Command::Pending => println!("{}", service.pending_count().await?),
    Command::Sync => print_json(&service.sync_now().await?)?,
    Command::Pull => print_json(&service.pull().await?)?,
    Command::Clear => {
      service.clear_all().await?;
      info!("Local data cleared");
    }
    Command::DeadLetters => print_json(&service.dead_letters().await?)?,
    Command::Retry => println!("{}", service.retry_dead_letters().await?),
    Command::Fetch { url, method } => {
      let (cache, _worker) = context.start_cache()?;
      let result = cache.fetch(CacheRequest::new(&method, url)).await?;
      eprintln!("{} ({:?})", result.data.status, result.source);
      println!("{}", String::from_utf8_lossy(&result.data.body));
    }
    Command::Sweep => {
      let (cache, _worker) = context.start_cache()?;
      print_json(&cache.sweep().await?)?;
    }
    Command::Partitions => {
      let (cache, _worker) = context.start_cache()?;
      print_json(&cache.partitions().await?)?;
    }
    Command::Watch => watch(service, context).await?,
  }
  Ok(())
}

/// Run probes, periodic drains and cache sweeps until Ctrl-C.
async fn watch(service: &SyncService, context: Context<'_>) -> Result<()> {
  service.attach(service.monitor().spawn_probe(
    context.client.clone(),
    context.config.probe_url(),
    context.config.probe_interval(),
  ));

  let (cache, worker) = context.start_cache()?;
  let mut events = cache.subscribe();
  let mut connectivity = service.monitor().subscribe();

  // Catch up on anything queued while this process was not running
  print_json(&service.sync_now().await?)?;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = connectivity.changed() => {
        if changed.is_err() {
          break;
        }
        print_json(&service.indicators().await)?;
      }
      event = events.recv() => match event {
        Ok(WorkerEvent::Activated(report)) => print_json(&report)?,
        Ok(WorkerEvent::Swept(report)) => print_json(&report)?,
        Err(RecvError::Lagged(missed)) => warn!(missed, "Missed cache worker events"),
        Err(RecvError::Closed) => break,
      },
    }
  }

  info!("Shutting down");
  drop(cache);
  worker.abort();
  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
