mod app;
mod cache;
mod config;
mod db;
mod error;
mod host;
mod logging;
mod network;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use cache::{CacheStorage, SqliteStorage};
use host::{ClientRegistry, EventHandler, NotificationCenter, ProxyState, SyncManager};
use network::HttpNetwork;
use worker::{OfflineWorker, WorkerSettings, WorkerState};

#[derive(Parser, Debug)]
#[command(name = "mam-offline")]
#[command(about = "Offline cache worker for the Mam Center site, run as a local proxy")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mam-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Site origin to front, e.g. https://mam-center.ge
  #[arg(short, long, global = true)]
  origin: Option<Url>,

  /// Address the proxy listens on
  #[arg(short, long, global = true)]
  listen: Option<SocketAddr>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Start the worker and serve the proxy until Ctrl-C
  Serve {
    /// Install the configured version even if it is already active
    #[arg(long)]
    reinstall: bool,
  },
  /// Precache the configured version without activating it
  Install,
  /// Activate an installed version and drop older caches
  Activate,
  /// Deliver queued submissions once
  Sync,
  /// Queue a JSON payload for the next sync
  Queue {
    /// Payload, e.g. '{"name":"Nino","message":"Hello"}'
    json: String,
  },
  /// Show caches, the active version and the queue size
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin and listen address if specified on command line
  let config = config::Config {
    origin: args.origin.or(config.origin),
    listen: args.listen.unwrap_or(config.listen),
    ..config
  };
  config.validate()?;

  let paths = config.storage_paths()?;
  let _guard = logging::init(&paths.logs_dir)?;

  let settings = WorkerSettings::from_config(&config)?;
  let storage = Arc::new(SqliteStorage::open(&paths.cache_db)?);
  let network = Arc::new(HttpNetwork::new(config.origin()?)?);

  match args.command {
    Command::Serve { reinstall } => serve(&config, settings, storage, network, reinstall).await,
    Command::Install => {
      let worker = OfflineWorker::new(settings, Arc::clone(&storage), network);
      worker.install().await?;
      println!(
        "Installed {} ({} entries)",
        worker.cache_name(),
        storage.len(worker.cache_name())?
      );
      Ok(())
    }
    Command::Activate => {
      if !storage.has(&settings.cache_name)? {
        return Err(eyre!(
          "{} is not installed. Run `mam-offline install` first.",
          settings.cache_name
        ));
      }
      let worker = OfflineWorker::resume(
        settings,
        Arc::clone(&storage),
        network,
        WorkerState::Installed,
      );
      let deleted = worker.activate(&ClientRegistry::new()).await?;
      storage.set_active_registration(worker.cache_name())?;
      println!("Activated {}", worker.cache_name());
      for name in deleted {
        println!("  deleted {}", name);
      }
      Ok(())
    }
    Command::Sync => {
      let worker = OfflineWorker::new(settings, storage, network);
      let report = worker.sync_pending().await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
      Ok(())
    }
    Command::Queue { json } => {
      let data: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let worker = OfflineWorker::new(settings, storage, network);
      let id = worker.queue_submission(&data)?;
      println!("Queued submission {}", id);
      Ok(())
    }
    Command::Status => {
      let active = storage.active_registration()?;
      println!("origin:  {}", settings.origin);
      println!("active:  {}", active.as_deref().unwrap_or("(none)"));
      for name in storage.keys()? {
        println!("cache:   {} ({} entries)", name, storage.len(&name)?);
      }
      let worker = OfflineWorker::new(settings, storage, network);
      println!("pending: {}", worker.pending_count()?);
      Ok(())
    }
  }
}

async fn serve(
  config: &config::Config,
  settings: WorkerSettings,
  storage: Arc<SqliteStorage>,
  network: Arc<HttpNetwork>,
  reinstall: bool,
) -> Result<()> {
  let clients = Arc::new(ClientRegistry::new());
  let notifications = Arc::new(NotificationCenter::new());
  let sync = Arc::new(SyncManager::new(Duration::from_secs(
    config.sync.retry_interval_secs,
  )));

  let worker = host::start_worker(
    settings,
    storage,
    Arc::clone(&network),
    clients.as_ref(),
    reinstall,
  )
  .await?;
  let worker = Arc::new(worker);

  // Records left over from an earlier run still need delivering
  if worker.pending_count()? > 0 {
    sync.register(&config.sync.tag);
  }

  let events = EventHandler::new(Duration::from_secs(config.sync.probe_interval_secs));
  let router = host::router(ProxyState {
    worker: Arc::clone(&worker),
    network: Arc::clone(&network),
    clients: Arc::clone(&clients),
    notifications: Arc::clone(&notifications),
    sync: Arc::clone(&sync),
    events: events.sender(),
    forward_cross_origin: config.forward_cross_origin(),
  });
  let app = app::App::new(worker, network, clients, notifications, sync);

  tokio::select! {
    result = host::serve(config.listen, router) => result?,
    result = app.run(events) => result?,
    _ = tokio::signal::ctrl_c() => info!("Shutting down"),
  }

  Ok(())
}
