//! The offline cache worker.
//!
//! One worker instance is one version of the site's offline support. The host
//! drives it through install and activate, then hands it every request the
//! pages make. Requests it does not want are passed back untouched.

mod clients;
mod state;
mod sync;

pub use clients::{focus_or_open, ClientInfo, Clients, Notification, Notifications};
pub use state::WorkerState;

use futures::future::try_join_all;
use reqwest::Method;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, RequestKey};
use crate::config::{Config, NotificationConfig, SyncConfig};
use crate::db::SubmissionStore;
use crate::error::{Result, WorkerError};
use crate::network::{Network, Request, Response};

/// Everything a worker version needs to know, fixed at construction.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub origin: Url,
  pub cache_name: String,
  pub precache: Vec<String>,
  pub offline_page: String,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  /// Directory of the durable record database
  pub records_dir: PathBuf,
}

impl WorkerSettings {
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    Ok(Self {
      origin: config.origin()?.clone(),
      cache_name: config.cache.name.clone(),
      precache: config.cache.precache.clone(),
      offline_page: config.cache.offline_page.clone(),
      sync: config.sync.clone(),
      notifications: config.notifications.clone(),
      records_dir: config.storage_paths()?.records_dir,
    })
  }

  /// Resolve an origin-relative path.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self.origin.join(path).map_err(|e| WorkerError::Fetch {
      url: path.to_string(),
      reason: e.to_string(),
    })
  }
}

/// What the worker decided to do with a request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not handled; the host sends it to the network as if no worker existed
  PassThrough,
  /// Answer the page with this response
  Respond(CacheResult<Response>),
}

/// Offline cache worker over a cache storage and a network.
pub struct OfflineWorker<S: CacheStorage, N: Network> {
  settings: WorkerSettings,
  cache: CacheLayer<S>,
  network: Arc<N>,
  state: Mutex<WorkerState>,
  /// Record store, opened on first use and kept for the worker's lifetime
  submissions: Mutex<Option<Arc<SubmissionStore>>>,
}

impl<S: CacheStorage, N: Network> OfflineWorker<S, N> {
  /// A freshly parsed worker, not yet installed.
  pub fn new(settings: WorkerSettings, storage: Arc<S>, network: Arc<N>) -> Self {
    Self::resume(settings, storage, network, WorkerState::Parsed)
  }

  /// A worker whose earlier lifecycle steps already ran, e.g. in a previous process.
  pub fn resume(
    settings: WorkerSettings,
    storage: Arc<S>,
    network: Arc<N>,
    state: WorkerState,
  ) -> Self {
    let cache = CacheLayer::new(storage, settings.cache_name.clone());
    Self {
      settings,
      cache,
      network,
      state: Mutex::new(state),
      submissions: Mutex::new(None),
    }
  }

  pub fn settings(&self) -> &WorkerSettings {
    &self.settings
  }

  pub fn cache_name(&self) -> &str {
    self.cache.cache_name()
  }

  pub fn storage(&self) -> &Arc<S> {
    self.cache.storage()
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn transition(&self, next: WorkerState) -> Result<()> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let current = *state;
    if !current.can_transition_to(next) {
      return Err(WorkerError::InvalidState {
        from: current,
        to: next,
      });
    }
    debug!(cache = %self.cache_name(), from = %current, to = %next, "Worker state change");
    *state = next;
    Ok(())
  }

  /// Populate the current store with the precache manifest.
  ///
  /// Every asset must load, or nothing is stored and the worker becomes redundant.
  pub async fn install(&self) -> Result<()> {
    self.transition(WorkerState::Installing)?;

    match self.precache().await {
      Ok(count) => {
        info!(cache = %self.cache_name(), assets = count, "Cached app shell");
        self.transition(WorkerState::Installed)?;
        Ok(())
      }
      Err(e) => {
        error!(cache = %self.cache_name(), error = %e, "Install failed");
        self.transition(WorkerState::Redundant)?;
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let install_err = |e: WorkerError| WorkerError::Install(e.to_string());

    let urls = self
      .settings
      .precache
      .iter()
      .map(|path| self.settings.resolve(path))
      .collect::<Result<Vec<_>>>()
      .map_err(install_err)?;

    let fetches = urls.into_iter().map(|url| {
      let network = Arc::clone(&self.network);
      async move {
        let response = network
          .fetch(&Request::get(url.clone()))
          .await
          .map_err(|e| WorkerError::Install(e.to_string()))?;
        if !response.is_ok() {
          return Err(WorkerError::Install(format!(
            "{} returned status {}",
            url, response.status
          )));
        }
        Ok((RequestKey::get(&url), response))
      }
    });
    let entries = try_join_all(fetches).await?;

    self
      .storage()
      .open(self.cache_name())
      .map_err(install_err)?;
    self
      .storage()
      .put_all(self.cache_name(), &entries)
      .map_err(install_err)?;

    Ok(entries.len())
  }

  /// Drop every other store, then take control of all open pages.
  ///
  /// Returns the names of the deleted stores.
  pub async fn activate(&self, clients: &dyn Clients) -> Result<Vec<String>> {
    self.transition(WorkerState::Activating)?;

    let deleted = match self.delete_stale_caches() {
      Ok(deleted) => deleted,
      Err(e) => {
        warn!(cache = %self.cache_name(), error = %e, "Failed to clean up old caches");
        Vec::new()
      }
    };

    let claimed = clients.claim(self.cache_name());
    self.transition(WorkerState::Activated)?;
    info!(cache = %self.cache_name(), claimed, "Worker activated");

    Ok(deleted)
  }

  fn delete_stale_caches(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage().keys()? {
      if name != self.cache_name() {
        info!(cache = %name, "Deleting old cache");
        self.storage().delete(&name)?;
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Decide how to answer a request from a page.
  ///
  /// Only same-origin GETs are handled: cache first, then network, then the
  /// offline page for navigations. Everything else passes through.
  pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    if !self.state().can_intercept_fetch() {
      return Ok(FetchOutcome::PassThrough);
    }
    if request.method != Method::GET || !request.is_same_origin(&self.settings.origin) {
      return Ok(FetchOutcome::PassThrough);
    }

    let key = RequestKey::for_request(request);
    let network = Arc::clone(&self.network);
    let result = self
      .cache
      .fetch(&key, || async move { network.fetch(request).await })
      .await;

    match result {
      Ok(result) => Ok(FetchOutcome::Respond(result)),
      Err(e) if request.is_navigation() => {
        debug!(url = %request.url, error = %e, "Navigation failed, trying offline page");
        self.offline_fallback(request)
      }
      Err(e) => Err(WorkerError::Fetch {
        url: request.url.to_string(),
        reason: e.to_string(),
      }),
    }
  }

  fn offline_fallback(&self, request: &Request) -> Result<FetchOutcome> {
    let offline_url = self.settings.resolve(&self.settings.offline_page)?;
    match self.cache.lookup(&RequestKey::get(&offline_url)) {
      Some(entry) => Ok(FetchOutcome::Respond(CacheResult::offline_fallback(
        entry.response,
        entry.cached_at,
      ))),
      None => Err(WorkerError::Fetch {
        url: request.url.to_string(),
        reason: format!("offline and {} is not cached", offline_url),
      }),
    }
  }

  /// Show a notification for a push message. Returns the notification id.
  pub fn handle_push(&self, payload: Option<&str>, notifications: &dyn Notifications) -> u64 {
    let notification = Notification::from_push(&self.settings.notifications, payload);
    notifications.show(notification)
  }

  /// Close the clicked notification and bring a page to the front.
  ///
  /// Returns `None` if the notification is not open.
  pub fn handle_notification_click(
    &self,
    id: u64,
    notifications: &dyn Notifications,
    clients: &dyn Clients,
  ) -> Option<ClientInfo> {
    let notification = notifications.close(id)?;
    Some(focus_or_open(clients, &notification.url))
  }
}
