//! Worker registration across restarts.
//!
//! The registration record in the cache database names the active version.
//! Starting the same version again resumes it; a new version is installed and
//! activated, and only replaces the old one if its install succeeds.

use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheStorage, SqliteStorage};
use crate::error::Result;
use crate::network::Network;
use crate::worker::{Clients, OfflineWorker, WorkerSettings, WorkerState};

/// Bring up the worker for `settings`, installing it if needed.
pub async fn start_worker<N: Network>(
  settings: WorkerSettings,
  storage: Arc<SqliteStorage>,
  network: Arc<N>,
  clients: &dyn Clients,
  reinstall: bool,
) -> Result<OfflineWorker<SqliteStorage, N>> {
  let previous = storage.active_registration()?;

  if let Some(active) = previous.as_deref() {
    if !reinstall && active == settings.cache_name && storage.has(active)? {
      info!(cache = active, "Resuming active worker");
      let worker = OfflineWorker::resume(settings, storage, network, WorkerState::Activated);
      clients.claim(worker.cache_name());
      return Ok(worker);
    }
  }

  let worker = OfflineWorker::new(settings.clone(), Arc::clone(&storage), Arc::clone(&network));
  match worker.install().await {
    Ok(()) => {
      worker.activate(clients).await?;
      storage.set_active_registration(worker.cache_name())?;
      Ok(worker)
    }
    Err(e) => match previous {
      Some(active) if storage.has(&active)? => {
        warn!(cache = %active, error = %e, "Update failed, previous worker keeps serving");
        let settings = WorkerSettings {
          cache_name: active,
          ..settings
        };
        let worker = OfflineWorker::resume(settings, storage, network, WorkerState::Activated);
        clients.claim(worker.cache_name());
        Ok(worker)
      }
      _ => Err(e),
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::RequestKey;
  use crate::error::WorkerError;
  use crate::host::ClientRegistry;
  use crate::testing;

  fn v2(dir: &std::path::Path) -> WorkerSettings {
    WorkerSettings {
      cache_name: "mam-center-v2".to_string(),
      ..testing::settings(dir)
    }
  }

  #[tokio::test]
  async fn test_first_start_installs_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(testing::site());

    let worker = start_worker(
      testing::settings(dir.path()),
      Arc::clone(&storage),
      network,
      &ClientRegistry::new(),
      false,
    )
    .await
    .unwrap();

    assert_eq!(worker.state(), WorkerState::Activated);
    assert_eq!(
      storage.active_registration().unwrap().as_deref(),
      Some("mam-center-v1")
    );
  }

  #[tokio::test]
  async fn test_same_version_is_not_reinstalled() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(testing::site());
    let clients = ClientRegistry::new();

    start_worker(
      testing::settings(dir.path()),
      Arc::clone(&storage),
      Arc::clone(&network),
      &clients,
      false,
    )
    .await
    .unwrap();
    let calls = network.call_count();

    let worker = start_worker(
      testing::settings(dir.path()),
      Arc::clone(&storage),
      Arc::clone(&network),
      &clients,
      false,
    )
    .await
    .unwrap();

    assert_eq!(network.call_count(), calls);
    assert_eq!(worker.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_new_version_replaces_old_store() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(testing::site());
    let clients = ClientRegistry::new();

    start_worker(
      testing::settings(dir.path()),
      Arc::clone(&storage),
      Arc::clone(&network),
      &clients,
      false,
    )
    .await
    .unwrap();
    let worker = start_worker(v2(dir.path()), Arc::clone(&storage), network, &clients, false)
      .await
      .unwrap();

    assert_eq!(worker.cache_name(), "mam-center-v2");
    assert_eq!(storage.keys().unwrap(), vec!["mam-center-v2"]);
  }

  #[tokio::test]
  async fn test_failed_update_keeps_previous_version() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(testing::site());
    let clients = ClientRegistry::new();

    start_worker(
      testing::settings(dir.path()),
      Arc::clone(&storage),
      Arc::clone(&network),
      &clients,
      false,
    )
    .await
    .unwrap();

    network.remove(&testing::url("/offline.html"));
    let worker = start_worker(v2(dir.path()), Arc::clone(&storage), network, &clients, false)
      .await
      .unwrap();

    assert_eq!(worker.cache_name(), "mam-center-v1");
    assert_eq!(worker.state(), WorkerState::Activated);
    assert_eq!(
      storage.active_registration().unwrap().as_deref(),
      Some("mam-center-v1")
    );
    assert!(storage
      .match_request("mam-center-v1", &RequestKey::get(&testing::url("/offline.html")))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_failed_first_install_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(testing::site());
    network.set_online(false);

    let result = start_worker(
      testing::settings(dir.path()),
      storage,
      network,
      &ClientRegistry::new(),
      false,
    )
    .await;

    assert!(matches!(result, Err(WorkerError::Install(_))));
  }
}
