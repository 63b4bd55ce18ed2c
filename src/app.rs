use color_eyre::Result;
use reqwest::Method;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::SqliteStorage;
use crate::host::{ClientRegistry, EventHandler, HostEvent, NotificationCenter, SyncManager};
use crate::network::{Network, Request};
use crate::worker::OfflineWorker;

/// Runs the worker's non-fetch events: connectivity probes, sync, push and clicks.
pub struct App<N: Network> {
  worker: Arc<OfflineWorker<SqliteStorage, N>>,
  network: Arc<N>,
  clients: Arc<ClientRegistry>,
  notifications: Arc<NotificationCenter>,
  sync: Arc<SyncManager>,
}

impl<N: Network> App<N> {
  pub fn new(
    worker: Arc<OfflineWorker<SqliteStorage, N>>,
    network: Arc<N>,
    clients: Arc<ClientRegistry>,
    notifications: Arc<NotificationCenter>,
    sync: Arc<SyncManager>,
  ) -> Self {
    Self {
      worker,
      network,
      clients,
      notifications,
      sync,
    }
  }

  /// Handle events until the channel closes.
  pub async fn run(&self, mut events: EventHandler) -> Result<()> {
    while let Some(event) = events.next().await {
      self.handle_event(event).await;
    }
    Ok(())
  }

  async fn handle_event(&self, event: HostEvent) {
    match event {
      HostEvent::Tick => {
        let online = self.probe().await;
        for tag in self.sync.on_probe(online, Instant::now()) {
          self.dispatch_sync(&tag).await;
        }
      }
      HostEvent::Sync(tag) => self.dispatch_sync(&tag).await,
      HostEvent::Push(payload) => {
        self
          .worker
          .handle_push(payload.as_deref(), self.notifications.as_ref());
      }
      HostEvent::NotificationClick(id) => {
        match self.worker.handle_notification_click(
          id,
          self.notifications.as_ref(),
          self.clients.as_ref(),
        ) {
          Some(client) => info!(notification = id, client = client.id, url = %client.url, "Focused page"),
          None => debug!(notification = id, "Click on a closed notification"),
        }
      }
    }
  }

  /// Whether the origin answers at all. Any status counts as online.
  async fn probe(&self) -> bool {
    let request = Request::get(self.worker.settings().origin.clone()).with_method(Method::HEAD);
    self.network.fetch(&request).await.is_ok()
  }

  async fn dispatch_sync(&self, tag: &str) {
    match self.worker.handle_sync(tag).await {
      Ok(Some(report)) => self.sync.record_result(tag, report.remaining),
      Ok(None) => self.sync.unregister(tag),
      Err(e) => warn!(tag, error = %e, "Background sync failed"),
    }
  }
}
