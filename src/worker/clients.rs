//! Host seams for page instances and notifications, plus the push handlers.

use serde::Serialize;

use crate::config::NotificationConfig;

/// An open page under the worker's origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
  pub id: u64,
  pub url: String,
  pub focused: bool,
  /// Cache name of the worker controlling this page
  pub controller: Option<String>,
}

/// Page instances, as provided by the host.
pub trait Clients: Send + Sync {
  /// Take control of every open page. Returns how many were claimed.
  fn claim(&self, cache_name: &str) -> usize;

  fn match_all(&self) -> Vec<ClientInfo>;

  /// Returns false if the client is gone.
  fn focus(&self, id: u64) -> bool;

  fn open_window(&self, url: &str) -> ClientInfo;
}

/// A notification as displayed to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// Where a click should lead
  pub url: String,
}

impl Notification {
  /// Build the notification for a push, falling back to the default body.
  pub fn from_push(config: &NotificationConfig, payload: Option<&str>) -> Self {
    Self {
      title: config.title.clone(),
      body: payload.unwrap_or(&config.default_body).to_string(),
      icon: config.icon.clone(),
      badge: config.badge.clone(),
      url: config.click_url.clone(),
    }
  }
}

/// Notification display, as provided by the host.
pub trait Notifications: Send + Sync {
  /// Show a notification and return its id.
  fn show(&self, notification: Notification) -> u64;

  /// Close a notification, returning it if it was still open.
  fn close(&self, id: u64) -> Option<Notification>;
}

/// Focus an open page if there is one, else open a new one at `url`.
pub fn focus_or_open(clients: &dyn Clients, url: &str) -> ClientInfo {
  for client in clients.match_all() {
    if clients.focus(client.id) {
      return ClientInfo {
        focused: true,
        ..client
      };
    }
  }
  clients.open_window(url)
}
