use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

use crate::worker::{Notification, Notifications};

/// A notification that is currently displayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShownNotification {
  pub id: u64,
  #[serde(flatten)]
  pub notification: Notification,
}

/// Notifications shown by the worker, until clicked.
#[derive(Default)]
pub struct NotificationCenter {
  inner: Mutex<(u64, BTreeMap<u64, Notification>)>,
}

impl NotificationCenter {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, (u64, BTreeMap<u64, Notification>)> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Open notifications, oldest first.
  pub fn list(&self) -> Vec<ShownNotification> {
    self
      .lock()
      .1
      .iter()
      .map(|(id, n)| ShownNotification {
        id: *id,
        notification: n.clone(),
      })
      .collect()
  }
}

impl Notifications for NotificationCenter {
  fn show(&self, notification: Notification) -> u64 {
    let mut inner = self.lock();
    inner.0 += 1;
    let id = inner.0;
    info!(id, title = %notification.title, body = %notification.body, "Notification shown");
    inner.1.insert(id, notification);
    id
  }

  fn close(&self, id: u64) -> Option<Notification> {
    self.lock().1.remove(&id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::NotificationConfig;

  #[test]
  fn test_show_list_close() {
    let center = NotificationCenter::new();
    let config = NotificationConfig::default();
    let first = center.show(Notification::from_push(&config, Some("one")));
    let second = center.show(Notification::from_push(&config, None));

    let ids: Vec<u64> = center.list().iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![first, second]);

    assert_eq!(center.close(first).unwrap().body, "one");
    assert!(center.close(first).is_none());
    assert_eq!(center.list().len(), 1);
  }
}
