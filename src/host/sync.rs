use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Registered sync tags and the connectivity they wait for.
///
/// A tag fires when the origin comes back online, and again every retry
/// interval while it stays registered. It is dropped once its queue is empty.
pub struct SyncManager {
  tags: Mutex<BTreeSet<String>>,
  online: AtomicBool,
  last_attempt: Mutex<Option<Instant>>,
  retry_interval: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncManager {
  pub fn new(retry_interval: Duration) -> Self {
    Self {
      tags: Mutex::new(BTreeSet::new()),
      online: AtomicBool::new(false),
      last_attempt: Mutex::new(None),
      retry_interval,
    }
  }

  pub fn register(&self, tag: &str) {
    if lock(&self.tags).insert(tag.to_string()) {
      debug!(tag, "Sync registered");
    }
  }

  pub fn unregister(&self, tag: &str) {
    if lock(&self.tags).remove(tag) {
      debug!(tag, "Sync unregistered");
    }
  }

  pub fn registered(&self) -> Vec<String> {
    lock(&self.tags).iter().cloned().collect()
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Feed a connectivity probe result. Returns the tags to fire now.
  pub fn on_probe(&self, online: bool, now: Instant) -> Vec<String> {
    let was_online = self.online.swap(online, Ordering::SeqCst);
    if online != was_online {
      info!(online, "Connectivity changed");
    }
    if !online {
      return Vec::new();
    }

    let tags = self.registered();
    if tags.is_empty() {
      return Vec::new();
    }

    let mut last_attempt = lock(&self.last_attempt);
    let due = !was_online
      || last_attempt.map_or(true, |at| now.duration_since(at) >= self.retry_interval);
    if !due {
      return Vec::new();
    }

    *last_attempt = Some(now);
    tags
  }

  /// Note how many records a sync left behind.
  pub fn record_result(&self, tag: &str, remaining: usize) {
    if remaining == 0 {
      self.unregister(tag);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const TAG: &str = "contact-form-sync";

  #[test]
  fn test_fires_on_reconnect() {
    let sync = SyncManager::new(Duration::from_secs(60));
    sync.register(TAG);
    let start = Instant::now();

    assert!(sync.on_probe(false, start).is_empty());
    assert_eq!(sync.on_probe(true, start), vec![TAG]);
  }

  #[test]
  fn test_retries_after_interval_while_online() {
    let sync = SyncManager::new(Duration::from_secs(60));
    sync.register(TAG);
    let start = Instant::now();

    assert_eq!(sync.on_probe(true, start), vec![TAG]);
    assert!(sync
      .on_probe(true, start + Duration::from_secs(30))
      .is_empty());
    assert_eq!(sync.on_probe(true, start + Duration::from_secs(61)), vec![TAG]);
  }

  #[test]
  fn test_nothing_registered_never_fires() {
    let sync = SyncManager::new(Duration::from_secs(1));
    assert!(sync.on_probe(true, Instant::now()).is_empty());
    assert!(sync.is_online());
  }

  #[test]
  fn test_empty_queue_unregisters() {
    let sync = SyncManager::new(Duration::from_secs(60));
    sync.register(TAG);
    sync.record_result(TAG, 2);
    assert_eq!(sync.registered(), vec![TAG]);
    sync.record_result(TAG, 0);
    assert!(sync.registered().is_empty());
  }
}
