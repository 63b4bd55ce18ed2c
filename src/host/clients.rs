use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::worker::{ClientInfo, Clients};

#[derive(Default)]
struct Inner {
  clients: Vec<ClientInfo>,
  next_id: u64,
  /// Cache name of the worker that claimed the pages
  controller: Option<String>,
  /// Latest client per remote peer
  peers: HashMap<String, u64>,
}

/// Pages seen by the proxy, one per remote peer.
///
/// A peer that navigates again updates its existing page instead of adding one.
#[derive(Default)]
pub struct ClientRegistry {
  inner: Mutex<Inner>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Note a navigation from `peer`. Returns the client id.
  pub fn record_navigation(&self, peer: &str, url: &str) -> u64 {
    let mut inner = self.lock();

    if let Some(&id) = inner.peers.get(peer) {
      if let Some(client) = inner.clients.iter_mut().find(|c| c.id == id) {
        client.url = url.to_string();
        return id;
      }
    }

    let client = new_client(&mut inner, url);
    let id = client.id;
    inner.peers.insert(peer.to_string(), id);
    inner.clients.push(client);
    debug!(client = id, peer, url, "New page");
    id
  }
}

fn new_client(inner: &mut Inner, url: &str) -> ClientInfo {
  inner.next_id += 1;
  ClientInfo {
    id: inner.next_id,
    url: url.to_string(),
    focused: false,
    controller: inner.controller.clone(),
  }
}

impl Clients for ClientRegistry {
  fn claim(&self, cache_name: &str) -> usize {
    let mut inner = self.lock();
    inner.controller = Some(cache_name.to_string());
    for client in inner.clients.iter_mut() {
      client.controller = Some(cache_name.to_string());
    }
    inner.clients.len()
  }

  fn match_all(&self) -> Vec<ClientInfo> {
    self.lock().clients.clone()
  }

  fn focus(&self, id: u64) -> bool {
    let mut inner = self.lock();
    if !inner.clients.iter().any(|c| c.id == id) {
      return false;
    }
    for client in inner.clients.iter_mut() {
      client.focused = client.id == id;
    }
    true
  }

  fn open_window(&self, url: &str) -> ClientInfo {
    let mut inner = self.lock();
    for client in inner.clients.iter_mut() {
      client.focused = false;
    }
    let mut client = new_client(&mut inner, url);
    client.focused = true;
    inner.clients.push(client.clone());
    debug!(client = client.id, url, "Opened window");
    client
  }
}
