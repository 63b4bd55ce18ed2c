//! Shared fixtures: a scripted network and a small copy of the site.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::config::{NotificationConfig, SyncConfig};
use crate::error::NetworkError;
use crate::network::{Network, Request, Response};
use crate::worker::WorkerSettings;

/// Network double answering from a route table. Unknown URLs get a 404.
pub struct MockNetwork {
  routes: Mutex<HashMap<(Method, String), Response>>,
  online: AtomicBool,
  reject_containing: Mutex<Option<String>>,
  calls: Mutex<Vec<Request>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      reject_containing: Mutex::new(None),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn route(&self, method: Method, url: &Url, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method, url.to_string()), response);
  }

  pub fn remove(&self, url: &Url) {
    self
      .routes
      .lock()
      .unwrap()
      .remove(&(Method::GET, url.to_string()));
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Answer 500 to any request whose body contains `needle`.
  pub fn reject_body_containing(&self, needle: &str) {
    *self.reject_containing.lock().unwrap() = Some(needle.to_string());
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    self.calls.lock().unwrap().push(request.clone());

    if !self.online.load(Ordering::SeqCst) {
      return Err(NetworkError::Transport {
        url: request.url.to_string(),
        reason: "network is offline".to_string(),
      });
    }

    if let Some(needle) = self.reject_containing.lock().unwrap().as_deref() {
      if String::from_utf8_lossy(&request.body).contains(needle) {
        return Ok(Response::new(500, "rejected"));
      }
    }

    let routes = self.routes.lock().unwrap();
    if request.method == Method::HEAD {
      return Ok(match routes.get(&(Method::GET, request.url.to_string())) {
        Some(found) => Response::new(found.status, Vec::new()),
        None => Response::new(404, Vec::new()),
      });
    }

    Ok(
      routes
        .get(&(request.method.clone(), request.url.to_string()))
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}

pub fn origin() -> Url {
  Url::parse("https://mam.test").unwrap()
}

pub fn url(path: &str) -> Url {
  origin().join(path).unwrap()
}

pub fn home_page() -> Response {
  Response::new(200, "<html><h1>Mam Center</h1></html>")
    .with_header("content-type", "text/html; charset=utf-8")
    .with_header("etag", "\"home-1\"")
}

pub fn offline_page() -> Response {
  Response::new(200, "<html><p>You are offline</p></html>")
    .with_header("content-type", "text/html; charset=utf-8")
}

/// The site with its shell pages and a working contact endpoint.
pub fn site() -> MockNetwork {
  let network = MockNetwork::new();
  network.route(Method::GET, &url("/"), home_page());
  network.route(Method::GET, &url("/offline.html"), offline_page());
  network.route(
    Method::GET,
    &url("/gallery/stallion.jpg"),
    Response::new(200, vec![0xff, 0xd8, 0xff]).with_header("content-type", "image/jpeg"),
  );
  network.route(
    Method::POST,
    &url("/api/contact"),
    Response::new(200, "{\"ok\":true}"),
  );
  network
}

/// Settings with a two-entry manifest and records under `records_dir`.
pub fn settings(records_dir: &Path) -> WorkerSettings {
  WorkerSettings {
    origin: origin(),
    cache_name: "mam-center-v1".to_string(),
    precache: vec!["/".to_string(), "/offline.html".to_string()],
    offline_page: "/offline.html".to_string(),
    sync: SyncConfig::default(),
    notifications: NotificationConfig::default(),
    records_dir: records_dir.to_path_buf(),
  }
}
