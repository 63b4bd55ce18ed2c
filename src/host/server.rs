//! Local HTTP proxy that puts the worker in front of the origin.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/__worker/status` | Worker state, connectivity and queue size |
//! | POST | `/__worker/sync` | Fire the configured sync tag |
//! | POST | `/__worker/push` | Deliver a push; the body is the payload text |
//! | GET | `/__worker/notifications` | Notifications still on screen |
//! | POST | `/__worker/notifications/{id}/click` | Click a notification |
//! | * | anything else | Handled by the worker, or passed through to the origin |

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::header::{HeaderName, HeaderValue, ACCEPT};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use super::{ClientRegistry, HostEvent, NotificationCenter, SyncManager};
use crate::cache::{CacheResult, SqliteStorage};
use crate::network::{header_pairs, is_connection_header, Network, Request, RequestMode, Response};
use crate::worker::{Clients, FetchOutcome, OfflineWorker};

/// Largest request body the proxy reads.
const MAX_BODY: usize = 8 * 1024 * 1024;

/// Response header naming where the worker found the response.
const SOURCE_HEADER: &str = "x-worker-source";

/// Response header with the time a cached response was stored.
const CACHED_AT_HEADER: &str = "x-worker-cached-at";

/// Shared state for proxy handlers.
pub struct ProxyState<N: Network> {
  pub worker: Arc<OfflineWorker<SqliteStorage, N>>,
  pub network: Arc<N>,
  pub clients: Arc<ClientRegistry>,
  pub notifications: Arc<NotificationCenter>,
  pub sync: Arc<SyncManager>,
  pub events: mpsc::UnboundedSender<HostEvent>,
  /// Whether absolute-form requests to other origins are relayed
  pub forward_cross_origin: bool,
}

impl<N: Network> Clone for ProxyState<N> {
  fn clone(&self) -> Self {
    Self {
      worker: Arc::clone(&self.worker),
      network: Arc::clone(&self.network),
      clients: Arc::clone(&self.clients),
      notifications: Arc::clone(&self.notifications),
      sync: Arc::clone(&self.sync),
      events: self.events.clone(),
      forward_cross_origin: self.forward_cross_origin,
    }
  }
}

/// Build the proxy router: control endpoints plus the catch-all worker route.
pub fn router<N: Network + 'static>(state: ProxyState<N>) -> Router {
  Router::new()
    .route("/__worker/status", get(status::<N>))
    .route("/__worker/sync", post(trigger_sync::<N>))
    .route("/__worker/push", post(push::<N>))
    .route("/__worker/notifications", get(list_notifications::<N>))
    .route(
      "/__worker/notifications/{id}/click",
      post(click_notification::<N>),
    )
    .fallback(proxy::<N>)
    .with_state(state)
}

/// Serve `router` until the listener fails.
pub async fn serve(listen: SocketAddr, router: Router) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(%listen, "Proxy listening");

  axum::serve(
    listener,
    router.into_make_service_with_connect_info::<SocketAddr>(),
  )
  .await
  .map_err(|e| eyre!("Proxy server failed: {}", e))
}

fn send_event<N: Network>(state: &ProxyState<N>, event: HostEvent) -> StatusCode {
  match state.events.send(event) {
    Ok(()) => StatusCode::ACCEPTED,
    Err(_) => StatusCode::SERVICE_UNAVAILABLE,
  }
}

/// GET /__worker/status
async fn status<N: Network + 'static>(State(state): State<ProxyState<N>>) -> impl IntoResponse {
  let pending = match state.worker.pending_count() {
    Ok(count) => Some(count),
    Err(e) => {
      warn!(error = %e, "Failed to count queued submissions");
      None
    }
  };

  Json(json!({
    "state": state.worker.state().as_str(),
    "cache": state.worker.cache_name(),
    "origin": state.worker.settings().origin.as_str(),
    "online": state.sync.is_online(),
    "pending": pending,
    "syncs": state.sync.registered(),
    "clients": state.clients.match_all(),
  }))
}

/// POST /__worker/sync
async fn trigger_sync<N: Network + 'static>(
  State(state): State<ProxyState<N>>,
) -> impl IntoResponse {
  let tag = state.worker.settings().sync.tag.clone();
  let status = send_event(&state, HostEvent::Sync(tag.clone()));
  (status, Json(json!({ "tag": tag })))
}

/// POST /__worker/push
async fn push<N: Network + 'static>(
  State(state): State<ProxyState<N>>,
  body: Bytes,
) -> impl IntoResponse {
  let payload = String::from_utf8_lossy(&body).trim().to_string();
  let payload = (!payload.is_empty()).then_some(payload);
  send_event(&state, HostEvent::Push(payload))
}

/// GET /__worker/notifications
async fn list_notifications<N: Network + 'static>(
  State(state): State<ProxyState<N>>,
) -> impl IntoResponse {
  Json(state.notifications.list())
}

/// POST /__worker/notifications/{id}/click
async fn click_notification<N: Network + 'static>(
  State(state): State<ProxyState<N>>,
  Path(id): Path<u64>,
) -> impl IntoResponse {
  send_event(&state, HostEvent::NotificationClick(id))
}

/// Every other request: let the worker answer it, or forward it.
async fn proxy<N: Network + 'static>(
  State(state): State<ProxyState<N>>,
  ConnectInfo(peer): ConnectInfo<SocketAddr>,
  request: axum::extract::Request,
) -> axum::response::Response {
  let origin = &state.worker.settings().origin;
  let request = match into_worker_request(origin, request).await {
    Ok(request) => request,
    Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
  };

  if !request.is_same_origin(origin) && !state.forward_cross_origin {
    warn!(peer = %peer, url = %request.url, "Refusing to forward cross-origin request");
    return (
      StatusCode::FORBIDDEN,
      "Forwarding to other origins is disabled",
    )
      .into_response();
  }

  if request.is_navigation() && request.is_same_origin(origin) {
    state
      .clients
      .record_navigation(&peer.ip().to_string(), request.url.as_str());
  }

  match state.worker.handle_fetch(&request).await {
    Ok(FetchOutcome::Respond(result)) => worker_response(result),
    Ok(FetchOutcome::PassThrough) => pass_through(&state, &request).await,
    Err(e) => {
      debug!(url = %request.url, error = %e, "Worker could not answer");
      (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    }
  }
}

async fn pass_through<N: Network>(state: &ProxyState<N>, request: &Request) -> axum::response::Response {
  let error = match state.network.fetch(request).await {
    Ok(response) => return into_axum_response(response),
    Err(e) => e,
  };

  if is_sync_submission(state, request) {
    if let Ok(data) = serde_json::from_slice::<serde_json::Value>(&request.body) {
      match state.worker.queue_submission(&data) {
        Ok(id) => {
          state.sync.register(&state.worker.settings().sync.tag);
          return (StatusCode::ACCEPTED, Json(json!({ "queued": id }))).into_response();
        }
        Err(e) => warn!(error = %e, "Failed to queue submission"),
      }
    }
  }

  (StatusCode::BAD_GATEWAY, error.to_string()).into_response()
}

/// A POST of a form to the sync endpoint, which is queued when offline.
fn is_sync_submission<N: Network>(state: &ProxyState<N>, request: &Request) -> bool {
  let settings = state.worker.settings();
  request.method == Method::POST
    && request.is_same_origin(&settings.origin)
    && request.url.path() == settings.sync.endpoint
}

/// Convert an incoming request into the worker's model.
///
/// Absolute-form URIs keep their own origin; everything else is joined to `origin`.
pub async fn into_worker_request(
  origin: &Url,
  request: axum::extract::Request,
) -> std::result::Result<Request, String> {
  let (parts, body) = request.into_parts();

  let url = if parts.uri.scheme().is_some() {
    Url::parse(&parts.uri.to_string())
  } else {
    let path = parts.uri.path_and_query().map_or("/", |p| p.as_str());
    origin.join(path)
  }
  .map_err(|e| format!("Invalid request URI {}: {}", parts.uri, e))?;

  let body = to_bytes(body, MAX_BODY)
    .await
    .map_err(|e| format!("Failed to read request body: {}", e))?;

  let headers = header_pairs(&parts.headers);

  Ok(Request {
    mode: request_mode(&parts.method, &parts.headers),
    method: parts.method,
    url,
    headers,
    body: body.to_vec(),
  })
}

/// Request mode from `Sec-Fetch-Mode`, else guessed from `Accept`.
pub fn request_mode(method: &Method, headers: &HeaderMap) -> RequestMode {
  if let Some(mode) = headers
    .get("sec-fetch-mode")
    .and_then(|v| v.to_str().ok())
    .and_then(RequestMode::from_fetch_mode)
  {
    return mode;
  }

  let wants_html = headers
    .get(ACCEPT)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|accept| accept.contains("text/html"));

  if method == Method::GET && wants_html {
    RequestMode::Navigate
  } else {
    RequestMode::NoCors
  }
}

fn into_axum_response(response: Response) -> axum::response::Response {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut headers = HeaderMap::new();
  for (name, value) in &response.headers {
    if is_connection_header(name) {
      continue;
    }
    match (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      (Ok(name), Ok(value)) => {
        headers.append(name, value);
      }
      _ => debug!(header = %name, "Dropping header that cannot be sent"),
    }
  }

  (status, headers, Body::from(response.body)).into_response()
}

/// A worker response, tagged with where it came from and when it was stored.
fn worker_response(result: CacheResult<Response>) -> axum::response::Response {
  let mut response = into_axum_response(result.data);
  let headers = response.headers_mut();
  headers.insert(SOURCE_HEADER, HeaderValue::from_static(result.source.as_str()));
  if let Some(cached_at) = result.cached_at {
    if let Ok(value) = HeaderValue::from_str(&cached_at.to_rfc3339()) {
      headers.insert(CACHED_AT_HEADER, value);
    }
  }
  response
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::start_worker;
  use crate::testing::{self, MockNetwork};

  struct Harness {
    state: ProxyState<MockNetwork>,
    network: Arc<MockNetwork>,
    events: mpsc::UnboundedReceiver<HostEvent>,
    _dir: tempfile::TempDir,
  }

  async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(testing::site());
    let clients = Arc::new(ClientRegistry::new());
    let worker = start_worker(
      testing::settings(dir.path()),
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::clone(&network),
      clients.as_ref(),
      false,
    )
    .await
    .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    Harness {
      state: ProxyState {
        worker: Arc::new(worker),
        network: Arc::clone(&network),
        clients,
        notifications: Arc::new(NotificationCenter::new()),
        sync: Arc::new(SyncManager::new(std::time::Duration::from_secs(60))),
        events: tx,
        forward_cross_origin: false,
      },
      network,
      events: rx,
      _dir: dir,
    }
  }

  fn peer() -> ConnectInfo<SocketAddr> {
    ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 50123)))
  }

  fn page(path: &str) -> axum::extract::Request {
    axum::http::Request::builder()
      .uri(path)
      .header("sec-fetch-mode", "navigate")
      .header(ACCEPT, "text/html")
      .body(Body::empty())
      .unwrap()
  }

  async fn body_of(response: axum::response::Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
      .await
      .unwrap()
      .to_vec()
  }

  #[test]
  fn test_request_mode_detection() {
    let mut headers = HeaderMap::new();
    assert_eq!(request_mode(&Method::GET, &headers), RequestMode::NoCors);

    headers.insert(ACCEPT, HeaderValue::from_static("text/html,*/*"));
    assert_eq!(request_mode(&Method::GET, &headers), RequestMode::Navigate);
    assert_eq!(request_mode(&Method::POST, &headers), RequestMode::NoCors);

    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    assert_eq!(request_mode(&Method::GET, &headers), RequestMode::Cors);
  }

  #[tokio::test]
  async fn test_relative_and_absolute_uris() {
    let origin = testing::origin();

    let relative = into_worker_request(&origin, page("/gallery?page=2")).await.unwrap();
    assert_eq!(relative.url.as_str(), "https://mam.test/gallery?page=2");
    assert!(relative.is_navigation());

    let absolute = axum::http::Request::builder()
      .uri("http://fonts.example/horse.woff2")
      .body(Body::empty())
      .unwrap();
    let absolute = into_worker_request(&origin, absolute).await.unwrap();
    assert!(!absolute.is_same_origin(&origin));
  }

  #[tokio::test]
  async fn test_proxy_serves_cache_when_offline() {
    let h = harness().await;
    h.network.set_online(false);

    let response = proxy(State(h.state.clone()), peer(), page("/")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[SOURCE_HEADER], "cache");
    assert!(response.headers().contains_key(CACHED_AT_HEADER));
    assert_eq!(response.headers()["etag"], "\"home-1\"");
    assert_eq!(body_of(response).await, testing::home_page().body);
    assert_eq!(h.state.clients.match_all().len(), 1);
  }

  #[tokio::test]
  async fn test_proxy_offline_page_for_unknown_navigation() {
    let h = harness().await;
    h.network.set_online(false);

    let response = proxy(State(h.state.clone()), peer(), page("/booking")).await;

    assert_eq!(response.headers()[SOURCE_HEADER], "offline-fallback");
    assert_eq!(body_of(response).await, testing::offline_page().body);
  }

  fn font() -> axum::extract::Request {
    axum::http::Request::builder()
      .uri("http://fonts.example/horse.woff2")
      .body(Body::empty())
      .unwrap()
  }

  #[tokio::test]
  async fn test_cross_origin_relay_refused_by_default() {
    let h = harness().await;
    let calls = h.network.call_count();

    let response = proxy(State(h.state.clone()), peer(), font()).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.network.call_count(), calls);
  }

  #[tokio::test]
  async fn test_cross_origin_relay_when_enabled() {
    let h = harness().await;
    let state = ProxyState {
      forward_cross_origin: true,
      ..h.state.clone()
    };

    let response = proxy(State(state), peer(), font()).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!response.headers().contains_key(SOURCE_HEADER));
    let last = h.network.calls().pop().unwrap();
    assert_eq!(last.url.as_str(), "http://fonts.example/horse.woff2");
  }

  #[tokio::test]
  async fn test_offline_contact_post_is_queued() {
    let h = harness().await;
    h.network.set_online(false);

    let request = axum::http::Request::builder()
      .method(Method::POST)
      .uri("/api/contact")
      .header("content-type", "application/json")
      .body(Body::from(r#"{"name":"Nino","message":"Lesson?"}"#))
      .unwrap();
    let response = proxy(State(h.state.clone()), peer(), request).await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(h.state.worker.pending_count().unwrap(), 1);
    assert_eq!(h.state.sync.registered(), vec!["contact-form-sync"]);
  }

  #[tokio::test]
  async fn test_offline_other_post_is_bad_gateway() {
    let h = harness().await;
    h.network.set_online(false);

    let request = axum::http::Request::builder()
      .method(Method::POST)
      .uri("/api/booking")
      .body(Body::from("{}"))
      .unwrap();
    let response = proxy(State(h.state.clone()), peer(), request).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(h.state.worker.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_control_endpoints_send_events() {
    let mut h = harness().await;

    let status = push(State(h.state.clone()), Bytes::from_static(b"Tour at 3pm"))
      .await
      .into_response()
      .status();
    assert_eq!(status, StatusCode::ACCEPTED);
    trigger_sync(State(h.state.clone())).await;
    click_notification(State(h.state.clone()), Path(4)).await;

    assert_eq!(
      h.events.recv().await,
      Some(HostEvent::Push(Some("Tour at 3pm".to_string())))
    );
    assert_eq!(
      h.events.recv().await,
      Some(HostEvent::Sync("contact-form-sync".to_string()))
    );
    assert_eq!(h.events.recv().await, Some(HostEvent::NotificationClick(4)));
  }

  #[tokio::test]
  async fn test_status_reports_worker() {
    let h = harness().await;
    let response = status(State(h.state.clone())).await.into_response();
    let body: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();

    assert_eq!(body["state"], "activated");
    assert_eq!(body["cache"], "mam-center-v1");
    assert_eq!(body["pending"], 0);
  }
}
