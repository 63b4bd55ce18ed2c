//! Request/response model and the network seam the worker fetches through.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::NetworkError;

/// How the page issued a request. Only `Navigate` gets the offline page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// A top-level document load
  Navigate,
  SameOrigin,
  NoCors,
  Cors,
}

impl RequestMode {
  /// Parse a `Sec-Fetch-Mode` header value.
  pub fn from_fetch_mode(value: &str) -> Option<Self> {
    match value.trim().to_ascii_lowercase().as_str() {
      "navigate" => Some(Self::Navigate),
      "same-origin" => Some(Self::SameOrigin),
      "no-cors" => Some(Self::NoCors),
      "cors" => Some(Self::Cors),
      _ => None,
    }
  }
}

/// An outgoing request as seen by the worker.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Request {
  /// A sub-resource GET.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::NoCors,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  /// A POST carrying `value` as a JSON body.
  pub fn post_json(url: Url, value: &serde_json::Value) -> Self {
    Self {
      method: Method::POST,
      url,
      mode: RequestMode::SameOrigin,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: value.to_string().into_bytes(),
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }
}

#[cfg(test)]
impl Request {
  /// A page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

/// Response type, following the Fetch standard's classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin and not redirected; the only kind worth caching
  Basic,
  Cors,
  Opaque,
  #[serde(rename = "opaqueredirect")]
  OpaqueRedirect,
}

impl ResponseType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::OpaqueRedirect => "opaqueredirect",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      "opaqueredirect" => Some(Self::OpaqueRedirect),
      _ => None,
    }
  }
}

/// A complete response: status, ordered headers and body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub kind: ResponseType,
}

impl Response {
  /// True for any 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

#[cfg(test)]
impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      kind: ResponseType::Basic,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_kind(mut self, kind: ResponseType) -> Self {
    self.kind = kind;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

#[cfg(test)]
fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Forwardable headers in wire order.
///
/// Values that are not UTF-8 are kept with the invalid bytes replaced.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter(|(name, _)| !is_connection_header(name.as_str()))
    .map(|(name, value)| {
      let value = match std::str::from_utf8(value.as_bytes()) {
        Ok(v) => v.to_string(),
        Err(_) => {
          debug!(header = %name, "Header value is not UTF-8, replacing invalid bytes");
          String::from_utf8_lossy(value.as_bytes()).into_owned()
        }
      };
      (name.as_str().to_string(), value)
    })
    .collect()
}

/// Headers that describe a single connection and are never forwarded.
///
/// `accept-encoding` is dropped so reqwest negotiates and decodes compression itself.
pub fn is_connection_header(name: &str) -> bool {
  const SKIPPED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "accept-encoding",
  ];
  SKIPPED.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// The network as the worker sees it.
#[async_trait]
pub trait Network: Send + Sync {
  /// Perform the request. Errors only when no response arrived at all.
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Network access over reqwest, with redirects handed back to the page.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: &Url) -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .redirect(Policy::none())
      .build()
      .map_err(|e| NetworkError::Client(e.to_string()))?;

    Ok(Self {
      client,
      origin: origin.clone(),
    })
  }
}

/// Classify a network response relative to the site's origin.
fn classify(origin: &Url, request: &Request, final_url: &Url, status: StatusCode) -> ResponseType {
  if status.is_redirection() {
    ResponseType::OpaqueRedirect
  } else if request.is_same_origin(origin) && final_url == &request.url {
    ResponseType::Basic
  } else if request.mode == RequestMode::NoCors {
    ResponseType::Opaque
  } else {
    ResponseType::Cors
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let transport = |e: reqwest::Error| NetworkError::Transport {
      url: request.url.to_string(),
      reason: e.to_string(),
    };

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      if !is_connection_header(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(transport)?;
    let status = response.status();
    let kind = classify(&self.origin, request, response.url(), status);
    let headers = header_pairs(response.headers());
    let body = response.bytes().await.map_err(transport)?.to_vec();

    Ok(Response {
      status: status.as_u16(),
      headers,
      body,
      kind,
    })
  }
}
