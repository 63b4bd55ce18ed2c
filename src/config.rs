use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::db::schema::is_valid_store_name;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Site being fronted; defines what "same-origin" means
  pub origin: Option<Url>,
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// Relay absolute-form requests to other origins. Defaults to on only for a
  /// loopback `listen`; on any other address the proxy would be an open relay.
  pub forward_cross_origin: Option<bool>,
  /// Where caches, records and logs live (defaults to $XDG_DATA_HOME/mam-offline)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version tag; bump on every deploy so activation drops stale stores
  pub name: String,
  /// Origin-relative paths cached at install time
  pub precache: Vec<String>,
  /// Served for navigations that neither cache nor network can answer
  pub offline_page: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: "mam-center-v1".to_string(),
      precache: [
        "/",
        "/static/js/bundle.js",
        "/static/css/main.css",
        "/manifest.json",
        "/favicon.ico",
        "/logo192.png",
        "/logo512.png",
        "/offline.html",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      offline_page: "/offline.html".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Sync registration tag for queued contact forms
  pub tag: String,
  /// Origin-relative path queued payloads are POSTed to
  pub endpoint: String,
  pub database: String,
  pub version: u32,
  pub store: String,
  /// How often to probe the origin for connectivity
  pub probe_interval_secs: u64,
  /// Minimum gap between sync attempts while records stay queued
  pub retry_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "contact-form-sync".to_string(),
      endpoint: "/api/contact".to_string(),
      database: "MamCenterDB".to_string(),
      version: 1,
      store: "contactForms".to_string(),
      probe_interval_secs: 15,
      retry_interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  pub icon: String,
  pub badge: String,
  /// Body used when a push carries no payload
  pub default_body: String,
  /// Opened when a notification is clicked and no page is open
  pub click_url: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "Mam Center".to_string(),
      icon: "/logo192.png".to_string(),
      badge: "/logo192.png".to_string(),
      default_body: "New message from Mam Center".to_string(),
      click_url: "/".to_string(),
    }
  }
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8790))
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      listen: default_listen(),
      forward_cross_origin: None,
      data_dir: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

/// On-disk locations for one origin.
#[derive(Debug, Clone)]
pub struct StoragePaths {
  /// Response cache stores and the registration record
  pub cache_db: PathBuf,
  /// Directory holding the durable record database
  pub records_dir: PathBuf,
  pub logs_dir: PathBuf,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mam-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mam-offline/config.yaml
  ///
  /// Without any file the built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("mam-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mam-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// The configured origin, required by everything that touches the network.
  pub fn origin(&self) -> Result<&Url> {
    self.origin.as_ref().ok_or_else(|| {
      eyre!("No origin configured. Set `origin` in mam-offline.yaml or pass --origin.")
    })
  }

  /// Whether the proxy relays requests for other origins.
  pub fn forward_cross_origin(&self) -> bool {
    self
      .forward_cross_origin
      .unwrap_or_else(|| self.listen.ip().is_loopback())
  }

  /// Check the invariants the worker relies on.
  pub fn validate(&self) -> Result<()> {
    let origin = self.origin()?;
    if !matches!(origin.scheme(), "http" | "https") || origin.host_str().is_none() {
      return Err(eyre!("Origin must be an http(s) URL with a host: {}", origin));
    }

    for path in &self.cache.precache {
      if !path.starts_with('/') {
        return Err(eyre!("Precache entry must be origin-relative: {}", path));
      }
    }

    if !self.cache.precache.contains(&self.cache.offline_page) {
      return Err(eyre!(
        "Offline page {} must be listed in cache.precache",
        self.cache.offline_page
      ));
    }

    if !is_valid_store_name(&self.sync.store) {
      return Err(eyre!(
        "sync.store must be a plain identifier: {}",
        self.sync.store
      ));
    }

    if self.sync.probe_interval_secs == 0 {
      return Err(eyre!("sync.probe_interval_secs must be at least 1"));
    }

    if !self.sync.endpoint.starts_with('/') {
      return Err(eyre!(
        "sync.endpoint must be origin-relative: {}",
        self.sync.endpoint
      ));
    }

    Ok(())
  }

  /// Storage locations, scoped to the configured origin.
  pub fn storage_paths(&self) -> Result<StoragePaths> {
    let data_dir = match &self.data_dir {
      Some(dir) => dir.clone(),
      None => dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
        .ok_or_else(|| eyre!("Could not determine data directory"))?
        .join("mam-offline"),
    };

    let origin_dir = data_dir.join(origin_slug(self.origin()?));

    Ok(StoragePaths {
      cache_db: origin_dir.join("cache.db"),
      records_dir: origin_dir,
      logs_dir: data_dir.join("logs"),
    })
  }
}

/// Readable, collision-resistant directory name for an origin.
fn origin_slug(origin: &Url) -> String {
  let serialized = origin.origin().ascii_serialization();

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(serialized.as_bytes());
  let digest = hex::encode(hasher.finalize());

  format!(
    "{}-{}",
    origin.host_str().unwrap_or("origin"),
    &digest[..12]
  )
}
