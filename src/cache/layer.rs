//! Cache layer that orchestrates caching logic with network fetching.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use super::storage::{CacheStorage, CachedEntry};
use super::traits::{CacheResult, RequestKey};
use crate::error::NetworkError;
use crate::network::{Response, ResponseType};

/// Cache-first access to a single named store.
///
/// This layer sits between the worker and the network. Writing to the cache
/// is a side effect of a successful fetch and never fails the fetch itself.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  cache_name: String,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a cache layer over the store called `cache_name`.
  pub fn new(storage: Arc<S>, cache_name: impl Into<String>) -> Self {
    Self {
      storage,
      cache_name: cache_name.into(),
    }
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Look up a stored response. A failing read counts as a miss.
  pub fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    match self.storage.match_request(&self.cache_name, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(cache = %self.cache_name, request = %key, error = %e, "Cache read failed");
        None
      }
    }
  }

  /// Store a response if it is cacheable. Returns whether it was written.
  pub fn store(&self, key: &RequestKey, response: &Response) -> bool {
    if !is_cacheable(response) {
      return false;
    }

    match self.storage.put(&self.cache_name, key, response) {
      Ok(()) => true,
      Err(e) => {
        warn!(cache = %self.cache_name, request = %key, error = %e, "Cache write failed");
        false
      }
    }
  }

  /// Fetch with a cache-first strategy.
  ///
  /// 1. Check cache - on a hit, return immediately without touching the network
  /// 2. On a miss, fetch from network
  /// 3. Store a copy of basic 2xx responses, return everything else untouched
  pub async fn fetch<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>, NetworkError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, NetworkError>>,
  {
    if let Some(cached) = self.lookup(key) {
      debug!(request = %key, "Serving from cache");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = fetcher().await?;
    if self.store(key, &response) {
      debug!(request = %key, status = response.status, "Cached network response");
    }
    Ok(CacheResult::from_network(response))
  }
}

/// Only successful, same-origin, non-redirected responses are cached.
fn is_cacheable(response: &Response) -> bool {
  response.is_ok() && response.kind == ResponseType::Basic
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      cache_name: self.cache_name.clone(),
    }
  }
}
