//! Error kinds raised by the offline worker and its stores.

use thiserror::Error;

use crate::worker::WorkerState;

/// A failure to get any response from the network.
///
/// An HTTP error status is still a response and never shows up here.
#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("request to {url} failed: {reason}")]
  Transport { url: String, reason: String },

  #[error("could not build HTTP client: {0}")]
  Client(String),
}

/// Errors surfaced by worker lifecycle, fetch, cache and sync operations.
#[derive(Debug, Error)]
pub enum WorkerError {
  /// A precache asset could not be fetched or stored; the update is discarded.
  #[error("install failed: {0}")]
  Install(String),

  /// Neither cache nor network could answer the request.
  #[error("fetch failed for {url}: {reason}")]
  Fetch { url: String, reason: String },

  #[error("cache write failed: {0}")]
  CacheWrite(String),

  #[error("submission {id} was not accepted: {reason}")]
  SyncSubmission { id: i64, reason: String },

  #[error("failed to open record store: {0}")]
  StoreOpen(String),

  #[error("storage error: {0}")]
  Storage(String),

  #[error("worker cannot move from {from} to {to}")]
  InvalidState { from: WorkerState, to: WorkerState },
}

/// A specialized `Result` type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
