//! Versioned response cache for offline support.
//!
//! This module provides the worker's cache stores:
//! - One named store per worker version, all kept in a single SQLite file per origin
//! - Responses keyed by request identity (method + URL)
//! - A cache-first read path that only writes basic 2xx GET responses
//! - Cache write failures that never block the response path

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub(crate) use storage::parse_datetime;
pub use traits::{CacheResult, CacheSource, RequestKey};
