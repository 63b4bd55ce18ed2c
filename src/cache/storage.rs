//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::RequestKey;
use crate::error::{Result, WorkerError};
use crate::network::{Response, ResponseType};

/// A stored response with its write time.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// A family of named response stores, one per worker version.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist.
  fn open(&self, cache_name: &str) -> Result<()>;

  /// Names of all stores, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  fn has(&self, cache_name: &str) -> Result<bool>;

  /// Delete a store and everything in it. Returns false if it did not exist.
  fn delete(&self, cache_name: &str) -> Result<bool>;

  /// Store a response, replacing any previous one for the same key.
  fn put(&self, cache_name: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store all entries or none of them.
  fn put_all(&self, cache_name: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Look up a stored response.
  fn match_request(&self, cache_name: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Number of entries in a store.
  fn len(&self, cache_name: &str) -> Result<usize>;
}

/// SQLite-based cache storage, one database per origin.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        WorkerError::Storage(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      WorkerError::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// In-memory storage, gone when dropped.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| WorkerError::Storage(format!("Failed to open in-memory cache: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| WorkerError::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(storage("Failed to run cache migrations"))
  }

  /// Cache name of the currently active worker, if any.
  pub fn active_registration(&self) -> Result<Option<String>> {
    self
      .lock()?
      .query_row(
        "SELECT active_cache FROM registration WHERE id = 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(storage("Failed to read registration"))
  }

  /// Record `cache_name` as the active worker version.
  pub fn set_active_registration(&self, cache_name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO registration (id, active_cache, activated_at)
         VALUES (1, ?, datetime('now'))",
        params![cache_name],
      )
      .map_err(storage("Failed to write registration"))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named stores, one per worker version
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    response_type TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

-- Active worker version
CREATE TABLE IF NOT EXISTS registration (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active_cache TEXT NOT NULL,
    activated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn storage(context: &'static str) -> impl Fn(rusqlite::Error) -> WorkerError {
  move |e| WorkerError::Storage(format!("{}: {}", context, e))
}

fn cache_write(context: &'static str) -> impl Fn(rusqlite::Error) -> WorkerError {
  move |e| WorkerError::CacheWrite(format!("{}: {}", context, e))
}

/// Headers a basic filtered response never exposes, so they are never stored.
///
/// A stored `set-cookie` would be replayed to every later client.
fn is_forbidden_response_header(name: &str) -> bool {
  name.eq_ignore_ascii_case("set-cookie") || name.eq_ignore_ascii_case("set-cookie2")
}

/// Reject what the browser Cache API refuses to store.
fn check_storable(key: &RequestKey, response: &Response) -> Result<()> {
  if !key.is_get() {
    return Err(WorkerError::CacheWrite(format!(
      "only GET requests can be cached, got {}",
      key
    )));
  }
  if response.status == 206 {
    return Err(WorkerError::CacheWrite(format!(
      "partial response for {} cannot be cached",
      key
    )));
  }
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  cache_name: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let stored: Vec<&(String, String)> = response
    .headers
    .iter()
    .filter(|(name, _)| !is_forbidden_response_header(name))
    .collect();
  let headers = serde_json::to_string(&stored)
    .map_err(|e| WorkerError::CacheWrite(format!("Failed to serialize headers: {}", e)))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![cache_name],
    )
    .map_err(cache_write("Failed to create cache store"))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, status, headers, body, response_type, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache_name,
        key.to_string(),
        response.status,
        headers,
        response.body,
        response.kind.as_str()
      ],
    )
    .map_err(cache_write("Failed to store response"))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
        params![cache_name],
      )
      .map_err(storage("Failed to open cache store"))?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY rowid")
      .map_err(storage("Failed to prepare query"))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(storage("Failed to list cache stores"))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(storage("Failed to read cache store name"))?;

    Ok(names)
  }

  fn has(&self, cache_name: &str) -> Result<bool> {
    let found: Option<i64> = self
      .lock()?
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .optional()
      .map_err(storage("Failed to look up cache store"))?;
    Ok(found.is_some())
  }

  fn delete(&self, cache_name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(storage("Failed to begin transaction"))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache_name],
    )
    .map_err(storage("Failed to delete cache entries"))?;
    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![cache_name])
      .map_err(storage("Failed to delete cache store"))?;

    tx.commit()
      .map_err(storage("Failed to commit transaction"))?;

    Ok(removed > 0)
  }

  fn put(&self, cache_name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    check_storable(key, response)?;
    let conn = self.lock()?;
    insert_entry(&conn, cache_name, key, response)
  }

  fn put_all(&self, cache_name: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    for (key, response) in entries {
      check_storable(key, response)?;
    }

    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(cache_write("Failed to begin transaction"))?;

    for (key, response) in entries {
      insert_entry(&tx, cache_name, key, response)?;
    }

    tx.commit()
      .map_err(cache_write("Failed to commit transaction"))?;

    Ok(())
  }

  fn match_request(&self, cache_name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT status, headers, body, response_type, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![cache_name, key.to_string()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(storage("Failed to look up cached response"))?;

    let Some((status, headers, body, kind, cached_at)) = row else {
      return Ok(None);
    };

    let headers = serde_json::from_str(&headers)
      .map_err(|e| WorkerError::Storage(format!("Failed to deserialize headers: {}", e)))?;
    let kind = ResponseType::parse(&kind)
      .ok_or_else(|| WorkerError::Storage(format!("Unknown response type '{}'", kind)))?;

    Ok(Some(CachedEntry {
      response: Response {
        status,
        headers,
        body,
        kind,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn len(&self, cache_name: &str) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .map_err(storage("Failed to count cache entries"))?;
    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| WorkerError::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}
