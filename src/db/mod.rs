//! Durable, versioned record store for work that must survive restarts.

pub mod schema;
mod submissions;

pub use submissions::{PendingSubmission, SubmissionStore};

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::error::{Result, WorkerError};

/// Database connection wrapper with a name and a schema version.
pub struct Database {
  conn: Mutex<Connection>,
  name: String,
  version: u32,
}

impl Database {
  /// Open or create `<dir>/<name>.db` at `version`.
  ///
  /// When the stored version is older, `stores` are created (if absent) and the
  /// version is bumped. Opening at a version older than the stored one fails.
  pub fn open(dir: &Path, name: &str, version: u32, stores: &[&str]) -> Result<Self> {
    std::fs::create_dir_all(dir)
      .map_err(|e| WorkerError::StoreOpen(format!("Failed to create database directory: {}", e)))?;

    let path = dir.join(format!("{}.db", name));
    let conn = Connection::open(&path).map_err(|e| {
      WorkerError::StoreOpen(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    let db = Self {
      conn: Mutex::new(conn),
      name: name.to_string(),
      version,
    };
    db.run_migrations(stores)?;

    Ok(db)
  }

  /// Bring the schema up to `self.version`.
  fn run_migrations(&self, stores: &[&str]) -> Result<()> {
    let open_err = |e: rusqlite::Error| WorkerError::StoreOpen(format!("{}: {}", self.name, e));
    let conn = self.conn()?;

    conn.execute_batch(schema::SCHEMA).map_err(open_err)?;

    let current: u32 = conn
      .pragma_query_value(None, "user_version", |row| row.get(0))
      .map_err(open_err)?;

    if current > self.version {
      return Err(WorkerError::StoreOpen(format!(
        "{} is at version {}, cannot open it at version {}",
        self.name, current, self.version
      )));
    }

    if current < self.version {
      let tx = conn.unchecked_transaction().map_err(open_err)?;
      for store in stores {
        if !schema::is_valid_store_name(store) {
          return Err(WorkerError::StoreOpen(format!(
            "invalid object store name '{}'",
            store
          )));
        }
        tx.execute_batch(&schema::object_store_table(store))
          .map_err(open_err)?;
      }
      tx.pragma_update(None, "user_version", self.version)
        .map_err(open_err)?;
      tx.commit().map_err(open_err)?;

      info!(database = %self.name, from = current, to = self.version, "Upgraded record database");
    }

    Ok(())
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  /// Names of the object stores created so far.
  pub fn object_store_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM object_stores ORDER BY rowid")
      .map_err(|e| WorkerError::Storage(format!("Failed to prepare query: {}", e)))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| WorkerError::Storage(format!("Failed to list object stores: {}", e)))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| WorkerError::Storage(format!("Failed to read object store name: {}", e)))?;

    Ok(names)
  }

  /// Get a locked handle to the connection
  pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| WorkerError::Storage(format!("Lock poisoned: {}", e)))
  }
}
