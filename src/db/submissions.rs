//! Queued form submissions waiting for connectivity.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::warn;

use super::Database;
use crate::cache::parse_datetime;
use crate::config::SyncConfig;
use crate::error::{Result, WorkerError};

/// A form submission that could not reach the network.
///
/// Records are created once and deleted after delivery; they are never updated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingSubmission {
  pub id: i64,
  pub data: Value,
  pub created_at: DateTime<Utc>,
}

/// One object store of PendingSubmission records.
pub struct SubmissionStore {
  db: Database,
  store: String,
}

impl SubmissionStore {
  /// Open the database and object store named in `sync`.
  pub fn open(dir: &Path, sync: &SyncConfig) -> Result<Self> {
    let db = Database::open(dir, &sync.database, sync.version, &[sync.store.as_str()])?;
    Self::new(db, &sync.store)
  }

  pub fn new(db: Database, store: &str) -> Result<Self> {
    if !db.object_store_names()?.iter().any(|s| s == store) {
      return Err(WorkerError::StoreOpen(format!(
        "object store '{}' does not exist in {} version {}",
        store,
        db.name(),
        db.version()
      )));
    }

    Ok(Self {
      db,
      store: store.to_string(),
    })
  }

  /// Queue a payload. Returns the assigned id.
  pub fn add(&self, data: &Value) -> Result<i64> {
    let conn = self.db.conn()?;
    conn
      .execute(
        &format!("INSERT INTO \"{}\" (data) VALUES (?)", self.store),
        params![data.to_string()],
      )
      .map_err(|e| WorkerError::Storage(format!("Failed to queue submission: {}", e)))?;

    Ok(conn.last_insert_rowid())
  }

  /// All queued submissions in insertion order.
  pub fn get_all(&self) -> Result<Vec<PendingSubmission>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT id, data, created_at FROM \"{}\" ORDER BY id",
        self.store
      ))
      .map_err(|e| WorkerError::Storage(format!("Failed to prepare query: {}", e)))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })
      .map_err(|e| WorkerError::Storage(format!("Failed to read submissions: {}", e)))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| WorkerError::Storage(format!("Failed to read submission: {}", e)))?;

    let mut submissions = Vec::with_capacity(rows.len());
    for (id, data, created_at) in rows {
      match decode(id, &data, &created_at) {
        Ok(submission) => submissions.push(submission),
        Err(e) => warn!(id, error = %e, "Skipping unreadable submission"),
      }
    }

    Ok(submissions)
  }

  #[cfg(test)]
  pub fn get(&self, id: i64) -> Result<Option<PendingSubmission>> {
    use rusqlite::OptionalExtension;

    let conn = self.db.conn()?;
    let row: Option<(String, String)> = conn
      .query_row(
        &format!(
          "SELECT data, created_at FROM \"{}\" WHERE id = ?",
          self.store
        ),
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| WorkerError::Storage(format!("Failed to read submission {}: {}", id, e)))?;

    row
      .map(|(data, created_at)| decode(id, &data, &created_at))
      .transpose()
  }

  /// Remove a submission. Deleting an id that is already gone is a no-op.
  pub fn delete(&self, id: i64) -> Result<bool> {
    let removed = self
      .db
      .conn()?
      .execute(
        &format!("DELETE FROM \"{}\" WHERE id = ?", self.store),
        params![id],
      )
      .map_err(|e| WorkerError::Storage(format!("Failed to delete submission {}: {}", id, e)))?;

    Ok(removed > 0)
  }

  pub fn count(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row(
        &format!("SELECT COUNT(*) FROM \"{}\"", self.store),
        [],
        |row| row.get(0),
      )
      .map_err(|e| WorkerError::Storage(format!("Failed to count submissions: {}", e)))?;

    Ok(count as usize)
  }
}

fn decode(id: i64, data: &str, created_at: &str) -> Result<PendingSubmission> {
  let data = serde_json::from_str(data)
    .map_err(|e| WorkerError::Storage(format!("Failed to deserialize submission {}: {}", id, e)))?;

  Ok(PendingSubmission {
    id,
    data,
    created_at: parse_datetime(created_at)?,
  })
}
