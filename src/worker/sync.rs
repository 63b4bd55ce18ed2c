//! Background sync of queued form submissions.

use serde::Serialize;
use std::sync::{Arc, PoisonError};
use tracing::{debug, info, warn};

use super::OfflineWorker;
use crate::cache::CacheStorage;
use crate::db::{PendingSubmission, SubmissionStore};
use crate::error::{Result, WorkerError};
use crate::network::{Network, Request};

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub attempted: usize,
  pub delivered: usize,
  /// Records still queued after the pass
  pub remaining: usize,
}

impl<S: CacheStorage, N: Network> OfflineWorker<S, N> {
  /// Handle a sync event. Tags other than the configured one are ignored.
  pub async fn handle_sync(&self, tag: &str) -> Result<Option<SyncReport>> {
    if tag != self.settings.sync.tag {
      debug!(tag, "Ignoring unknown sync tag");
      return Ok(None);
    }
    self.sync_pending().await.map(Some)
  }

  /// Queue a payload for the next sync. Returns the record id.
  pub fn queue_submission(&self, data: &serde_json::Value) -> Result<i64> {
    let store = self.submissions()?;
    let id = store.add(data)?;
    info!(id, "Queued submission for background sync");
    Ok(id)
  }

  /// Number of records waiting for delivery.
  pub fn pending_count(&self) -> Result<usize> {
    self.submissions()?.count()
  }

  /// Try to deliver every queued record once.
  ///
  /// A failed record stays queued and does not stop the others. A record whose
  /// delivery succeeded but whose deletion failed may be sent again later.
  pub async fn sync_pending(&self) -> Result<SyncReport> {
    let store = self.submissions()?;
    let records = store.get_all()?;
    let mut report = SyncReport {
      attempted: records.len(),
      ..SyncReport::default()
    };

    for record in &records {
      match self.submit(record).await {
        Ok(()) => {
          report.delivered += 1;
          match store.delete(record.id) {
            Ok(_) => debug!(id = record.id, "Submission delivered"),
            Err(e) => warn!(id = record.id, error = %e, "Delivered submission could not be removed"),
          }
        }
        Err(e) => warn!(error = %e, "Submission stays queued"),
      }
    }

    report.remaining = store.count()?;
    info!(
      attempted = report.attempted,
      delivered = report.delivered,
      remaining = report.remaining,
      "Background sync finished"
    );
    Ok(report)
  }

  async fn submit(&self, record: &PendingSubmission) -> Result<()> {
    let failed = |reason: String| WorkerError::SyncSubmission {
      id: record.id,
      reason,
    };

    let endpoint = self
      .settings
      .resolve(&self.settings.sync.endpoint)
      .map_err(|e| failed(e.to_string()))?;
    let response = self
      .network
      .fetch(&Request::post_json(endpoint, &record.data))
      .await
      .map_err(|e| failed(e.to_string()))?;

    if !response.is_ok() {
      return Err(failed(format!("endpoint returned status {}", response.status)));
    }
    Ok(())
  }

  fn submissions(&self) -> Result<Arc<SubmissionStore>> {
    let mut slot = self
      .submissions
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if let Some(store) = slot.as_ref() {
      return Ok(Arc::clone(store));
    }

    let store = Arc::new(SubmissionStore::open(
      &self.settings.records_dir,
      &self.settings.sync,
    )?);
    *slot = Some(Arc::clone(&store));
    Ok(store)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::network::Response;
  use crate::testing::{self, MockNetwork};
  use reqwest::Method;
  use serde_json::json;

  fn worker(
    dir: &std::path::Path,
    network: Arc<MockNetwork>,
  ) -> OfflineWorker<SqliteStorage, MockNetwork> {
    OfflineWorker::new(
      testing::settings(dir),
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      network,
    )
  }

  fn contact(name: &str) -> serde_json::Value {
    json!({ "name": name, "email": format!("{}@example.ge", name), "message": "Lesson?" })
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(testing::site());
    let worker = worker(dir.path(), Arc::clone(&network));
    worker.queue_submission(&contact("nino")).unwrap();

    assert_eq!(worker.handle_sync("newsletter-sync").await.unwrap(), None);
    assert_eq!(worker.pending_count().unwrap(), 1);
    assert_eq!(network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_queued_record_survives_reload_until_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(testing::site());

    let id = worker(dir.path(), Arc::clone(&network))
      .queue_submission(&contact("nino"))
      .unwrap();

    // A fresh worker over the same directory sees the record
    let worker = worker(dir.path(), Arc::clone(&network));
    assert_eq!(worker.pending_count().unwrap(), 1);

    let report = worker.handle_sync("contact-form-sync").await.unwrap().unwrap();
    assert_eq!(
      report,
      SyncReport {
        attempted: 1,
        delivered: 1,
        remaining: 0
      }
    );

    let posted = network.calls();
    let post = posted.iter().find(|r| r.method == Method::POST).unwrap();
    assert_eq!(post.url, testing::url("/api/contact"));
    let body: serde_json::Value = serde_json::from_slice(&post.body).unwrap();
    assert_eq!(body, contact("nino"));
    assert!(id > 0);
  }

  #[tokio::test]
  async fn test_rejected_and_offline_submissions_stay_queued() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(testing::site());
    network.route(
      Method::POST,
      &testing::url("/api/contact"),
      Response::new(503, "busy"),
    );
    let worker = worker(dir.path(), Arc::clone(&network));
    worker.queue_submission(&contact("nino")).unwrap();

    let report = worker.sync_pending().await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, 1);

    network.set_online(false);
    let report = worker.sync_pending().await.unwrap();
    assert_eq!(report.remaining, 1);

    // Next sync event after recovery delivers it
    network.set_online(true);
    network.route(
      Method::POST,
      &testing::url("/api/contact"),
      Response::new(201, "created"),
    );
    let report = worker.sync_pending().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(worker.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_one_failure_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(testing::site());
    let worker = worker(dir.path(), Arc::clone(&network));
    worker.queue_submission(&contact("nino")).unwrap();
    worker.queue_submission(&contact("giorgi")).unwrap();
    worker.queue_submission(&contact("tamar")).unwrap();

    network.reject_body_containing("giorgi");
    let report = worker.sync_pending().await.unwrap();

    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.remaining, 1);

    let store = worker.submissions().unwrap();
    let left = store.get_all().unwrap();
    assert_eq!(left[0].data, contact("giorgi"));
  }

  #[tokio::test]
  async fn test_record_store_opened_once() {
    let dir = tempfile::tempdir().unwrap();
    let worker = worker(dir.path(), Arc::new(testing::site()));

    let first = worker.submissions().unwrap();
    worker.queue_submission(&contact("nino")).unwrap();
    assert_eq!(worker.pending_count().unwrap(), 1);

    assert!(Arc::ptr_eq(&first, &worker.submissions().unwrap()));
  }

  #[tokio::test]
  async fn test_empty_queue_makes_no_requests() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(testing::site());
    let worker = worker(dir.path(), Arc::clone(&network));

    let report = worker.sync_pending().await.unwrap();
    assert_eq!(report, SyncReport::default());
    assert_eq!(network.call_count(), 0);
  }
}
