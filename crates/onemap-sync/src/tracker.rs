use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use onemap_core::{BatchCounts, ImportBatch};
use onemap_storage::{with_retry, BackoffPolicy, BatchOutcome, ImportStore};
use tracing::{info, warn};
use uuid::Uuid;

/// Batch lifecycle over an [`ImportStore`]: `processing` on begin, then exactly one of
/// `completed` or `failed`.
#[derive(Clone)]
pub struct BatchTracker {
    store: Arc<dyn ImportStore>,
    retry: BackoffPolicy,
}

impl BatchTracker {
    pub fn new(store: Arc<dyn ImportStore>, retry: BackoffPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn begin(&self, batch: &ImportBatch) -> Result<Uuid> {
        with_retry(&self.retry, "create_batch", || self.store.create_batch(batch))
            .await
            .with_context(|| format!("creating import batch {}", batch.id))?;
        info!(batch_id = %batch.id, source_file = %batch.source_file, total_rows = batch.counts.total_rows, "import batch started");
        Ok(batch.id)
    }

    pub async fn complete(&self, id: Uuid, outcome: &BatchOutcome) -> Result<()> {
        with_retry(&self.retry, "complete_batch", || {
            self.store.complete_batch(id, outcome)
        })
        .await
        .with_context(|| format!("completing import batch {id}"))?;
        info!(batch_id = %id, processed = outcome.counts.processed_rows, errors = outcome.counts.error_rows, "import batch completed");
        Ok(())
    }

    pub async fn fail(&self, id: Uuid, counts: &BatchCounts, error: &str) -> Result<()> {
        with_retry(&self.retry, "fail_batch", || {
            self.store.fail_batch(id, counts, error)
        })
        .await
        .with_context(|| format!("marking import batch {id} failed"))?;
        warn!(batch_id = %id, error, "import batch failed");
        Ok(())
    }

    /// Fails batches left in `processing` for longer than `older_than_hours`.
    pub async fn recover_stale(&self, older_than_hours: i64) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - Duration::hours(older_than_hours.max(0));
        let reason = format!("abandoned: still processing after {older_than_hours}h");
        let failed = with_retry(&self.retry, "fail_stale_batches", || {
            self.store.fail_stale_batches(cutoff, &reason)
        })
        .await
        .context("recovering stale import batches")?;
        for id in &failed {
            warn!(batch_id = %id, "stale import batch marked failed");
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemap_core::BatchStatus;
    use onemap_storage::MemoryStore;

    #[tokio::test]
    async fn complete_then_fail_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let tracker = BatchTracker::new(store.clone(), BackoffPolicy::no_delay(0));
        let batch = ImportBatch::begin(Uuid::new_v4(), "Lawley", "a.xlsx", 3);
        let id = tracker.begin(&batch).await.expect("begin");
        tracker
            .complete(id, &BatchOutcome::default())
            .await
            .expect("complete");

        let err = tracker
            .fail(id, &BatchCounts::default(), "late")
            .await
            .expect_err("terminal batches stay terminal");
        assert!(format!("{err:#}").contains("cannot move from completed to failed"));
        let stored = store.get_batch(id).await.expect("get").expect("batch");
        assert_eq!(stored.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn recover_fails_only_old_processing_batches() {
        let store = Arc::new(MemoryStore::new());
        let tracker = BatchTracker::new(store.clone(), BackoffPolicy::no_delay(0));
        let mut old = ImportBatch::begin(Uuid::new_v4(), "Lawley", "old.xlsx", 1);
        old.import_started = Utc::now() - Duration::hours(30);
        tracker.begin(&old).await.expect("begin old");
        let fresh = ImportBatch::begin(Uuid::new_v4(), "Lawley", "fresh.xlsx", 1);
        tracker.begin(&fresh).await.expect("begin fresh");

        let failed = tracker.recover_stale(24).await.expect("recover");
        assert_eq!(failed, vec![old.id]);
        let old = store.get_batch(old.id).await.expect("get").expect("batch");
        assert_eq!(old.status, BatchStatus::Failed);
        assert!(old.error_details.unwrap_or_default().contains("24h"));
    }
}
