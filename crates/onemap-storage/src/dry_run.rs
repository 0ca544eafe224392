use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onemap_core::{BatchCounts, ImportBatch, StatusChange, StoredRecord};
use tracing::debug;
use uuid::Uuid;

use crate::store::{BatchOutcome, ImportStore, StoreError, WriteMode};

/// Reads go to the wrapped store; every write is logged and dropped.
pub struct DryRunStore {
    inner: Arc<dyn ImportStore>,
}

impl DryRunStore {
    pub fn new(inner: Arc<dyn ImportStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ImportStore for DryRunStore {
    async fn create_batch(&self, batch: &ImportBatch) -> Result<(), StoreError> {
        debug!(batch_id = %batch.id, "dry run: skipping batch insert");
        Ok(())
    }

    async fn complete_batch(&self, id: Uuid, _outcome: &BatchOutcome) -> Result<(), StoreError> {
        debug!(batch_id = %id, "dry run: skipping batch completion");
        Ok(())
    }

    async fn fail_batch(
        &self,
        id: Uuid,
        _counts: &BatchCounts,
        _error: &str,
    ) -> Result<(), StoreError> {
        debug!(batch_id = %id, "dry run: skipping batch failure");
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<ImportBatch>, StoreError> {
        self.inner.get_batch(id).await
    }

    async fn latest_batch(&self) -> Result<Option<ImportBatch>, StoreError> {
        self.inner.latest_batch().await
    }

    async fn list_batches(&self, limit: usize) -> Result<Vec<ImportBatch>, StoreError> {
        self.inner.list_batches(limit).await
    }

    async fn fail_stale_batches(
        &self,
        _started_before: DateTime<Utc>,
        _reason: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        Ok(Vec::new())
    }

    async fn find_in_file(
        &self,
        source_file: &str,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        self.inner.find_in_file(source_file, natural_key).await
    }

    async fn find_latest_prior(
        &self,
        natural_key: &str,
        exclude_source_file: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        self.inner
            .find_latest_prior(natural_key, exclude_source_file)
            .await
    }

    async fn insert_record(&self, record: &StoredRecord) -> Result<(), StoreError> {
        debug!(natural_key = %record.natural_key, source_file = %record.source_file, "dry run: skipping record insert");
        Ok(())
    }

    async fn update_record(&self, record: &StoredRecord) -> Result<(), StoreError> {
        debug!(natural_key = %record.natural_key, record_id = %record.id, "dry run: skipping record update");
        Ok(())
    }

    async fn append_status_changes(&self, changes: &[StatusChange]) -> Result<(), StoreError> {
        debug!(count = changes.len(), "dry run: skipping status history");
        Ok(())
    }

    async fn write_record_with_changes(
        &self,
        record: &StoredRecord,
        mode: WriteMode,
        changes: &[StatusChange],
    ) -> Result<(), StoreError> {
        debug!(
            natural_key = %record.natural_key,
            ?mode,
            changes = changes.len(),
            "dry run: skipping record write"
        );
        Ok(())
    }

    async fn records_for_file(&self, source_file: &str) -> Result<Vec<StoredRecord>, StoreError> {
        self.inner.records_for_file(source_file).await
    }

    async fn status_changes_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<StatusChange>, StoreError> {
        self.inner.status_changes_for_batch(batch_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use onemap_core::MappedRecord;
    use std::io::Write;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("log buffer")).into_owned()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn record(batch_id: Uuid) -> StoredRecord {
        StoredRecord {
            id: Uuid::new_v4(),
            batch_id,
            source_file: "a.xlsx".into(),
            row_number: 3,
            natural_key: "101".into(),
            record: MappedRecord::default(),
            data_quality_score: 0.2,
            content_hash: String::new(),
            imported_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn writes_never_reach_the_inner_store() {
        let inner = Arc::new(MemoryStore::new());
        let dry = DryRunStore::new(inner.clone());
        let batch = ImportBatch::begin(Uuid::new_v4(), "Lawley", "a.xlsx", 1);
        dry.create_batch(&batch).await.unwrap();
        dry.insert_record(&record(batch.id)).await.unwrap();
        dry.write_record_with_changes(&record(batch.id), WriteMode::Insert, &[])
            .await
            .unwrap();

        assert_eq!(inner.batch_count().await, 0);
        assert!(inner.all_records().await.is_empty());
    }

    #[tokio::test]
    async fn skipped_record_writes_are_logged() {
        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dry = DryRunStore::new(Arc::new(MemoryStore::new()));
        let row = record(Uuid::new_v4());
        dry.insert_record(&row).await.unwrap();
        dry.update_record(&row).await.unwrap();
        dry.append_status_changes(&[]).await.unwrap();

        let text = logs.text();
        assert!(text.contains("dry run: skipping record insert"));
        assert!(text.contains("dry run: skipping record update"));
        assert!(text.contains("dry run: skipping status history"));
        assert!(text.contains("natural_key=101"));
    }
}
