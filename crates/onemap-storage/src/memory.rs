//! In-process store with the same contract as the PostgreSQL store.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onemap_core::{BatchCounts, BatchStatus, ImportBatch, StatusChange, StoredRecord};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{BatchOutcome, ImportStore, StoreError, WriteMode};

#[derive(Debug, Default)]
struct MemoryState {
    batches: Vec<ImportBatch>,
    records: Vec<StoredRecord>,
    changes: Vec<StatusChange>,
    transient_write_failures: u32,
    rejected_keys: HashSet<String>,
    transient_history_failures: u32,
    reject_history: bool,
    lost_acks: u32,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` record writes fail with a retryable error.
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.transient_write_failures = count;
    }

    /// Record writes for `natural_key` are permanently rejected.
    pub async fn reject_key(&self, natural_key: impl Into<String>) {
        self.state.lock().await.rejected_keys.insert(natural_key.into());
    }

    /// The next `count` status history writes fail with a retryable error.
    pub async fn fail_next_status_changes(&self, count: u32) {
        self.state.lock().await.transient_history_failures = count;
    }

    /// Status history writes are permanently rejected while `reject` is set.
    pub async fn reject_status_changes(&self, reject: bool) {
        self.state.lock().await.reject_history = reject;
    }

    /// The next `count` record writes are applied but report a retryable error, as when
    /// the connection drops after the commit.
    pub async fn lose_next_acks(&self, count: u32) {
        self.state.lock().await.lost_acks = count;
    }

    pub async fn all_records(&self) -> Vec<StoredRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn all_status_changes(&self) -> Vec<StatusChange> {
        self.state.lock().await.changes.clone()
    }

    pub async fn batch_count(&self) -> usize {
        self.state.lock().await.batches.len()
    }
}

impl MemoryState {
    fn check_write(&mut self, natural_key: &str) -> Result<(), StoreError> {
        if self.rejected_keys.contains(natural_key) {
            return Err(StoreError::Rejected(format!(
                "record {natural_key} violates a destination constraint"
            )));
        }
        if self.transient_write_failures > 0 {
            self.transient_write_failures -= 1;
            return Err(StoreError::Unavailable("simulated connection reset".into()));
        }
        Ok(())
    }

    fn check_history(&mut self) -> Result<(), StoreError> {
        if self.reject_history {
            return Err(StoreError::Rejected(
                "status history violates a destination constraint".into(),
            ));
        }
        if self.transient_history_failures > 0 {
            self.transient_history_failures -= 1;
            return Err(StoreError::Unavailable("simulated connection reset".into()));
        }
        Ok(())
    }

    /// Index of the row an update replaces, `None` for an insert.
    fn locate(&self, record: &StoredRecord, mode: WriteMode) -> Result<Option<usize>, StoreError> {
        match mode {
            WriteMode::Insert => {
                if self
                    .records
                    .iter()
                    .any(|r| r.source_file == record.source_file && r.natural_key == record.natural_key)
                {
                    return Err(StoreError::DuplicateRecord {
                        source_file: record.source_file.clone(),
                        natural_key: record.natural_key.clone(),
                    });
                }
                Ok(None)
            }
            WriteMode::Update => self
                .records
                .iter()
                .position(|r| r.id == record.id)
                .map(Some)
                .ok_or(StoreError::RecordNotFound(record.id)),
        }
    }

    /// Updates keep the original `imported_at`.
    fn put(&mut self, record: &StoredRecord, slot: Option<usize>) {
        match slot {
            None => self.records.push(record.clone()),
            Some(index) => {
                let imported_at = self.records[index].imported_at;
                self.records[index] = StoredRecord {
                    imported_at,
                    ..record.clone()
                };
            }
        }
    }

    fn acknowledge(&mut self) -> Result<(), StoreError> {
        if self.lost_acks > 0 {
            self.lost_acks -= 1;
            return Err(StoreError::Unavailable("connection reset after commit".into()));
        }
        Ok(())
    }

    fn batch_mut(&mut self, id: Uuid, to: BatchStatus) -> Result<&mut ImportBatch, StoreError> {
        let batch = self
            .batches
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or(StoreError::BatchNotFound(id))?;
        batch.status = batch
            .status
            .transition(to)
            .map_err(|e| StoreError::InvalidTransition {
                id,
                from: e.from,
                to: e.to,
            })?;
        Ok(batch)
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn create_batch(&self, batch: &ImportBatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.batches.iter().any(|b| b.id == batch.id) {
            return Err(StoreError::Rejected(format!("batch {} already exists", batch.id)));
        }
        state.batches.push(batch.clone());
        Ok(())
    }

    async fn complete_batch(&self, id: Uuid, outcome: &BatchOutcome) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let batch = state.batch_mut(id, BatchStatus::Completed)?;
        batch.counts = outcome.counts;
        batch.dead_letters = outcome.dead_letters.clone();
        batch.issues_sample = outcome.issues_sample.clone();
        batch.import_completed = Some(Utc::now());
        Ok(())
    }

    async fn fail_batch(
        &self,
        id: Uuid,
        counts: &BatchCounts,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let batch = state.batch_mut(id, BatchStatus::Failed)?;
        batch.counts = *counts;
        batch.error_details = Some(error.to_string());
        batch.import_completed = Some(Utc::now());
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<ImportBatch>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.batches.iter().find(|b| b.id == id).cloned())
    }

    async fn latest_batch(&self) -> Result<Option<ImportBatch>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.batches.last().cloned())
    }

    async fn list_batches(&self, limit: usize) -> Result<Vec<ImportBatch>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.batches.iter().rev().take(limit).cloned().collect())
    }

    async fn fail_stale_batches(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut failed = Vec::new();
        for batch in state
            .batches
            .iter_mut()
            .filter(|b| b.status == BatchStatus::Processing && b.import_started < started_before)
        {
            batch.status = BatchStatus::Failed;
            batch.error_details = Some(reason.to_string());
            batch.import_completed = Some(now);
            failed.push(batch.id);
        }
        Ok(failed)
    }

    async fn find_in_file(
        &self,
        source_file: &str,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .find(|r| r.source_file == source_file && r.natural_key == natural_key)
            .cloned())
    }

    async fn find_latest_prior(
        &self,
        natural_key: &str,
        exclude_source_file: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.natural_key == natural_key && r.source_file != exclude_source_file)
            .max_by_key(|r| r.imported_at)
            .cloned())
    }

    async fn insert_record(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_write(&record.natural_key)?;
        let slot = state.locate(record, WriteMode::Insert)?;
        state.put(record, slot);
        state.acknowledge()
    }

    async fn update_record(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_write(&record.natural_key)?;
        let slot = state.locate(record, WriteMode::Update)?;
        state.put(record, slot);
        state.acknowledge()
    }

    async fn append_status_changes(&self, changes: &[StatusChange]) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state.check_history()?;
        state.changes.extend_from_slice(changes);
        Ok(())
    }

    async fn write_record_with_changes(
        &self,
        record: &StoredRecord,
        mode: WriteMode,
        changes: &[StatusChange],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_write(&record.natural_key)?;
        let slot = state.locate(record, mode)?;
        if !changes.is_empty() {
            state.check_history()?;
        }
        state.put(record, slot);
        state.changes.extend_from_slice(changes);
        state.acknowledge()
    }

    async fn records_for_file(&self, source_file: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.source_file == source_file)
            .cloned()
            .collect())
    }

    async fn status_changes_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<StatusChange>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .changes
            .iter()
            .filter(|c| c.batch_id == batch_id)
            .cloned()
            .collect())
    }
}
