use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onemap_core::{
    BatchCounts, BatchStatus, DeadLetter, ImportBatch, RowIssue, StatusChange, StoredRecord,
};
use thiserror::Error;
use uuid::Uuid;

use crate::{classify_sqlx_error, RetryDisposition};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("batch {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
    },
    #[error("batch {0} not found")]
    BatchNotFound(Uuid),
    #[error("record {0} not found")]
    RecordNotFound(Uuid),
    #[error("record for ({source_file}, {natural_key}) already exists")]
    DuplicateRecord {
        source_file: String,
        natural_key: String,
    },
    #[error("cannot decode stored row: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Database(err) => classify_sqlx_error(err),
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Final numbers recorded on a completed batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub counts: BatchCounts,
    pub dead_letters: Vec<DeadLetter>,
    pub issues_sample: Vec<RowIssue>,
}

/// How a record snapshot lands in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// New `(source_file, natural_key)` row.
    Insert,
    /// Replace the row with the record's id.
    Update,
}

/// Destination for import batches, per-file record snapshots and status history.
#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn create_batch(&self, batch: &ImportBatch) -> Result<(), StoreError>;

    /// `processing -> completed`; any other starting state is an `InvalidTransition`.
    async fn complete_batch(&self, id: Uuid, outcome: &BatchOutcome) -> Result<(), StoreError>;

    /// `processing -> failed`; any other starting state is an `InvalidTransition`.
    async fn fail_batch(
        &self,
        id: Uuid,
        counts: &BatchCounts,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<ImportBatch>, StoreError>;

    async fn latest_batch(&self) -> Result<Option<ImportBatch>, StoreError>;

    /// Most recent first.
    async fn list_batches(&self, limit: usize) -> Result<Vec<ImportBatch>, StoreError>;

    /// Marks batches still `processing` that started before `started_before` as failed.
    async fn fail_stale_batches(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn find_in_file(
        &self,
        source_file: &str,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>, StoreError>;

    /// Latest snapshot of `natural_key` imported from any file other than `exclude_source_file`.
    async fn find_latest_prior(
        &self,
        natural_key: &str,
        exclude_source_file: &str,
    ) -> Result<Option<StoredRecord>, StoreError>;

    async fn insert_record(&self, record: &StoredRecord) -> Result<(), StoreError>;

    async fn update_record(&self, record: &StoredRecord) -> Result<(), StoreError>;

    /// All-or-nothing for the given slice.
    async fn append_status_changes(&self, changes: &[StatusChange]) -> Result<(), StoreError>;

    /// Writes one record snapshot together with the status changes it produced. Either
    /// both land or neither does.
    async fn write_record_with_changes(
        &self,
        record: &StoredRecord,
        mode: WriteMode,
        changes: &[StatusChange],
    ) -> Result<(), StoreError>;

    async fn records_for_file(&self, source_file: &str) -> Result<Vec<StoredRecord>, StoreError>;

    async fn status_changes_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<StatusChange>, StoreError>;
}
