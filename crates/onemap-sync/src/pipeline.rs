use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use onemap_core::{
    BatchCounts, BatchStatus, DeadLetter, ImportBatch, IssueKind, MappedRecord, RawImportRecord,
    RowIssue, StatusChange, StoredRecord, UnmappedColumn,
};
use onemap_source::{read_snapshot, ColumnMapping, SourceSnapshot, UnmappedPolicy};
use onemap_storage::{
    with_retry, ArtifactStore, BackoffPolicy, BatchOutcome, DryRunStore, ImportStore,
    RetryExhausted, StoreError, WriteMode,
};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::policy::{CanonicalPolicy, EntityOutcome, ReconciliationPolicy, RecordWrite};
use crate::tracker::BatchTracker;
use crate::ImportConfig;

/// Progress is logged once per this many rows.
pub const PROGRESS_INTERVAL: usize = 100;

/// Row issues kept on the batch row; the full list stays on the summary.
pub const ISSUE_SAMPLE_LIMIT: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub batch_id: Option<Uuid>,
    pub unmapped_policy: UnmappedPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub batch_id: Uuid,
    pub source_file: String,
    pub source_sha256: String,
    pub artifact_path: Option<String>,
    pub dry_run: bool,
    pub status: BatchStatus,
    pub counts: BatchCounts,
    pub unmapped_columns: Vec<UnmappedColumn>,
    pub issues: Vec<RowIssue>,
    pub dead_letters: Vec<DeadLetter>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct ImportPipeline {
    store: Arc<dyn ImportStore>,
    artifacts: ArtifactStore,
    mapping: ColumnMapping,
    policy: Box<dyn ReconciliationPolicy>,
    retry: BackoffPolicy,
    project_name: String,
}

/// Mutable state of one run over the rows of a snapshot.
struct RowPass<'a> {
    store: &'a dyn ImportStore,
    batch_id: Uuid,
    source_file: &'a str,
    counts: BatchCounts,
    issues: Vec<RowIssue>,
    dead_letters: Vec<DeadLetter>,
    first_rows: HashMap<String, u32>,
}

impl ImportPipeline {
    pub fn new(config: &ImportConfig, store: Arc<dyn ImportStore>, mapping: ColumnMapping) -> Self {
        Self {
            store,
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            mapping,
            policy: Box::new(CanonicalPolicy),
            retry: config.retry,
            project_name: config.project_name.clone(),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn ReconciliationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    pub async fn load_snapshot(&self, path: &Path) -> Result<SourceSnapshot> {
        let owned = path.to_path_buf();
        let mapping = self.mapping.clone();
        tokio::task::spawn_blocking(move || read_snapshot(&owned, &mapping))
            .await
            .context("joining source reader task")?
            .with_context(|| format!("reading source file {}", path.display()))
    }

    pub async fn run(&self, path: impl AsRef<Path>, options: &ImportOptions) -> Result<ImportSummary> {
        let path = path.as_ref();
        let started_at = Utc::now();
        let mut snapshot = self.load_snapshot(path).await?;
        if let Some(limit) = options.limit {
            snapshot.truncate(limit);
        }

        let store: Arc<dyn ImportStore> = if options.dry_run {
            Arc::new(DryRunStore::new(self.store.clone()))
        } else {
            self.store.clone()
        };
        let tracker = BatchTracker::new(store.clone(), self.retry);

        let (source_sha256, artifact_path) = self.archive_source(path, started_at, options).await?;

        let batch_id = options.batch_id.unwrap_or_else(Uuid::new_v4);
        let total_rows = snapshot.total_rows() as u32;
        let mut batch = ImportBatch::begin(
            batch_id,
            self.project_name.clone(),
            snapshot.source_file.clone(),
            total_rows,
        );
        batch.source_sha256 = Some(source_sha256.clone());
        batch.artifact_path = artifact_path.clone();
        batch.mapping_name = self.mapping.name.clone();
        batch.mapping_version = self.mapping.version.clone();
        batch.unmapped_columns = self.mapping.unmapped_columns(&snapshot.headers);

        let span = info_span!(
            "import_batch",
            batch_id = %batch_id,
            source_file = %snapshot.source_file,
            policy = self.policy.name(),
            dry_run = options.dry_run
        );
        async move {
            tracker.begin(&batch).await?;

            let result = self
                .process_rows(store.as_ref(), &batch, &snapshot, options)
                .await;
            let (outcome, issues) = match result {
                Ok(done) => done,
                Err(err) => {
                    let counts = BatchCounts {
                        total_rows,
                        ..Default::default()
                    };
                    if let Err(fail_err) = tracker.fail(batch_id, &counts, &format!("{err:#}")).await {
                        warn!(error = %fail_err, "could not mark batch failed");
                    }
                    return Err(err);
                }
            };

            if let Err(err) = tracker.complete(batch_id, &outcome).await {
                if let Err(fail_err) = tracker
                    .fail(batch_id, &outcome.counts, &format!("{err:#}"))
                    .await
                {
                    warn!(error = %fail_err, "could not mark batch failed");
                }
                return Err(err);
            }

            Ok::<_, anyhow::Error>(ImportSummary {
                batch_id,
                source_file: snapshot.source_file.clone(),
                source_sha256,
                artifact_path,
                dry_run: options.dry_run,
                status: BatchStatus::Completed,
                counts: outcome.counts,
                unmapped_columns: batch.unmapped_columns.clone(),
                issues,
                dead_letters: outcome.dead_letters,
                started_at,
                finished_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }

    async fn archive_source(
        &self,
        path: &Path,
        captured_at: DateTime<Utc>,
        options: &ImportOptions,
    ) -> Result<(String, Option<String>)> {
        if options.dry_run {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading source file {}", path.display()))?;
            return Ok((ArtifactStore::sha256_hex(&bytes), None));
        }
        let archived = self
            .artifacts
            .archive_file(captured_at, &self.project_name, path)
            .await?;
        if archived.deduplicated {
            info!(path = %archived.relative_path.display(), "source already archived");
        }
        Ok((
            archived.content_hash,
            Some(archived.relative_path.display().to_string()),
        ))
    }

    async fn process_rows(
        &self,
        store: &dyn ImportStore,
        batch: &ImportBatch,
        snapshot: &SourceSnapshot,
        options: &ImportOptions,
    ) -> Result<(BatchOutcome, Vec<RowIssue>)> {
        self.mapping
            .check_unmapped(&snapshot.headers, options.unmapped_policy)
            .context("checking source columns against the mapping")?;
        for column in &batch.unmapped_columns {
            warn!(
                header = %column.header,
                suggestion = column.suggestion.as_deref().unwrap_or("-"),
                "unmapped source column kept in extras"
            );
        }

        let mut pass = RowPass {
            store,
            batch_id: batch.id,
            source_file: &snapshot.source_file,
            counts: batch.counts,
            issues: Vec::new(),
            dead_letters: Vec::new(),
            first_rows: HashMap::new(),
        };

        let total = snapshot.rows.len();
        for (index, raw) in snapshot.rows.iter().enumerate() {
            self.process_row(&mut pass, raw).await;
            if (index + 1) % PROGRESS_INTERVAL == 0 {
                info!(
                    rows = index + 1,
                    total,
                    new = pass.counts.new_entities,
                    updated = pass.counts.updated_entities,
                    errors = pass.counts.error_rows,
                    "import progress"
                );
            }
        }

        let counts = &mut pass.counts;
        counts.processed_rows = counts.new_entities + counts.updated_entities + counts.unchanged_entities;
        counts.dead_letters = pass.dead_letters.len() as u32;

        let issues_sample = pass.issues.iter().take(ISSUE_SAMPLE_LIMIT).cloned().collect();
        let outcome = BatchOutcome {
            counts: pass.counts,
            dead_letters: pass.dead_letters,
            issues_sample,
        };
        Ok((outcome, pass.issues))
    }

    async fn process_row(&self, pass: &mut RowPass<'_>, raw: &RawImportRecord) {
        let record = self.mapping.map_row(raw);
        for issue in &record.issues {
            pass.issues.push(RowIssue {
                row_number: raw.row_number,
                natural_key: record.natural_key.clone(),
                kind: IssueKind::Coercion {
                    field: issue.field.clone(),
                    raw_value: issue.raw_value.clone(),
                },
                message: format!(
                    "{} value {:?} is not a valid {}",
                    issue.source_header, issue.raw_value, issue.expected
                ),
            });
        }

        let Some(key) = record.natural_key.clone() else {
            pass.counts.error_rows += 1;
            pass.issues.push(RowIssue {
                row_number: raw.row_number,
                natural_key: None,
                kind: IssueKind::MissingNaturalKey,
                message: format!("row has no {}", self.mapping.natural_key),
            });
            return;
        };

        if let Some(first_row) = pass.first_rows.get(&key) {
            pass.counts.duplicate_rows += 1;
            pass.issues.push(RowIssue {
                row_number: raw.row_number,
                natural_key: Some(key.clone()),
                kind: IssueKind::DuplicateInFile {
                    first_row: *first_row,
                },
                message: format!("{key} already imported from row {first_row}"),
            });
            return;
        }
        pass.first_rows.insert(key.clone(), raw.row_number);

        match self.reconcile_row(pass, raw, &key, record).await {
            Ok((outcome, changes)) => {
                match outcome {
                    EntityOutcome::New => pass.counts.new_entities += 1,
                    EntityOutcome::Updated => pass.counts.updated_entities += 1,
                    EntityOutcome::Unchanged => pass.counts.unchanged_entities += 1,
                }
                pass.counts.status_changes += changes;
            }
            Err(failure) => {
                warn!(row = raw.row_number, key = %key, error = %failure.error, attempts = failure.attempts, "row dead-lettered");
                pass.counts.error_rows += 1;
                pass.issues.push(RowIssue {
                    row_number: raw.row_number,
                    natural_key: Some(key.clone()),
                    kind: IssueKind::WriteFailed,
                    message: failure.error.to_string(),
                });
                pass.dead_letters.push(DeadLetter {
                    row_number: raw.row_number,
                    natural_key: Some(key),
                    error: format!("{}: {}", failure.operation, failure.error),
                    attempts: failure.attempts,
                });
            }
        }
    }

    /// Applies the policy to one keyed row; returns the outcome and the number of
    /// status changes appended.
    async fn reconcile_row(
        &self,
        pass: &RowPass<'_>,
        raw: &RawImportRecord,
        key: &str,
        record: MappedRecord,
    ) -> Result<(EntityOutcome, u32), RetryExhausted> {
        let store = pass.store;
        let source_file = pass.source_file;

        let same_file = with_retry(&self.retry, "find_in_file", || {
            store.find_in_file(source_file, key)
        })
        .await?;
        let prior = if same_file.is_none() {
            with_retry(&self.retry, "find_latest_prior", || {
                store.find_latest_prior(key, source_file)
            })
            .await?
        } else {
            None
        };

        let content_hash = record.content_hash();
        let decision = self.policy.reconcile(
            &record,
            &content_hash,
            same_file.as_ref(),
            prior.as_ref(),
            &self.mapping.tracked_fields,
        );

        let now = Utc::now();
        let changes: Vec<StatusChange> = decision
            .changes
            .into_iter()
            .map(|diff| StatusChange {
                entity_id: key.to_string(),
                field_name: diff.field_name,
                old_value: diff.old_value,
                new_value: diff.new_value,
                change_date: now,
                source_file: source_file.to_string(),
                previous_source_file: decision.previous_source_file.clone(),
                batch_id: pass.batch_id,
            })
            .collect();

        let (id, mode, imported_at) = match decision.write {
            RecordWrite::Skip => {
                if !changes.is_empty() {
                    with_retry(&self.retry, "append_status_changes", || {
                        store.append_status_changes(&changes)
                    })
                    .await?;
                }
                return Ok((decision.outcome, changes.len() as u32));
            }
            RecordWrite::Insert => (Uuid::new_v4(), WriteMode::Insert, now),
            RecordWrite::Update(id) => (
                id,
                WriteMode::Update,
                same_file.as_ref().map(|r| r.imported_at).unwrap_or(now),
            ),
        };
        let stored = StoredRecord {
            id,
            batch_id: pass.batch_id,
            source_file: source_file.to_string(),
            row_number: raw.row_number,
            natural_key: key.to_string(),
            data_quality_score: self.mapping.quality_weights().score(&record),
            record,
            content_hash,
            imported_at,
            updated_at: now,
        };
        self.write_record(store, &stored, mode, &changes).await?;

        Ok((decision.outcome, changes.len() as u32))
    }

    /// One atomic write of the record and its changes. An insert retried after a commit
    /// whose acknowledgement was lost comes back as a duplicate of itself, which counts
    /// as written.
    async fn write_record(
        &self,
        store: &dyn ImportStore,
        stored: &StoredRecord,
        mode: WriteMode,
        changes: &[StatusChange],
    ) -> Result<(), RetryExhausted> {
        let failure = match with_retry(&self.retry, "write_record", || {
            store.write_record_with_changes(stored, mode, changes)
        })
        .await
        {
            Ok(()) => return Ok(()),
            Err(failure) => failure,
        };
        let retried_insert = mode == WriteMode::Insert
            && failure.attempts > 1
            && matches!(failure.error, StoreError::DuplicateRecord { .. });
        if !retried_insert {
            return Err(failure);
        }

        let existing = with_retry(&self.retry, "find_in_file", || {
            store.find_in_file(&stored.source_file, &stored.natural_key)
        })
        .await?;
        match existing {
            Some(row) if row.id == stored.id && row.content_hash == stored.content_hash => {
                debug!(key = %stored.natural_key, attempts = failure.attempts, "insert committed by an earlier attempt");
                Ok(())
            }
            _ => Err(failure),
        }
    }
}
