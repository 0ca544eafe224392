//! PostgreSQL staging store (`onemap_import_batches`, `onemap_lawley_raw`,
//! `onemap_status_history`).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onemap_core::{
    fields, BatchCounts, BatchStatus, DeadLetter, FieldValue, ImportBatch, MappedRecord, RowIssue,
    StatusChange, StoredRecord, UnmappedColumn,
};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::store::{BatchOutcome, ImportStore, StoreError, WriteMode};

const BATCH_COLUMNS: &str = r#"
    id, project_name, source_file, source_sha256, artifact_path, mapping_name, mapping_version,
    total_rows, processed_rows, new_entities, updated_entities, unchanged_entities,
    duplicate_rows, errors, status_changes, dead_letter_count, status, unmapped_columns,
    dead_letters, issues_sample, error_details, import_started, import_completed
"#;

const RECORD_COLUMNS: &str = r#"
    id, batch_id, source_file, row_number, property_id, fields, derived, extras,
    data_quality_score, content_hash, imported_at, updated_at
"#;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One small pool per run.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<BatchStatus>, StoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM onemap_import_batches WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        status.map(|s| parse_status(&s)).transpose()
    }

    async fn transition_error(&self, id: Uuid, to: BatchStatus) -> StoreError {
        match self.current_status(id).await {
            Ok(Some(from)) => StoreError::InvalidTransition { id, from, to },
            Ok(None) => StoreError::BatchNotFound(id),
            Err(err) => err,
        }
    }
}

fn parse_status(value: &str) -> Result<BatchStatus, StoreError> {
    BatchStatus::parse(value).ok_or_else(|| StoreError::Decode(format!("unknown batch status {value}")))
}

fn count(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Decode(format!("{column} out of range: {value}")))
}

fn batch_from_row(row: &PgRow) -> Result<ImportBatch, StoreError> {
    let status: String = row.try_get("status")?;
    let unmapped: Json<Vec<UnmappedColumn>> = row.try_get("unmapped_columns")?;
    let dead_letters: Json<Vec<DeadLetter>> = row.try_get("dead_letters")?;
    let issues: Json<Vec<RowIssue>> = row.try_get("issues_sample")?;
    Ok(ImportBatch {
        id: row.try_get("id")?,
        project_name: row.try_get("project_name")?,
        source_file: row.try_get("source_file")?,
        source_sha256: row.try_get("source_sha256")?,
        artifact_path: row.try_get("artifact_path")?,
        mapping_name: row.try_get("mapping_name")?,
        mapping_version: row.try_get("mapping_version")?,
        counts: BatchCounts {
            total_rows: count(row, "total_rows")?,
            processed_rows: count(row, "processed_rows")?,
            new_entities: count(row, "new_entities")?,
            updated_entities: count(row, "updated_entities")?,
            unchanged_entities: count(row, "unchanged_entities")?,
            duplicate_rows: count(row, "duplicate_rows")?,
            error_rows: count(row, "errors")?,
            status_changes: count(row, "status_changes")?,
            dead_letters: count(row, "dead_letter_count")?,
        },
        status: parse_status(&status)?,
        unmapped_columns: unmapped.0,
        dead_letters: dead_letters.0,
        issues_sample: issues.0,
        error_details: row.try_get("error_details")?,
        import_started: row.try_get("import_started")?,
        import_completed: row.try_get("import_completed")?,
    })
}

type FieldMap = BTreeMap<String, Option<FieldValue>>;

fn record_from_row(row: &PgRow) -> Result<StoredRecord, StoreError> {
    let natural_key: String = row.try_get("property_id")?;
    let fields: Json<FieldMap> = row.try_get("fields")?;
    let derived: Json<FieldMap> = row.try_get("derived")?;
    let extras: Json<BTreeMap<String, String>> = row.try_get("extras")?;
    let row_number: i64 = row.try_get("row_number")?;
    Ok(StoredRecord {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        source_file: row.try_get("source_file")?,
        row_number: u32::try_from(row_number).unwrap_or_default(),
        natural_key: natural_key.clone(),
        record: MappedRecord {
            natural_key: Some(natural_key),
            fields: fields.0,
            derived: derived.0,
            extras: extras.0,
            issues: Vec::new(),
        },
        data_quality_score: row.try_get("data_quality_score")?,
        content_hash: row.try_get("content_hash")?,
        imported_at: row.try_get("imported_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn change_from_row(row: &PgRow) -> Result<StatusChange, StoreError> {
    Ok(StatusChange {
        entity_id: row.try_get("entity_id")?,
        field_name: row.try_get("field_name")?,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        change_date: row.try_get("change_date")?,
        source_file: row.try_get("source_file")?,
        previous_source_file: row.try_get("previous_source_file")?,
        batch_id: row.try_get("import_batch_id")?,
    })
}

/// Promoted columns kept alongside the JSONB payload for ad hoc SQL.
struct Promoted {
    pole_number: Option<String>,
    drop_number: Option<String>,
    status: Option<String>,
    location_address: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    field_agent_name: Option<String>,
}

impl Promoted {
    fn from_record(record: &MappedRecord) -> Self {
        Self {
            pole_number: record.display(fields::POLE_NUMBER),
            drop_number: record.display(fields::DROP_NUMBER),
            status: record.display(fields::STATUS),
            location_address: record.display(fields::LOCATION_ADDRESS),
            latitude: record.get(fields::LATITUDE).and_then(FieldValue::as_f64),
            longitude: record.get(fields::LONGITUDE).and_then(FieldValue::as_f64),
            field_agent_name: record.display(fields::FIELD_AGENT_NAME),
        }
    }
}

#[async_trait]
impl ImportStore for PostgresStore {
    async fn create_batch(&self, batch: &ImportBatch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO onemap_import_batches (
                id, project_name, source_file, source_sha256, artifact_path,
                mapping_name, mapping_version, total_rows, status, unmapped_columns, import_started
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'processing', $9, $10)
            "#,
        )
        .bind(batch.id)
        .bind(&batch.project_name)
        .bind(&batch.source_file)
        .bind(&batch.source_sha256)
        .bind(&batch.artifact_path)
        .bind(&batch.mapping_name)
        .bind(&batch.mapping_version)
        .bind(i64::from(batch.counts.total_rows))
        .bind(Json(&batch.unmapped_columns))
        .bind(batch.import_started)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_batch(&self, id: Uuid, outcome: &BatchOutcome) -> Result<(), StoreError> {
        let counts = &outcome.counts;
        let result = sqlx::query(
            r#"
            UPDATE onemap_import_batches SET
                import_completed = NOW(),
                processed_rows = $2,
                new_entities = $3,
                updated_entities = $4,
                unchanged_entities = $5,
                duplicate_rows = $6,
                errors = $7,
                status_changes = $8,
                dead_letter_count = $9,
                dead_letters = $10,
                issues_sample = $11,
                status = 'completed'
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(i64::from(counts.processed_rows))
        .bind(i64::from(counts.new_entities))
        .bind(i64::from(counts.updated_entities))
        .bind(i64::from(counts.unchanged_entities))
        .bind(i64::from(counts.duplicate_rows))
        .bind(i64::from(counts.error_rows))
        .bind(i64::from(counts.status_changes))
        .bind(i64::from(counts.dead_letters))
        .bind(Json(&outcome.dead_letters))
        .bind(Json(&outcome.issues_sample))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, BatchStatus::Completed).await);
        }
        Ok(())
    }

    async fn fail_batch(
        &self,
        id: Uuid,
        counts: &BatchCounts,
        error: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE onemap_import_batches SET
                import_completed = NOW(),
                processed_rows = $2,
                errors = $3,
                status = 'failed',
                error_details = $4
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(i64::from(counts.processed_rows))
        .bind(i64::from(counts.error_rows))
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, BatchStatus::Failed).await);
        }
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<ImportBatch>, StoreError> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM onemap_import_batches WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn latest_batch(&self) -> Result<Option<ImportBatch>, StoreError> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM onemap_import_batches ORDER BY import_started DESC LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn list_batches(&self, limit: usize) -> Result<Vec<ImportBatch>, StoreError> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM onemap_import_batches ORDER BY import_started DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn fail_stale_batches(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE onemap_import_batches SET
                status = 'failed',
                error_details = $2,
                import_completed = NOW()
            WHERE status = 'processing' AND import_started < $1
            RETURNING id
            "#,
        )
        .bind(started_before)
        .bind(reason)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn find_in_file(
        &self,
        source_file: &str,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM onemap_lawley_raw WHERE source_file = $1 AND property_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(source_file)
            .bind(natural_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_latest_prior(
        &self,
        natural_key: &str,
        exclude_source_file: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM onemap_lawley_raw
             WHERE property_id = $1 AND source_file <> $2
             ORDER BY imported_at DESC
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(natural_key)
            .bind(exclude_source_file)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert_record(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_row(&mut conn, record).await
    }

    async fn update_record(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_row(&mut conn, record).await
    }

    async fn append_status_changes(&self, changes: &[StatusChange]) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        insert_changes(&mut tx, changes).await?;
        tx.commit().await?;
        debug!(count = changes.len(), "appended status changes");
        Ok(())
    }

    async fn write_record_with_changes(
        &self,
        record: &StoredRecord,
        mode: WriteMode,
        changes: &[StatusChange],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match mode {
            WriteMode::Insert => insert_row(&mut tx, record).await?,
            WriteMode::Update => update_row(&mut tx, record).await?,
        }
        insert_changes(&mut tx, changes).await?;
        tx.commit().await?;
        debug!(
            natural_key = %record.natural_key,
            ?mode,
            changes = changes.len(),
            "record written"
        );
        Ok(())
    }

    async fn records_for_file(&self, source_file: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM onemap_lawley_raw WHERE source_file = $1 ORDER BY row_number"
        );
        let rows = sqlx::query(&sql)
            .bind(source_file)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn status_changes_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<StatusChange>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, field_name, old_value, new_value, change_date,
                   source_file, previous_source_file, import_batch_id
              FROM onemap_status_history
             WHERE import_batch_id = $1
             ORDER BY change_date DESC, id DESC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(change_from_row).collect()
    }
}

async fn insert_row(conn: &mut PgConnection, record: &StoredRecord) -> Result<(), StoreError> {
    let promoted = Promoted::from_record(&record.record);
    let result = sqlx::query(
        r#"
        INSERT INTO onemap_lawley_raw (
            id, batch_id, source_file, row_number, property_id,
            pole_number, drop_number, status, location_address, latitude, longitude,
            field_agent_name, fields, derived, extras, data_quality_score, content_hash,
            imported_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(record.id)
    .bind(record.batch_id)
    .bind(&record.source_file)
    .bind(i64::from(record.row_number))
    .bind(&record.natural_key)
    .bind(&promoted.pole_number)
    .bind(&promoted.drop_number)
    .bind(&promoted.status)
    .bind(&promoted.location_address)
    .bind(promoted.latitude)
    .bind(promoted.longitude)
    .bind(&promoted.field_agent_name)
    .bind(Json(&record.record.fields))
    .bind(Json(&record.record.derived))
    .bind(Json(&record.record.extras))
    .bind(record.data_quality_score)
    .bind(&record.content_hash)
    .bind(record.imported_at)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
            Err(StoreError::DuplicateRecord {
                source_file: record.source_file.clone(),
                natural_key: record.natural_key.clone(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

async fn update_row(conn: &mut PgConnection, record: &StoredRecord) -> Result<(), StoreError> {
    let promoted = Promoted::from_record(&record.record);
    let result = sqlx::query(
        r#"
        UPDATE onemap_lawley_raw SET
            batch_id = $2,
            row_number = $3,
            pole_number = $4,
            drop_number = $5,
            status = $6,
            location_address = $7,
            latitude = $8,
            longitude = $9,
            field_agent_name = $10,
            fields = $11,
            derived = $12,
            extras = $13,
            data_quality_score = $14,
            content_hash = $15,
            updated_at = $16
        WHERE id = $1
        "#,
    )
    .bind(record.id)
    .bind(record.batch_id)
    .bind(i64::from(record.row_number))
    .bind(&promoted.pole_number)
    .bind(&promoted.drop_number)
    .bind(&promoted.status)
    .bind(&promoted.location_address)
    .bind(promoted.latitude)
    .bind(promoted.longitude)
    .bind(&promoted.field_agent_name)
    .bind(Json(&record.record.fields))
    .bind(Json(&record.record.derived))
    .bind(Json(&record.record.extras))
    .bind(record.data_quality_score)
    .bind(&record.content_hash)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::RecordNotFound(record.id));
    }
    Ok(())
}

async fn insert_changes(conn: &mut PgConnection, changes: &[StatusChange]) -> Result<(), StoreError> {
    for change in changes {
        sqlx::query(
            r#"
            INSERT INTO onemap_status_history (
                entity_id, field_name, old_value, new_value, change_date,
                source_file, previous_source_file, import_batch_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&change.entity_id)
        .bind(&change.field_name)
        .bind(&change.old_value)
        .bind(&change.new_value)
        .bind(change.change_date)
        .bind(&change.source_file)
        .bind(&change.previous_source_file)
        .bind(change.batch_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
