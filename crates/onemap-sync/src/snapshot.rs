//! Parquet export of a batch's records and status changes for offline analysis.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use onemap_core::{fields, FieldValue, StatusChange, StoredRecord};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub batch_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `snapshots/records.parquet`, `snapshots/status_changes.parquet` and
/// `snapshots/manifest.json` under `batch_dir`; returns the manifest path.
pub fn export_snapshots(
    batch_dir: &Path,
    batch_id: Uuid,
    records: &[StoredRecord],
    changes: &[StatusChange],
) -> Result<PathBuf> {
    let snapshot_dir = batch_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let records_path = snapshot_dir.join("records.parquet");
    let changes_path = snapshot_dir.join("status_changes.parquet");
    write_records_parquet(&records_path, records)?;
    write_status_changes_parquet(&changes_path, changes)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        batch_id,
        files: vec![
            manifest_entry("records", batch_dir, &records_path, records.len())?,
            manifest_entry("status_changes", batch_dir, &changes_path, changes.len())?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn text_column(records: &[StoredRecord], field: &str) -> StringArray {
    StringArray::from(
        records
            .iter()
            .map(|r| r.record.display(field))
            .collect::<Vec<_>>(),
    )
}

fn decimal_column(records: &[StoredRecord], field: &str) -> Float64Array {
    Float64Array::from(
        records
            .iter()
            .map(|r| r.record.get(field).and_then(FieldValue::as_f64))
            .collect::<Vec<_>>(),
    )
}

fn write_records_parquet(path: &Path, records: &[StoredRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("natural_key", DataType::Utf8, false),
        ArrowField::new("source_file", DataType::Utf8, false),
        ArrowField::new("row_number", DataType::UInt32, false),
        ArrowField::new("status", DataType::Utf8, true),
        ArrowField::new("pole_number", DataType::Utf8, true),
        ArrowField::new("drop_number", DataType::Utf8, true),
        ArrowField::new("location_address", DataType::Utf8, true),
        ArrowField::new("field_agent_name", DataType::Utf8, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("data_quality_score", DataType::Float64, false),
        ArrowField::new("content_hash", DataType::Utf8, false),
        ArrowField::new("imported_at", DataType::Utf8, false),
    ]));

    let keys = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.natural_key.as_str()))
            .collect::<Vec<_>>(),
    );
    let source_files = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.source_file.as_str()))
            .collect::<Vec<_>>(),
    );
    let row_numbers = UInt32Array::from(records.iter().map(|r| r.row_number).collect::<Vec<_>>());
    let scores = Float64Array::from(
        records
            .iter()
            .map(|r| r.data_quality_score)
            .collect::<Vec<_>>(),
    );
    let hashes = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.content_hash.as_str()))
            .collect::<Vec<_>>(),
    );
    let imported_at = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.imported_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(source_files),
            Arc::new(row_numbers),
            Arc::new(text_column(records, fields::STATUS)),
            Arc::new(text_column(records, fields::POLE_NUMBER)),
            Arc::new(text_column(records, fields::DROP_NUMBER)),
            Arc::new(text_column(records, fields::LOCATION_ADDRESS)),
            Arc::new(text_column(records, fields::FIELD_AGENT_NAME)),
            Arc::new(decimal_column(records, fields::LATITUDE)),
            Arc::new(decimal_column(records, fields::LONGITUDE)),
            Arc::new(scores),
            Arc::new(hashes),
            Arc::new(imported_at),
        ],
    )
    .context("building records record batch")?;
    write_parquet(path, batch)
}

fn write_status_changes_parquet(path: &Path, changes: &[StatusChange]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_id", DataType::Utf8, false),
        ArrowField::new("field_name", DataType::Utf8, false),
        ArrowField::new("old_value", DataType::Utf8, true),
        ArrowField::new("new_value", DataType::Utf8, true),
        ArrowField::new("change_date", DataType::Utf8, false),
        ArrowField::new("source_file", DataType::Utf8, false),
        ArrowField::new("previous_source_file", DataType::Utf8, true),
    ]));

    let entity_ids = StringArray::from(
        changes
            .iter()
            .map(|c| Some(c.entity_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let field_names = StringArray::from(
        changes
            .iter()
            .map(|c| Some(c.field_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let old_values = StringArray::from(
        changes
            .iter()
            .map(|c| c.old_value.as_deref())
            .collect::<Vec<_>>(),
    );
    let new_values = StringArray::from(
        changes
            .iter()
            .map(|c| c.new_value.as_deref())
            .collect::<Vec<_>>(),
    );
    let change_dates = StringArray::from(
        changes
            .iter()
            .map(|c| Some(c.change_date.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let source_files = StringArray::from(
        changes
            .iter()
            .map(|c| Some(c.source_file.as_str()))
            .collect::<Vec<_>>(),
    );
    let previous = StringArray::from(
        changes
            .iter()
            .map(|c| c.previous_source_file.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(entity_ids),
            Arc::new(field_names),
            Arc::new(old_values),
            Arc::new(new_values),
            Arc::new(change_dates),
            Arc::new(source_files),
            Arc::new(previous),
        ],
    )
    .context("building status_changes record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(
    name: &str,
    batch_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(batch_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use onemap_core::MappedRecord;
    use tempfile::tempdir;

    #[test]
    fn export_writes_manifest_with_hashes() {
        let dir = tempdir().expect("tempdir");
        let batch_id = Uuid::new_v4();
        let mut record = MappedRecord::default();
        record
            .fields
            .insert(fields::STATUS.into(), Some(FieldValue::Text("Approved".into())));
        record
            .fields
            .insert(fields::LATITUDE.into(), Some(FieldValue::Decimal(-26.38)));
        let stored = StoredRecord {
            id: Uuid::new_v4(),
            batch_id,
            source_file: "a.xlsx".into(),
            row_number: 2,
            natural_key: "101".into(),
            content_hash: record.content_hash(),
            record,
            data_quality_score: 0.35,
            imported_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let change = StatusChange {
            entity_id: "101".into(),
            field_name: "status".into(),
            old_value: None,
            new_value: Some("Approved".into()),
            change_date: Utc::now(),
            source_file: "a.xlsx".into(),
            previous_source_file: None,
            batch_id,
        };

        let manifest_path =
            export_snapshots(dir.path(), batch_id, &[stored], &[change]).expect("export");
        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read manifest"))
                .expect("parse manifest");
        assert_eq!(manifest.batch_id, batch_id);
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].path, "snapshots/records.parquet");
        assert_eq!(manifest.files[0].rows, 1);
        assert_eq!(manifest.files[0].sha256.len(), 64);
        assert!(dir.path().join("snapshots/status_changes.parquet").exists());
    }
}
