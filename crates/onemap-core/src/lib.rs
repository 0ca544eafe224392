//! Core domain model for OneMap spreadsheet imports.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "onemap-core";

/// Destination field names the pipeline reads directly.
pub mod fields {
    pub const PROPERTY_ID: &str = "property_id";
    pub const POLE_NUMBER: &str = "pole_number";
    pub const DROP_NUMBER: &str = "drop_number";
    pub const STATUS: &str = "status";
    pub const LOCATION_ADDRESS: &str = "location_address";
    pub const LATITUDE: &str = "latitude";
    pub const LONGITUDE: &str = "longitude";
    pub const FIELD_AGENT_NAME: &str = "field_agent_name";
}

/// Coerced destination value. Absent or unparseable values are `None` at the use site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Decimal(v) => Some(*v),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Date(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Decimal(v) => write!(f, "{v}"),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// One data row of a spreadsheet snapshot, keyed by source header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawImportRecord {
    pub source_file: String,
    /// 1-based row number as shown by the spreadsheet application.
    pub row_number: u32,
    pub cells: BTreeMap<String, String>,
}

impl RawImportRecord {
    pub fn cell(&self, header: &str) -> Option<&str> {
        self.cells.get(header).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoercionIssue {
    pub field: String,
    pub source_header: String,
    pub raw_value: String,
    pub expected: String,
}

/// Destination-shaped record produced by the column mapper.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MappedRecord {
    pub natural_key: Option<String>,
    /// One entry per mapped column present in the source sheet.
    pub fields: BTreeMap<String, Option<FieldValue>>,
    /// Values split out of composite columns.
    #[serde(default)]
    pub derived: BTreeMap<String, Option<FieldValue>>,
    /// Unmapped source columns, kept verbatim.
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
    #[serde(default)]
    pub issues: Vec<CoercionIssue>,
}

impl MappedRecord {
    /// Looks a field up in `fields`, then in `derived`.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields
            .get(field)
            .and_then(Option::as_ref)
            .or_else(|| self.derived.get(field).and_then(Option::as_ref))
    }

    pub fn display(&self, field: &str) -> Option<String> {
        self.get(field).map(ToString::to_string)
    }

    pub fn is_present(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn mapped_field_count(&self) -> usize {
        self.fields.len()
    }

    /// Stable hash over mapped and derived values; extras and issues do not participate.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::json!({
            "fields": self.fields,
            "derived": self.derived,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Tracked fields whose rendered value differs between `previous` and `self`.
    pub fn tracked_differences(
        &self,
        previous: &MappedRecord,
        tracked: &[String],
    ) -> Vec<FieldDifference> {
        tracked
            .iter()
            .filter_map(|field| {
                let old_value = previous.display(field);
                let new_value = self.display(field);
                if old_value == new_value {
                    None
                } else {
                    Some(FieldDifference {
                        field_name: field.clone(),
                        old_value,
                        new_value,
                    })
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDifference {
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// A mapped record as persisted for one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub source_file: String,
    pub row_number: u32,
    pub natural_key: String,
    pub record: MappedRecord,
    pub data_quality_score: f64,
    pub content_hash: String,
    pub imported_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only field-level delta between two snapshots of the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub entity_id: String,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_date: DateTime<Utc>,
    pub source_file: String,
    pub previous_source_file: Option<String>,
    pub batch_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid batch transition {from} -> {to}")]
pub struct TransitionError {
    pub from: BatchStatus,
    pub to: BatchStatus,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(BatchStatus::Processing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchStatus::Processing)
    }

    /// `processing -> completed` and `processing -> failed` are the only legal moves.
    pub fn transition(self, to: BatchStatus) -> Result<BatchStatus, TransitionError> {
        match (self, to) {
            (BatchStatus::Processing, BatchStatus::Completed)
            | (BatchStatus::Processing, BatchStatus::Failed) => Ok(to),
            _ => Err(TransitionError { from: self, to }),
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total_rows: u32,
    pub processed_rows: u32,
    pub new_entities: u32,
    pub updated_entities: u32,
    pub unchanged_entities: u32,
    pub duplicate_rows: u32,
    pub error_rows: u32,
    pub status_changes: u32,
    pub dead_letters: u32,
}

/// A row whose destination write was permanently rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub row_number: u32,
    pub natural_key: Option<String>,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    MissingNaturalKey,
    DuplicateInFile { first_row: u32 },
    Coercion { field: String, raw_value: String },
    WriteFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub row_number: u32,
    pub natural_key: Option<String>,
    #[serde(flatten)]
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmappedColumn {
    pub header: String,
    pub suggestion: Option<String>,
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: Uuid,
    pub project_name: String,
    pub source_file: String,
    pub source_sha256: Option<String>,
    pub artifact_path: Option<String>,
    pub mapping_name: String,
    pub mapping_version: String,
    pub counts: BatchCounts,
    pub status: BatchStatus,
    pub unmapped_columns: Vec<UnmappedColumn>,
    pub dead_letters: Vec<DeadLetter>,
    pub issues_sample: Vec<RowIssue>,
    pub error_details: Option<String>,
    pub import_started: DateTime<Utc>,
    pub import_completed: Option<DateTime<Utc>>,
}

impl ImportBatch {
    pub fn begin(
        id: Uuid,
        project_name: impl Into<String>,
        source_file: impl Into<String>,
        total_rows: u32,
    ) -> Self {
        Self {
            id,
            project_name: project_name.into(),
            source_file: source_file.into(),
            source_sha256: None,
            artifact_path: None,
            mapping_name: String::new(),
            mapping_version: String::new(),
            counts: BatchCounts {
                total_rows,
                ..Default::default()
            },
            status: BatchStatus::Processing,
            unmapped_columns: Vec::new(),
            dead_letters: Vec::new(),
            issues_sample: Vec::new(),
            error_details: None,
            import_started: Utc::now(),
            import_completed: None,
        }
    }
}

/// Weighted completeness over the key fields of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub weights: BTreeMap<String, f64>,
}

impl Default for QualityWeights {
    fn default() -> Self {
        let weights = [
            (fields::PROPERTY_ID, 0.2),
            (fields::STATUS, 0.2),
            (fields::POLE_NUMBER, 0.15),
            (fields::LATITUDE, 0.15),
            (fields::LONGITUDE, 0.15),
            (fields::LOCATION_ADDRESS, 0.15),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self { weights }
    }
}

impl QualityWeights {
    /// Score in `[0, 1]`, rounded to two decimals. Negative weights are ignored.
    pub fn score(&self, record: &MappedRecord) -> f64 {
        let mut score = 0.0;
        let mut max_score = 0.0;
        for (field, weight) in &self.weights {
            let weight = weight.max(0.0);
            max_score += weight;
            if record.is_present(field) {
                score += weight;
            }
        }
        if max_score <= 0.0 {
            return 0.0;
        }
        ((score / max_score) * 100.0).round() / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityTier {
    pub fn for_score(score: f64) -> Self {
        if score >= 0.9 {
            QualityTier::Excellent
        } else if score >= 0.7 {
            QualityTier::Good
        } else if score >= 0.5 {
            QualityTier::Fair
        } else {
            QualityTier::Poor
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QualityTier::Excellent => "Excellent (90-100%)",
            QualityTier::Good => "Good (70-89%)",
            QualityTier::Fair => "Fair (50-69%)",
            QualityTier::Poor => "Poor (<50%)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(present: &[&str]) -> MappedRecord {
        let mut record = MappedRecord::default();
        for field in present {
            record
                .fields
                .insert(field.to_string(), Some(FieldValue::Text("x".into())));
        }
        record
    }

    #[test]
    fn quality_score_uses_fixed_weights() {
        let weights = QualityWeights::default();
        assert_eq!(weights.score(&record_with(&[])), 0.0);
        assert_eq!(
            weights.score(&record_with(&[fields::PROPERTY_ID, fields::STATUS])),
            0.4
        );
        let all = [
            fields::PROPERTY_ID,
            fields::STATUS,
            fields::POLE_NUMBER,
            fields::LATITUDE,
            fields::LONGITUDE,
            fields::LOCATION_ADDRESS,
        ];
        assert_eq!(weights.score(&record_with(&all)), 1.0);
    }

    #[test]
    fn quality_score_is_monotonic_in_field_presence() {
        let weights = QualityWeights::default();
        let keys: Vec<&str> = weights.weights.keys().map(String::as_str).collect();
        let mut present: Vec<&str> = Vec::new();
        let mut last = weights.score(&record_with(&present));
        for key in keys {
            present.push(key);
            let next = weights.score(&record_with(&present));
            assert!(next >= last, "adding {key} lowered score {last} -> {next}");
            last = next;
        }
    }

    #[test]
    fn null_field_does_not_count_as_present() {
        let mut record = record_with(&[fields::STATUS]);
        record.fields.insert(fields::POLE_NUMBER.into(), None);
        assert!(!record.is_present(fields::POLE_NUMBER));
        assert_eq!(QualityWeights::default().score(&record), 0.2);
    }

    #[test]
    fn derived_values_satisfy_lookups() {
        let mut record = MappedRecord::default();
        record
            .derived
            .insert(fields::LATITUDE.into(), Some(FieldValue::Decimal(-26.38)));
        assert_eq!(record.get(fields::LATITUDE).and_then(FieldValue::as_f64), Some(-26.38));
    }

    #[test]
    fn batch_transitions_only_leave_processing() {
        assert_eq!(
            BatchStatus::Processing.transition(BatchStatus::Completed),
            Ok(BatchStatus::Completed)
        );
        assert_eq!(
            BatchStatus::Processing.transition(BatchStatus::Failed),
            Ok(BatchStatus::Failed)
        );
        assert!(BatchStatus::Completed.transition(BatchStatus::Failed).is_err());
        assert!(BatchStatus::Failed.transition(BatchStatus::Completed).is_err());
        assert!(BatchStatus::Processing
            .transition(BatchStatus::Processing)
            .is_err());
    }

    #[test]
    fn tracked_differences_only_report_changed_fields() {
        let mut old = MappedRecord::default();
        old.fields
            .insert(fields::STATUS.into(), Some(FieldValue::Text("Approved".into())));
        old.fields
            .insert(fields::POLE_NUMBER.into(), Some(FieldValue::Text("LAW.P.A001".into())));
        let mut new = old.clone();
        new.fields
            .insert(fields::STATUS.into(), Some(FieldValue::Text("Installed".into())));

        let tracked = vec![fields::STATUS.to_string(), fields::POLE_NUMBER.to_string()];
        let diffs = new.tracked_differences(&old, &tracked);
        assert_eq!(
            diffs,
            vec![FieldDifference {
                field_name: "status".into(),
                old_value: Some("Approved".into()),
                new_value: Some("Installed".into()),
            }]
        );
    }

    #[test]
    fn content_hash_ignores_extras() {
        let mut a = record_with(&[fields::STATUS]);
        let mut b = a.clone();
        b.extras.insert("Unknown Column".into(), "value".into());
        assert_eq!(a.content_hash(), b.content_hash());
        a.fields
            .insert(fields::STATUS.into(), Some(FieldValue::Text("y".into())));
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn quality_tiers_follow_thresholds() {
        assert_eq!(QualityTier::for_score(0.95), QualityTier::Excellent);
        assert_eq!(QualityTier::for_score(0.7), QualityTier::Good);
        assert_eq!(QualityTier::for_score(0.5), QualityTier::Fair);
        assert_eq!(QualityTier::for_score(0.49), QualityTier::Poor);
    }
}
