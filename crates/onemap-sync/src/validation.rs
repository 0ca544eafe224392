//! Post-import checks: integrity of the stored snapshot, and a row-by-row comparison of
//! the source file against what the store holds for it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use onemap_core::{fields, FieldValue, MappedRecord, StoredRecord};
use onemap_source::{ColumnMapping, SourceSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const NUMERIC_TOLERANCE: f64 = 1e-6;

/// Fields compared by default; a mismatch on a critical one always counts.
const KEY_FIELDS: [(&str, bool); 10] = [
    (fields::STATUS, true),
    (fields::POLE_NUMBER, true),
    (fields::DROP_NUMBER, true),
    (fields::FIELD_AGENT_NAME, false),
    (fields::LOCATION_ADDRESS, false),
    (fields::LATITUDE, false),
    (fields::LONGITUDE, false),
    ("contact_person_name", false),
    ("contact_person_surname", false),
    ("contact_number", false),
];

const SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationConfig {
    pub max_drops_per_pole: usize,
    pub low_quality_threshold: f64,
    /// Share of records with one status above which the distribution is flagged.
    pub status_concentration: f64,
    /// Compare every mapped field instead of the key fields.
    pub full: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_drops_per_pole: 12,
            low_quality_threshold: 0.5,
            status_concentration: 0.9,
            full: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoleLoad {
    pub pole: String,
    pub drop_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Anomaly {
    DuplicatePropertyIds { count: usize, samples: Vec<String> },
    PoleOverCapacity { count: usize, details: Vec<PoleLoad> },
    LowQualityRecords { count: usize, percentage: f64 },
    StatusConcentration { status: String, count: usize, percentage: f64 },
    MissingPoleNumbers { count: usize },
}

impl Anomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            Anomaly::DuplicatePropertyIds { .. } => "DUPLICATE_PROPERTY_IDS",
            Anomaly::PoleOverCapacity { .. } => "POLE_OVER_CAPACITY",
            Anomaly::LowQualityRecords { .. } => "LOW_QUALITY_RECORDS",
            Anomaly::StatusConcentration { .. } => "STATUS_CONCENTRATION",
            Anomaly::MissingPoleNumbers { .. } => "MISSING_POLE_NUMBERS",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Anomaly::DuplicatePropertyIds { count, samples } => {
                format!("{count} duplicate property ids (e.g. {})", samples.join(", "))
            }
            Anomaly::PoleOverCapacity { count, details } => {
                let worst = details
                    .iter()
                    .take(3)
                    .map(|p| format!("{} ({} drops)", p.pole, p.drop_count))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{count} poles over capacity: {worst}")
            }
            Anomaly::LowQualityRecords { count, percentage } => {
                format!("{count} records ({percentage:.1}%) have a quality score below threshold")
            }
            Anomaly::StatusConcentration {
                status,
                percentage,
                ..
            } => format!("{percentage:.1}% of records have status {status:?}"),
            Anomaly::MissingPoleNumbers { count } => {
                format!("{count} records with pole-related status but no pole number")
            }
        }
    }
}

/// Integrity checks over the stored records of one source file. Stored rows are unique
/// per file, so repeated property ids are only visible in the source rows; see
/// [`duplicate_property_ids`].
pub fn integrity_anomalies(records: &[StoredRecord], config: &ValidationConfig) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    if records.is_empty() {
        return anomalies;
    }

    let over = poles_over_capacity(records.iter().map(|r| (&r.natural_key, &r.record)), config);
    if !over.is_empty() {
        anomalies.push(Anomaly::PoleOverCapacity {
            count: over.len(),
            details: over,
        });
    }

    let low_quality = records
        .iter()
        .filter(|r| r.data_quality_score < config.low_quality_threshold)
        .count();
    if low_quality > 0 {
        anomalies.push(Anomaly::LowQualityRecords {
            count: low_quality,
            percentage: round1(low_quality as f64 * 100.0 / records.len() as f64),
        });
    }

    let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        if let Some(status) = record.record.display(fields::STATUS) {
            *status_counts.entry(status).or_default() += 1;
        }
    }
    let with_status: usize = status_counts.values().sum();
    for (status, count) in status_counts {
        let share = count as f64 / with_status as f64;
        if share > config.status_concentration {
            anomalies.push(Anomaly::StatusConcentration {
                status,
                count,
                percentage: round1(share * 100.0),
            });
        }
    }

    let missing_poles = records
        .iter()
        .filter(|r| {
            r.record
                .display(fields::STATUS)
                .is_some_and(|s| s.contains("Pole"))
                && !r.record.is_present(fields::POLE_NUMBER)
        })
        .count();
    if missing_poles > 0 {
        anomalies.push(Anomaly::MissingPoleNumbers {
            count: missing_poles,
        });
    }

    anomalies
}

/// Property ids that appear on more than one source row.
pub fn duplicate_property_ids<'a>(keys: impl Iterator<Item = &'a str>) -> Option<Anomaly> {
    let mut key_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for key in keys {
        *key_counts.entry(key).or_default() += 1;
    }
    let duplicates: Vec<String> = key_counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(key, _)| key.to_string())
        .collect();
    if duplicates.is_empty() {
        return None;
    }
    Some(Anomaly::DuplicatePropertyIds {
        count: duplicates.len(),
        samples: duplicates.into_iter().take(SAMPLE_SIZE).collect(),
    })
}

/// Poles carrying more distinct drops than allowed, busiest first. A row without a drop
/// number counts as its own drop.
pub fn poles_over_capacity<'a>(
    records: impl Iterator<Item = (&'a String, &'a MappedRecord)>,
    config: &ValidationConfig,
) -> Vec<PoleLoad> {
    let mut drops: HashMap<String, BTreeSet<String>> = HashMap::new();
    for (key, record) in records {
        let Some(pole) = record.display(fields::POLE_NUMBER) else {
            continue;
        };
        let drop_id = record
            .display(fields::DROP_NUMBER)
            .unwrap_or_else(|| format!("property:{key}"));
        drops.entry(pole).or_default().insert(drop_id);
    }
    let mut over: Vec<PoleLoad> = drops
        .into_iter()
        .filter(|(_, d)| d.len() > config.max_drops_per_pole)
        .map(|(pole, d)| PoleLoad {
            pole,
            drop_count: d.len(),
        })
        .collect();
    over.sort_by(|a, b| b.drop_count.cmp(&a.drop_count).then(a.pole.cmp(&b.pole)));
    over
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub checked: usize,
    pub matched: usize,
    pub mismatched: usize,
    pub null_in_source: usize,
    pub null_in_db: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMismatch {
    pub field: String,
    pub source_value: Option<String>,
    pub db_value: Option<String>,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationIssue {
    MissingInDb { property_id: String, row_number: u32 },
    MissingInSource { property_id: String },
    FieldMismatch {
        property_id: String,
        fields: Vec<FieldMismatch>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_records: usize,
    pub validated_records: usize,
    pub passed_records: usize,
    pub failed_records: usize,
    pub missing_in_db: usize,
    pub missing_in_source: usize,
    pub field_mismatches: usize,
    /// Percent of validated records that passed, one decimal.
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub source_file: String,
    pub batch_id: Option<Uuid>,
    pub generated_at: DateTime<Utc>,
    pub summary: ValidationSummary,
    pub field_stats: BTreeMap<String, FieldStats>,
    pub issues: Vec<ValidationIssue>,
    pub anomalies: Vec<Anomaly>,
}

impl ValidationReport {
    pub fn passes(&self, threshold: f64) -> bool {
        self.summary.accuracy >= threshold
    }
}

/// Compares a freshly read source snapshot with the records stored for the same file.
pub fn validate_snapshot(
    snapshot: &SourceSnapshot,
    mapping: &ColumnMapping,
    stored: &[StoredRecord],
    config: &ValidationConfig,
) -> ValidationReport {
    let compared: Vec<(String, bool)> = if config.full {
        let mut all: Vec<(String, bool)> = mapping
            .columns
            .values()
            .filter(|spec| spec.field != mapping.natural_key)
            .map(|spec| (spec.field.clone(), is_critical(&spec.field)))
            .collect();
        all.sort();
        all
    } else {
        KEY_FIELDS
            .iter()
            .map(|(field, critical)| (field.to_string(), *critical))
            .collect()
    };

    let mut source: Vec<(String, u32, MappedRecord)> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut source_keys: Vec<String> = Vec::new();
    for raw in &snapshot.rows {
        let record = mapping.map_row(raw);
        if let Some(key) = record.natural_key.clone() {
            source_keys.push(key.clone());
            if seen.insert(key.clone()) {
                source.push((key, raw.row_number, record));
            }
        }
    }
    let db: HashMap<&str, &StoredRecord> = stored
        .iter()
        .map(|r| (r.natural_key.as_str(), r))
        .collect();

    let mut summary = ValidationSummary {
        total_records: snapshot.rows.len(),
        ..Default::default()
    };
    let mut field_stats: BTreeMap<String, FieldStats> = BTreeMap::new();
    let mut issues = Vec::new();

    for (key, row_number, record) in &source {
        summary.validated_records += 1;
        let Some(db_row) = db.get(key.as_str()) else {
            summary.missing_in_db += 1;
            issues.push(ValidationIssue::MissingInDb {
                property_id: key.clone(),
                row_number: *row_number,
            });
            continue;
        };

        let mut mismatches = Vec::new();
        for (field, critical) in &compared {
            let stats = field_stats.entry(field.clone()).or_default();
            stats.checked += 1;
            let source_value = record.get(field);
            let db_value = db_row.record.get(field);
            if source_value.is_none() {
                stats.null_in_source += 1;
            }
            if db_value.is_none() {
                stats.null_in_db += 1;
            }
            if values_match(source_value, db_value) {
                stats.matched += 1;
                continue;
            }
            stats.mismatched += 1;
            if *critical || (source_value.is_some() && db_value.is_some()) {
                mismatches.push(FieldMismatch {
                    field: field.clone(),
                    source_value: source_value.map(ToString::to_string),
                    db_value: db_value.map(ToString::to_string),
                    critical: *critical,
                });
            }
        }

        if mismatches.is_empty() {
            summary.passed_records += 1;
        } else {
            summary.failed_records += 1;
            summary.field_mismatches += mismatches.len();
            issues.push(ValidationIssue::FieldMismatch {
                property_id: key.clone(),
                fields: mismatches,
            });
        }
    }

    for record in stored {
        if !seen.contains(&record.natural_key) {
            summary.missing_in_source += 1;
            issues.push(ValidationIssue::MissingInSource {
                property_id: record.natural_key.clone(),
            });
        }
    }

    summary.accuracy = if summary.validated_records > 0 {
        round1(summary.passed_records as f64 * 100.0 / summary.validated_records as f64)
    } else {
        0.0
    };

    let mut anomalies: Vec<Anomaly> =
        duplicate_property_ids(source_keys.iter().map(String::as_str)).into_iter().collect();
    anomalies.extend(integrity_anomalies(stored, config));

    ValidationReport {
        source_file: snapshot.source_file.clone(),
        batch_id: stored.iter().map(|r| r.batch_id).next(),
        generated_at: Utc::now(),
        summary,
        field_stats,
        issues,
        anomalies,
    }
}

fn is_critical(field: &str) -> bool {
    KEY_FIELDS
        .iter()
        .any(|(name, critical)| *critical && *name == field)
}

fn values_match(source: Option<&FieldValue>, db: Option<&FieldValue>) -> bool {
    match (source, db) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if let (FieldValue::Integer(_) | FieldValue::Decimal(_), Some(x), Some(y)) =
                (a, a.as_f64(), b.as_f64())
            {
                if (x - y).abs() < NUMERIC_TOLERANCE {
                    return true;
                }
            }
            a.to_string().trim() == b.to_string().trim()
        }
        _ => false,
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemap_core::RawImportRecord;

    const MAPPING: &str = r#"
name: validation-test
version: "1"
columns:
  "Property ID": { field: property_id }
  "Pole Number": { field: pole_number }
  "Drop Number": { field: drop_number }
  "Status": { field: status }
  "Latitude": { field: latitude }
tracked_fields: [status]
"#;

    fn mapping() -> ColumnMapping {
        ColumnMapping::from_yaml_str(MAPPING).expect("mapping")
    }

    fn raw(row_number: u32, cells: &[(&str, &str)]) -> RawImportRecord {
        RawImportRecord {
            source_file: "a.csv".into(),
            row_number,
            cells: cells
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn stored_from(raw: &RawImportRecord) -> StoredRecord {
        let record = mapping().map_row(raw);
        StoredRecord {
            id: Uuid::new_v4(),
            batch_id: Uuid::nil(),
            source_file: raw.source_file.clone(),
            row_number: raw.row_number,
            natural_key: record.natural_key.clone().unwrap_or_default(),
            content_hash: record.content_hash(),
            data_quality_score: 0.8,
            record,
            imported_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn thirteen_properties_on_one_pole_are_flagged() {
        let rows: Vec<RawImportRecord> = (0..13)
            .map(|i| {
                let id = (500 + i).to_string();
                let status = if i % 2 == 0 { "A" } else { "B" };
                raw(
                    i + 2,
                    &[
                        ("Property ID", id.as_str()),
                        ("Pole Number", "LAW.P.B167"),
                        ("Status", status),
                    ],
                )
            })
            .collect();
        let stored: Vec<StoredRecord> = rows.iter().map(stored_from).collect();
        let anomalies = integrity_anomalies(&stored, &ValidationConfig::default());
        let over = anomalies
            .iter()
            .find_map(|a| match a {
                Anomaly::PoleOverCapacity { details, .. } => Some(details.clone()),
                _ => None,
            })
            .expect("pole flagged");
        assert_eq!(
            over,
            vec![PoleLoad {
                pole: "LAW.P.B167".into(),
                drop_count: 13
            }]
        );
    }

    #[test]
    fn twelve_drops_are_within_capacity() {
        let rows: Vec<RawImportRecord> = (0..12)
            .map(|i| {
                let id = (500 + i).to_string();
                let drop_number = format!("DR{i}");
                raw(
                    i + 2,
                    &[
                        ("Property ID", id.as_str()),
                        ("Pole Number", "LAW.P.B167"),
                        ("Drop Number", drop_number.as_str()),
                    ],
                )
            })
            .collect();
        let stored: Vec<StoredRecord> = rows.iter().map(stored_from).collect();
        let over = poles_over_capacity(
            stored.iter().map(|r| (&r.natural_key, &r.record)),
            &ValidationConfig::default(),
        );
        assert!(over.is_empty());
    }

    #[test]
    fn concentrated_status_and_missing_poles_are_reported() {
        let rows: Vec<RawImportRecord> = (0..20)
            .map(|i| {
                let id = (i + 1).to_string();
                raw(
                    i + 2,
                    &[("Property ID", id.as_str()), ("Status", "Pole Permission: Approved")],
                )
            })
            .collect();
        let stored: Vec<StoredRecord> = rows.iter().map(stored_from).collect();
        let anomalies = integrity_anomalies(&stored, &ValidationConfig::default());
        let kinds: Vec<&str> = anomalies.iter().map(Anomaly::kind).collect();
        assert!(kinds.contains(&"STATUS_CONCENTRATION"));
        assert!(kinds.contains(&"MISSING_POLE_NUMBERS"));
        assert!(!kinds.contains(&"LOW_QUALITY_RECORDS"));
    }

    #[test]
    fn cross_reference_counts_missing_and_mismatched_rows() {
        let rows = vec![
            raw(2, &[("Property ID", "1"), ("Status", "A"), ("Latitude", "-26.1")]),
            raw(3, &[("Property ID", "2"), ("Status", "A")]),
            raw(4, &[("Property ID", "3"), ("Status", "A")]),
        ];
        let mut stored: Vec<StoredRecord> = rows[..2].iter().map(stored_from).collect();
        stored[1]
            .record
            .fields
            .insert("status".into(), Some(FieldValue::Text("B".into())));
        stored.push(stored_from(&raw(9, &[("Property ID", "99"), ("Status", "A")])));

        let snapshot = SourceSnapshot {
            source_file: "a.csv".into(),
            header_row: 1,
            headers: vec!["Property ID".into(), "Status".into(), "Latitude".into()],
            rows,
            skipped_blank_rows: 0,
        };
        let report = validate_snapshot(&snapshot, &mapping(), &stored, &ValidationConfig::default());
        assert_eq!(report.summary.validated_records, 3);
        assert_eq!(report.summary.passed_records, 1);
        assert_eq!(report.summary.failed_records, 1);
        assert_eq!(report.summary.missing_in_db, 1);
        assert_eq!(report.summary.missing_in_source, 1);
        assert_eq!(report.summary.accuracy, 33.3);
        assert!(!report.passes(95.0));
        assert_eq!(report.field_stats["status"].mismatched, 1);
        assert!(report.issues.iter().any(|i| matches!(
            i,
            ValidationIssue::FieldMismatch { property_id, .. } if property_id == "2"
        )));
    }

    #[test]
    fn repeated_source_ids_are_reported_as_duplicates() {
        let rows = vec![
            raw(2, &[("Property ID", "1"), ("Status", "A")]),
            raw(3, &[("Property ID", "2"), ("Status", "A")]),
            raw(4, &[("Property ID", "1"), ("Status", "B")]),
        ];
        let stored: Vec<StoredRecord> = rows[..2].iter().map(stored_from).collect();
        assert!(!integrity_anomalies(&stored, &ValidationConfig::default())
            .iter()
            .any(|a| a.kind() == "DUPLICATE_PROPERTY_IDS"));

        let snapshot = SourceSnapshot {
            source_file: "a.csv".into(),
            header_row: 1,
            headers: vec!["Property ID".into(), "Status".into()],
            rows,
            skipped_blank_rows: 0,
        };
        let report = validate_snapshot(&snapshot, &mapping(), &stored, &ValidationConfig::default());
        assert_eq!(
            report.anomalies[0],
            Anomaly::DuplicatePropertyIds {
                count: 1,
                samples: vec!["1".into()]
            }
        );
        assert_eq!(report.summary.validated_records, 2);
        assert_eq!(report.summary.passed_records, 2);
    }

    #[test]
    fn numeric_values_match_within_tolerance() {
        assert!(values_match(
            Some(&FieldValue::Decimal(-26.1234567)),
            Some(&FieldValue::Decimal(-26.12345670001))
        ));
        assert!(!values_match(
            Some(&FieldValue::Decimal(-26.12)),
            Some(&FieldValue::Decimal(-26.13))
        ));
        assert!(values_match(None, None));
        assert!(!values_match(Some(&FieldValue::Text("x".into())), None));
    }
}
