//! Versioned column mapping: source header -> destination field + coercion kind.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use onemap_core::{
    fields, CoercionIssue, FieldValue, MappedRecord, QualityWeights, RawImportRecord,
    UnmappedColumn,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;

/// Minimum Jaro-Winkler similarity for an unmapped header to carry a suggestion.
pub const SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("reading mapping {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing mapping: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("mapping is missing `{0}`")]
    MissingAttribute(&'static str),
    #[error("no column maps to natural key field `{0}`")]
    NaturalKeyUnmapped(String),
    #[error("headers {first:?} and {second:?} both map to field `{field}`")]
    DuplicateField {
        field: String,
        first: String,
        second: String,
    },
    #[error("tracked field `{0}` is not produced by any column")]
    UnknownTrackedField(String),
    #[error("quality weight for `{field}` must be a non-negative number, got {weight}")]
    InvalidWeight { field: String, weight: f64 },
    #[error("unmapped columns rejected: {}", join_headers(.0))]
    UnmappedColumns(Vec<UnmappedColumn>),
}

fn join_headers(columns: &[UnmappedColumn]) -> String {
    columns
        .iter()
        .map(|c| c.header.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    /// Digits only; separators, spaces and signs are stripped first.
    Bigint,
    Decimal,
    /// `"lat,lng"`; kept as text and split into derived latitude/longitude.
    CoordinatePair,
    Date,
}

impl ColumnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Integer => "integer",
            ColumnKind::Bigint => "bigint",
            ColumnKind::Decimal => "decimal",
            ColumnKind::CoordinatePair => "coordinate_pair",
            ColumnKind::Date => "date",
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ColumnKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedPolicy {
    /// Keep unmapped columns in `extras` and list them on the batch.
    #[default]
    Report,
    /// Fail the batch before any row is written.
    Reject,
}

impl UnmappedPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "report" => Some(UnmappedPolicy::Report),
            "reject" => Some(UnmappedPolicy::Reject),
            _ => None,
        }
    }
}

fn default_natural_key() -> String {
    fields::PROPERTY_ID.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub name: String,
    pub version: String,
    #[serde(default = "default_natural_key")]
    pub natural_key: String,
    /// 1-based; detected from the natural-key header when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_row: Option<u32>,
    pub columns: BTreeMap<String, ColumnSpec>,
    #[serde(default)]
    pub tracked_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_weights: Option<BTreeMap<String, f64>>,
}

impl ColumnMapping {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, MappingError> {
        let mapping: ColumnMapping = serde_yaml::from_str(text)?;
        mapping.validate()?;
        Ok(mapping)
    }

    fn validate(&self) -> Result<(), MappingError> {
        if self.name.trim().is_empty() {
            return Err(MappingError::MissingAttribute("name"));
        }
        if self.version.trim().is_empty() {
            return Err(MappingError::MissingAttribute("version"));
        }
        if self.columns.is_empty() {
            return Err(MappingError::MissingAttribute("columns"));
        }

        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (header, spec) in &self.columns {
            if let Some(first) = seen.insert(spec.field.as_str(), header.as_str()) {
                return Err(MappingError::DuplicateField {
                    field: spec.field.clone(),
                    first: first.to_string(),
                    second: header.clone(),
                });
            }
        }
        if !seen.contains_key(self.natural_key.as_str()) {
            return Err(MappingError::NaturalKeyUnmapped(self.natural_key.clone()));
        }

        let has_pair = self
            .columns
            .keys()
            .any(|h| self.kind_for(h) == Some(ColumnKind::CoordinatePair));
        for field in &self.tracked_fields {
            let derived = has_pair && (field == fields::LATITUDE || field == fields::LONGITUDE);
            if !seen.contains_key(field.as_str()) && !derived {
                return Err(MappingError::UnknownTrackedField(field.clone()));
            }
        }

        if let Some(weights) = &self.quality_weights {
            for (field, weight) in weights {
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(MappingError::InvalidWeight {
                        field: field.clone(),
                        weight: *weight,
                    });
                }
            }
        }
        Ok(())
    }

    /// Declared kind, or the inferred one: natural key -> integer, latitude/longitude
    /// fields -> decimal, anything else -> text.
    pub fn kind_for(&self, header: &str) -> Option<ColumnKind> {
        let spec = self.columns.get(header)?;
        Some(spec.kind.unwrap_or_else(|| {
            if spec.field == self.natural_key {
                ColumnKind::Integer
            } else if spec.field.contains("latitude") || spec.field.contains("longitude") {
                ColumnKind::Decimal
            } else {
                ColumnKind::Text
            }
        }))
    }

    pub fn natural_key_header(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|(_, spec)| spec.field == self.natural_key)
            .map(|(header, _)| header.as_str())
    }

    pub fn quality_weights(&self) -> QualityWeights {
        match &self.quality_weights {
            Some(weights) => QualityWeights {
                weights: weights.clone(),
            },
            None => QualityWeights::default(),
        }
    }

    /// Maps one raw row. Only columns present in the row produce a field entry.
    pub fn map_row(&self, raw: &RawImportRecord) -> MappedRecord {
        let mut record = MappedRecord::default();

        for (header, spec) in &self.columns {
            let Some(raw_value) = raw.cell(header) else {
                continue;
            };
            let kind = self.kind_for(header).unwrap_or(ColumnKind::Text);
            let value = raw_value.trim();
            let coerced = coerce(kind, value);
            if coerced.is_none() && !value.is_empty() {
                record.issues.push(CoercionIssue {
                    field: spec.field.clone(),
                    source_header: header.clone(),
                    raw_value: value.to_string(),
                    expected: kind.to_string(),
                });
            }

            if kind == ColumnKind::CoordinatePair && !value.is_empty() {
                let (lat, lng) = match split_coordinates(value) {
                    Some((lat, lng)) => (Some(lat), Some(lng)),
                    None => {
                        record.issues.push(CoercionIssue {
                            field: spec.field.clone(),
                            source_header: header.clone(),
                            raw_value: value.to_string(),
                            expected: "latitude,longitude".to_string(),
                        });
                        (None, None)
                    }
                };
                record.derived.insert(
                    fields::LATITUDE.to_string(),
                    lat.map(FieldValue::Decimal),
                );
                record.derived.insert(
                    fields::LONGITUDE.to_string(),
                    lng.map(FieldValue::Decimal),
                );
            }

            record.fields.insert(spec.field.clone(), coerced);
        }

        for (header, value) in &raw.cells {
            if !self.columns.contains_key(header) && !value.trim().is_empty() {
                record.extras.insert(header.clone(), value.clone());
            }
        }

        record.natural_key = record.display(&self.natural_key);
        record
    }

    /// Headers the mapping does not know about, each with the closest mapped header
    /// when it is similar enough to be a likely rename.
    pub fn unmapped_columns(&self, headers: &[String]) -> Vec<UnmappedColumn> {
        headers
            .iter()
            .filter(|h| !self.columns.contains_key(h.as_str()))
            .map(|header| {
                let lowered = header.to_lowercase();
                let best = self
                    .columns
                    .keys()
                    .map(|known| (known, jaro_winkler(&lowered, &known.to_lowercase())))
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD);
                UnmappedColumn {
                    header: header.clone(),
                    suggestion: best.map(|(known, _)| known.clone()),
                    similarity: best.map(|(_, score)| (score * 1000.0).round() / 1000.0),
                }
            })
            .collect()
    }

    /// Applies `policy` to the unmapped headers of a sheet.
    pub fn check_unmapped(
        &self,
        headers: &[String],
        policy: UnmappedPolicy,
    ) -> Result<Vec<UnmappedColumn>, MappingError> {
        let unmapped = self.unmapped_columns(headers);
        match policy {
            UnmappedPolicy::Reject if !unmapped.is_empty() => {
                Err(MappingError::UnmappedColumns(unmapped))
            }
            _ => Ok(unmapped),
        }
    }
}

fn coerce(kind: ColumnKind, value: &str) -> Option<FieldValue> {
    if value.is_empty() {
        return None;
    }
    match kind {
        ColumnKind::Text | ColumnKind::CoordinatePair => Some(FieldValue::Text(value.to_string())),
        ColumnKind::Integer => parse_integer(value).map(FieldValue::Integer),
        ColumnKind::Bigint => {
            let digits: String = value.chars().filter(char::is_ascii_digit).collect();
            digits.parse::<i64>().ok().map(FieldValue::Integer)
        }
        ColumnKind::Decimal => parse_decimal(value).map(FieldValue::Decimal),
        ColumnKind::Date => parse_date(value).map(FieldValue::Date),
    }
}

fn parse_integer(value: &str) -> Option<i64> {
    if let Ok(v) = value.parse::<i64>() {
        return Some(v);
    }
    let float = parse_decimal(value)?;
    if float.fract() == 0.0 && float.abs() < i64::MAX as f64 {
        Some(float as i64)
    } else {
        None
    }
}

fn parse_decimal(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn split_coordinates(value: &str) -> Option<(f64, f64)> {
    let (lat, lng) = value.split_once(',')?;
    let lat = parse_decimal(lat.trim())?;
    let lng = parse_decimal(lng.trim())?;
    if lat.abs() > 90.0 || lng.abs() > 180.0 {
        return None;
    }
    Some((lat, lng))
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y"];
const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

fn parse_date(value: &str) -> Option<NaiveDate> {
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
    {
        return Some(date);
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
    {
        return Some(dt.date());
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"
name: test-mapping
version: "1"
columns:
  "Property ID": { field: property_id }
  "Status": { field: status }
  "Pole Number": { field: pole_number }
  "Latitude": { field: latitude }
  "Latitude & Longitude": { field: latitude_longitude, kind: coordinate_pair }
  "Contact Number": { field: contact_number, kind: bigint }
  "Sections": { field: sections, kind: integer }
  "Permission Date": { field: permission_date, kind: date }
tracked_fields: [status, pole_number]
"#;

    fn mapping() -> ColumnMapping {
        ColumnMapping::from_yaml_str(MAPPING).expect("mapping parses")
    }

    fn raw(cells: &[(&str, &str)]) -> RawImportRecord {
        RawImportRecord {
            source_file: "Lawley.xlsx".into(),
            row_number: 2,
            cells: cells
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn kinds_are_inferred_when_omitted() {
        let m = mapping();
        assert_eq!(m.kind_for("Property ID"), Some(ColumnKind::Integer));
        assert_eq!(m.kind_for("Latitude"), Some(ColumnKind::Decimal));
        assert_eq!(m.kind_for("Status"), Some(ColumnKind::Text));
        assert_eq!(m.kind_for("Unknown"), None);
        assert_eq!(m.natural_key_header(), Some("Property ID"));
    }

    #[test]
    fn mapped_field_count_matches_present_mapped_columns() {
        let m = mapping();
        let record = m.map_row(&raw(&[
            ("Property ID", "1001"),
            ("Status", "Pole Permission: Approved"),
            ("Pole Number", ""),
            ("Some Extra", "kept"),
        ]));
        assert_eq!(record.mapped_field_count(), 3);
        assert_eq!(record.fields.get("pole_number"), Some(&None));
        assert_eq!(record.extras.get("Some Extra").map(String::as_str), Some("kept"));
        assert_eq!(record.natural_key.as_deref(), Some("1001"));
        assert!(record.issues.is_empty());
    }

    #[test]
    fn integer_key_accepts_float_rendering() {
        let record = mapping().map_row(&raw(&[("Property ID", "1001.0")]));
        assert_eq!(record.natural_key.as_deref(), Some("1001"));
    }

    #[test]
    fn coercion_failure_keeps_the_row_and_records_an_issue() {
        let record = mapping().map_row(&raw(&[("Property ID", "1001"), ("Sections", "n/a")]));
        assert_eq!(record.fields.get("sections"), Some(&None));
        assert_eq!(record.issues.len(), 1);
        assert_eq!(record.issues[0].field, "sections");
        assert_eq!(record.issues[0].expected, "integer");
        assert_eq!(record.natural_key.as_deref(), Some("1001"));
    }

    #[test]
    fn non_numeric_key_means_no_natural_key() {
        let record = mapping().map_row(&raw(&[("Property ID", "abc")]));
        assert_eq!(record.natural_key, None);
        assert_eq!(record.issues.len(), 1);
    }

    #[test]
    fn bigint_strips_separators() {
        let record = mapping().map_row(&raw(&[("Contact Number", "082 555-0101")]));
        assert_eq!(
            record.fields.get("contact_number"),
            Some(&Some(FieldValue::Integer(825550101)))
        );
    }

    #[test]
    fn coordinate_pair_is_split_into_derived_fields() {
        let record = mapping().map_row(&raw(&[(
            "Latitude & Longitude",
            "-26.385012, 27.807338",
        )]));
        assert_eq!(
            record.fields.get("latitude_longitude"),
            Some(&Some(FieldValue::Text("-26.385012, 27.807338".into())))
        );
        assert_eq!(record.get(fields::LATITUDE), Some(&FieldValue::Decimal(-26.385012)));
        assert_eq!(record.get(fields::LONGITUDE), Some(&FieldValue::Decimal(27.807338)));
    }

    #[test]
    fn broken_coordinate_pair_is_an_issue() {
        let record = mapping().map_row(&raw(&[("Latitude & Longitude", "-26.38")]));
        assert!(record.get(fields::LATITUDE).is_none());
        assert_eq!(record.issues.len(), 1);
    }

    #[test]
    fn dates_accept_common_formats() {
        assert_eq!(parse_date("2025-08-01"), NaiveDate::from_ymd_opt(2025, 8, 1));
        assert_eq!(parse_date("2025/08/01"), NaiveDate::from_ymd_opt(2025, 8, 1));
        assert_eq!(parse_date("01/08/2025"), NaiveDate::from_ymd_opt(2025, 8, 1));
        assert_eq!(
            parse_date("2025-08-01 14:30:00"),
            NaiveDate::from_ymd_opt(2025, 8, 1)
        );
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn unmapped_headers_get_close_suggestions() {
        let m = mapping();
        let headers = vec![
            "Property ID".to_string(),
            "Pole Numbr".to_string(),
            "Completely Different".to_string(),
        ];
        let unmapped = m.unmapped_columns(&headers);
        assert_eq!(unmapped.len(), 2);
        assert_eq!(unmapped[0].header, "Pole Numbr");
        assert_eq!(unmapped[0].suggestion.as_deref(), Some("Pole Number"));
        assert!(unmapped[0].similarity.unwrap_or_default() >= SUGGESTION_THRESHOLD);
        assert_eq!(unmapped[1].suggestion, None);
    }

    #[test]
    fn reject_policy_fails_on_unmapped_headers() {
        let m = mapping();
        let headers = vec!["Property ID".to_string(), "Mystery".to_string()];
        assert_eq!(
            m.check_unmapped(&headers, UnmappedPolicy::Report)
                .expect("report")
                .len(),
            1
        );
        let err = m
            .check_unmapped(&headers, UnmappedPolicy::Reject)
            .expect_err("reject");
        assert!(matches!(err, MappingError::UnmappedColumns(ref cols) if cols.len() == 1));
    }

    #[test]
    fn mapping_without_natural_key_column_is_rejected() {
        let err = ColumnMapping::from_yaml_str(
            "name: m\nversion: '1'\ncolumns:\n  Status: { field: status }\n",
        )
        .expect_err("invalid");
        assert!(matches!(err, MappingError::NaturalKeyUnmapped(ref f) if f == "property_id"));
    }

    #[test]
    fn duplicate_destination_fields_are_rejected() {
        let err = ColumnMapping::from_yaml_str(
            "name: m\nversion: '1'\ncolumns:\n  Property ID: { field: property_id }\n  ID: { field: property_id }\n",
        )
        .expect_err("invalid");
        assert!(matches!(err, MappingError::DuplicateField { .. }));
    }

    #[test]
    fn tracked_fields_must_be_mapped() {
        let err = ColumnMapping::from_yaml_str(
            "name: m\nversion: '1'\ncolumns:\n  Property ID: { field: property_id }\ntracked_fields: [status]\n",
        )
        .expect_err("invalid");
        assert!(matches!(err, MappingError::UnknownTrackedField(ref f) if f == "status"));
    }

    #[test]
    fn unmapped_policy_parses_case_insensitively() {
        assert_eq!(UnmappedPolicy::parse("Reject"), Some(UnmappedPolicy::Reject));
        assert_eq!(UnmappedPolicy::parse("report"), Some(UnmappedPolicy::Report));
        assert_eq!(UnmappedPolicy::parse("ignore"), None);
    }
}
