//! Spreadsheet snapshot reader and column mapper for OneMap exports.

use std::path::{Path, PathBuf};

use onemap_core::RawImportRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod mapping;
mod reader;

pub use mapping::{
    ColumnKind, ColumnMapping, ColumnSpec, MappingError, UnmappedPolicy, SUGGESTION_THRESHOLD,
};

pub const CRATE_NAME: &str = "onemap-source";

const WORKBOOK_EXTENSIONS: [&str; 5] = ["xlsx", "xlsm", "xls", "xlsb", "ods"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported source format {extension:?} for {}", .path.display())]
    UnsupportedFormat { path: PathBuf, extension: String },
    #[error("reading workbook {}: {source}", .path.display())]
    Workbook {
        path: PathBuf,
        source: calamine::Error,
    },
    #[error("workbook {} has no worksheets", .0.display())]
    NoWorksheet(PathBuf),
    #[error("reading csv {}: {source}", .path.display())]
    Csv { path: PathBuf, source: csv::Error },
    #[error("header row {0} is not in the sheet")]
    HeaderRowMissing(u32),
    #[error("sheet has no non-empty rows")]
    EmptySheet,
}

/// Header plus data rows of one spreadsheet, before mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    /// Base name of the file the rows came from.
    pub source_file: String,
    pub header_row: u32,
    pub headers: Vec<String>,
    pub rows: Vec<RawImportRecord>,
    pub skipped_blank_rows: u32,
}

impl SourceSnapshot {
    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }

    /// Keeps only the first `limit` data rows.
    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }
}

pub fn source_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Reads the first worksheet of a workbook, or a CSV file, into raw rows.
pub fn read_snapshot(
    path: impl AsRef<Path>,
    mapping: &ColumnMapping,
) -> Result<SourceSnapshot, SourceError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let grid = if WORKBOOK_EXTENSIONS.contains(&extension.as_str()) {
        reader::workbook_grid(path)?
    } else if extension == "csv" {
        reader::csv_grid(path)?
    } else {
        return Err(SourceError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension,
        });
    };

    reader::snapshot_from_grid(&source_file_name(path), grid, mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace_mapping() -> ColumnMapping {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("mappings/onemap-lawley.yaml");
        ColumnMapping::load(path).expect("workspace mapping loads")
    }

    #[test]
    fn workspace_mapping_is_valid() {
        let mapping = workspace_mapping();
        assert_eq!(mapping.name, "onemap-lawley");
        assert_eq!(mapping.natural_key, "property_id");
        assert_eq!(mapping.natural_key_header(), Some("Property ID"));
        assert_eq!(mapping.kind_for("ID Number"), Some(ColumnKind::Bigint));
        assert!(mapping.tracked_fields.iter().any(|f| f == "status"));
    }

    #[test]
    fn csv_snapshot_maps_through_workspace_mapping() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("Lawley_01082025.csv");
        std::fs::write(
            &path,
            "Property ID,Pole Number,Status,Latitude,Longitude,Surveyor Notes\n\
             249111,LAW.P.A001,Pole Permission: Approved,-26.3850,27.8073,gate locked\n\
             \n\
             249112,,Home Sign Ups: Approved,-26.3851,27.8074,\n",
        )
        .expect("write csv");

        let mapping = workspace_mapping();
        let snapshot = read_snapshot(&path, &mapping).expect("snapshot");
        assert_eq!(snapshot.source_file, "Lawley_01082025.csv");
        assert_eq!(snapshot.header_row, 1);
        assert_eq!(snapshot.total_rows(), 2);
        assert_eq!(snapshot.rows[0].row_number, 2);

        let first = mapping.map_row(&snapshot.rows[0]);
        assert_eq!(first.natural_key.as_deref(), Some("249111"));
        assert_eq!(first.display("pole_number").as_deref(), Some("LAW.P.A001"));
        assert_eq!(first.mapped_field_count(), 5);
        assert_eq!(
            first.extras.get("Surveyor Notes").map(String::as_str),
            Some("gate locked")
        );

        let unmapped = mapping.unmapped_columns(&snapshot.headers);
        assert_eq!(unmapped.len(), 1);
        assert_eq!(unmapped[0].header, "Surveyor Notes");
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        let err = read_snapshot("export.json", &workspace_mapping()).expect_err("unsupported");
        assert!(matches!(err, SourceError::UnsupportedFormat { ref extension, .. } if extension == "json"));
    }

    #[test]
    fn truncate_limits_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a.csv");
        std::fs::write(&path, "Property ID\n1\n2\n3\n").expect("write csv");
        let mut snapshot = read_snapshot(&path, &workspace_mapping()).expect("snapshot");
        snapshot.truncate(2);
        assert_eq!(snapshot.total_rows(), 2);
    }
}
