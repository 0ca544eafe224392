use std::collections::BTreeMap;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Range, Reader};
use chrono::{NaiveDateTime, NaiveTime};
use onemap_core::RawImportRecord;
use tracing::debug;

use crate::mapping::ColumnMapping;
use crate::{SourceError, SourceSnapshot};

/// Rows scanned for the natural-key header before falling back to the first non-empty row.
const HEADER_SCAN_ROWS: usize = 10;

/// One sheet row: 1-based row number plus rendered cell text.
pub(crate) type GridRow = (u32, Vec<String>);

pub(crate) fn workbook_grid(path: &Path) -> Result<Vec<GridRow>, SourceError> {
    let mut workbook = open_workbook_auto(path).map_err(|source| SourceError::Workbook {
        path: path.to_path_buf(),
        source,
    })?;
    let sheet_names = workbook.sheet_names();
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| SourceError::NoWorksheet(path.to_path_buf()))?
        .map_err(|source| SourceError::Workbook {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(
        path = %path.display(),
        sheet = sheet_names.first().map(String::as_str).unwrap_or_default(),
        "reading first worksheet"
    );
    Ok(range_grid(&range))
}

pub(crate) fn range_grid(range: &Range<Data>) -> Vec<GridRow> {
    let first_row = range.start().map(|(row, _)| row).unwrap_or(0);
    range
        .rows()
        .enumerate()
        .map(|(index, cells)| {
            let row_number = first_row + index as u32 + 1;
            (row_number, cells.iter().map(render_cell).collect())
        })
        .collect()
}

pub(crate) fn csv_grid(path: &Path) -> Result<Vec<GridRow>, SourceError> {
    let csv_error = |source| SourceError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_error)?;

    let mut grid = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(csv_error)?;
        let row_number = record
            .position()
            .map(|p| p.line() as u32)
            .unwrap_or(index as u32 + 1);
        grid.push((row_number, record.iter().map(str::to_string).collect()));
    }
    Ok(grid)
}

fn render_cell(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(v) => v.to_string(),
        Data::Float(v) => render_float(*v),
        Data::Bool(v) => v.to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(value) => render_datetime(value),
            None => render_float(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
    }
}

fn render_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn render_datetime(value: NaiveDateTime) -> String {
    if value.time() == NaiveTime::MIN {
        value.format("%Y-%m-%d").to_string()
    } else {
        value.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

fn clean_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_string()
}

fn is_blank(cells: &[String]) -> bool {
    cells.iter().all(|c| c.trim().is_empty())
}

/// Position in `grid` of the header row.
fn find_header(grid: &[GridRow], mapping: &ColumnMapping) -> Result<usize, SourceError> {
    if let Some(pinned) = mapping.header_row {
        return grid
            .iter()
            .position(|(row, _)| *row == pinned)
            .ok_or(SourceError::HeaderRowMissing(pinned));
    }
    if let Some(key_header) = mapping.natural_key_header() {
        if let Some(index) = grid
            .iter()
            .take(HEADER_SCAN_ROWS)
            .position(|(_, cells)| cells.iter().any(|c| clean_header(c) == key_header))
        {
            return Ok(index);
        }
    }
    grid.iter()
        .position(|(_, cells)| !is_blank(cells))
        .ok_or(SourceError::EmptySheet)
}

/// Empty header cells yield `None`; repeats get `_1`, `_2`, ... suffixes.
fn unique_headers(cells: &[String]) -> Vec<Option<String>> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    cells
        .iter()
        .map(|cell| {
            let header = clean_header(cell);
            if header.is_empty() {
                return None;
            }
            let count = seen.entry(header.clone()).or_insert(0);
            let name = if *count == 0 {
                header
            } else {
                format!("{header}_{count}")
            };
            *count += 1;
            Some(name)
        })
        .collect()
}

pub(crate) fn snapshot_from_grid(
    source_file: &str,
    grid: Vec<GridRow>,
    mapping: &ColumnMapping,
) -> Result<SourceSnapshot, SourceError> {
    let header_index = find_header(&grid, mapping)?;
    let (header_row, header_cells) = &grid[header_index];
    let columns = unique_headers(header_cells);
    let headers: Vec<String> = columns.iter().flatten().cloned().collect();

    let mut rows = Vec::new();
    let mut skipped_blank_rows = 0u32;
    for (row_number, cells) in grid.iter().skip(header_index + 1) {
        if is_blank(cells) {
            skipped_blank_rows += 1;
            continue;
        }
        let mut record_cells = BTreeMap::new();
        for (index, column) in columns.iter().enumerate() {
            let Some(header) = column else {
                continue;
            };
            let value = cells.get(index).map(|c| c.trim()).unwrap_or_default();
            record_cells.insert(header.clone(), value.to_string());
        }
        rows.push(RawImportRecord {
            source_file: source_file.to_string(),
            row_number: *row_number,
            cells: record_cells,
        });
    }

    Ok(SourceSnapshot {
        source_file: source_file.to_string(),
        header_row: *header_row,
        headers,
        rows,
        skipped_blank_rows,
    })
}
