use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, Utc};
use onemap_core::ImportBatch;

use crate::ImportReport;

#[derive(Template)]
#[template(path = "import_report.html")]
struct ImportReportTemplate<'a> {
    report: &'a ImportReport,
    generated_at: String,
    started_at: String,
    duration: String,
}

/// `<rfc3339> | <file> | Rows: n | New: n | Updated: n | Changes: n | Status: s`
pub fn history_line(batch: &ImportBatch, at: DateTime<Utc>) -> String {
    format!(
        "{} | {} | Rows: {} | New: {} | Updated: {} | Changes: {} | Status: {}",
        at.to_rfc3339(),
        batch.source_file,
        batch.counts.total_rows,
        batch.counts.new_entities,
        batch.counts.updated_entities,
        batch.counts.status_changes,
        batch.status
    )
}

fn duration_label(batch: &ImportBatch) -> String {
    match batch.import_completed {
        Some(done) => {
            let millis = (done - batch.import_started).num_milliseconds().max(0);
            format!("{:.1}s", millis as f64 / 1000.0)
        }
        None => "in progress".to_string(),
    }
}

fn or_null(value: Option<&str>) -> &str {
    value.unwrap_or("NULL")
}

pub fn render_text(report: &ImportReport) -> String {
    let batch = &report.batch;
    let counts = &batch.counts;
    let stats = &report.statistics;
    let mut lines = vec![
        "ONEMAP IMPORT REPORT".to_string(),
        "====================".to_string(),
        format!("Generated: {}", report.generated_at.to_rfc3339()),
        String::new(),
        format!("Batch ID: {}", batch.id),
        format!("Project: {}", batch.project_name),
        format!("Source File: {}", batch.source_file),
        format!("Mapping: {} {}", batch.mapping_name, batch.mapping_version),
        format!("Status: {}", batch.status),
        format!("Started: {}", batch.import_started.to_rfc3339()),
        format!("Duration: {}", duration_label(batch)),
        String::new(),
        format!("Total Rows: {}", counts.total_rows),
        format!("Processed: {}", counts.processed_rows),
        format!("New Entities: {}", counts.new_entities),
        format!("Updated Entities: {}", counts.updated_entities),
        format!("Unchanged Entities: {}", counts.unchanged_entities),
        format!("Duplicate Rows: {}", counts.duplicate_rows),
        format!("Errors: {}", counts.error_rows),
        format!("Status Changes: {}", counts.status_changes),
        format!("Dead Letters: {}", counts.dead_letters),
        String::new(),
        format!("Unique Properties: {}", stats.unique_properties),
        format!("Unique Poles: {}", stats.unique_poles),
        format!("Unique Agents: {}", stats.unique_agents),
        format!("Average Quality Score: {:.2}", stats.average_quality_score),
        format!("Records With Status: {}", stats.records_with_status),
        format!("Records With Poles: {}", stats.records_with_poles),
    ];
    if let Some(details) = &batch.error_details {
        lines.push(format!("Error: {details}"));
    }

    lines.extend([
        String::new(),
        "DATA QUALITY".to_string(),
        "------------".to_string(),
    ]);
    for bucket in &report.quality_distribution {
        lines.push(format!(
            "{}: {} records ({:.1}%, avg {:.2})",
            bucket.label, bucket.record_count, bucket.percentage, bucket.average_score
        ));
    }

    lines.extend([
        String::new(),
        "CHANGE SUMMARY".to_string(),
        "--------------".to_string(),
    ]);
    if report.change_summary.is_empty() {
        lines.push("No tracked field changes.".to_string());
    }
    for summary in &report.change_summary {
        lines.push(format!(
            "{}: {} changes affecting {} records",
            summary.field_name, summary.changes, summary.affected_entities
        ));
    }

    lines.extend([
        String::new(),
        "TOP STATUS CHANGES".to_string(),
        "------------------".to_string(),
    ]);
    for change in &report.top_status_changes {
        lines.push(format!(
            "{}: \"{}\" -> \"{}\" at {}",
            change.entity_id,
            or_null(change.old_value.as_deref()),
            or_null(change.new_value.as_deref()),
            change.change_date.to_rfc3339()
        ));
    }

    if !report.anomalies.is_empty() {
        lines.extend([
            String::new(),
            "ANOMALIES".to_string(),
            "---------".to_string(),
        ]);
        for anomaly in &report.anomalies {
            lines.push(format!("{}: {}", anomaly.kind(), anomaly.message()));
        }
    }

    if !batch.unmapped_columns.is_empty() {
        lines.extend([
            String::new(),
            "UNMAPPED COLUMNS".to_string(),
            "----------------".to_string(),
        ]);
        for column in &batch.unmapped_columns {
            match &column.suggestion {
                Some(suggestion) => lines.push(format!(
                    "{} (did you mean \"{}\"?)",
                    column.header, suggestion
                )),
                None => lines.push(column.header.clone()),
            }
        }
    }

    if !batch.dead_letters.is_empty() {
        lines.extend([
            String::new(),
            "DEAD LETTERS".to_string(),
            "------------".to_string(),
        ]);
        for letter in &batch.dead_letters {
            lines.push(format!(
                "row {} ({}): {} after {} attempt(s)",
                letter.row_number,
                letter.natural_key.as_deref().unwrap_or("no key"),
                letter.error,
                letter.attempts
            ));
        }
    }

    if !batch.issues_sample.is_empty() {
        lines.extend([
            String::new(),
            "ROW ISSUES (SAMPLE)".to_string(),
            "-------------------".to_string(),
        ]);
        for issue in &batch.issues_sample {
            lines.push(format!("row {}: {}", issue.row_number, issue.message));
        }
    }

    if let Some(validation) = &report.validation {
        let summary = &validation.summary;
        lines.extend([
            String::new(),
            "VALIDATION RESULTS".to_string(),
            "------------------".to_string(),
            format!("Records Checked: {}", summary.validated_records),
            format!("Passed: {}", summary.passed_records),
            format!("Failed: {}", summary.failed_records),
            format!("Missing In Database: {}", summary.missing_in_db),
            format!("Missing In Source: {}", summary.missing_in_source),
            format!("Accuracy: {:.1}%", summary.accuracy),
        ]);
    }

    lines.push(String::new());
    lines.join("\n")
}

pub fn render_html(report: &ImportReport) -> Result<String> {
    ImportReportTemplate {
        report,
        generated_at: report.generated_at.to_rfc3339(),
        started_at: report.batch.import_started.to_rfc3339(),
        duration: duration_label(&report.batch),
    }
    .render()
    .with_context(|| format!("rendering html report for batch {}", report.batch.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::stored;
    use onemap_core::{DeadLetter, UnmappedColumn};
    use onemap_sync::ValidationConfig;
    use uuid::Uuid;

    fn sample_report() -> ImportReport {
        let mut batch = ImportBatch::begin(Uuid::new_v4(), "Lawley", "lawley <june>.xlsx", 3);
        batch.unmapped_columns.push(UnmappedColumn {
            header: "Stat".into(),
            suggestion: Some("Status".into()),
            similarity: Some(0.9),
        });
        batch.dead_letters.push(DeadLetter {
            row_number: 7,
            natural_key: Some("303".into()),
            error: "constraint violated".into(),
            attempts: 1,
        });
        let records: Vec<_> = (0..13)
            .map(|i| stored(&format!("{}", 100 + i), Some("Approved"), Some("LAW.P.A001"), 0.8))
            .collect();
        ImportReport::build(batch, &records, &[], None, &ValidationConfig::default())
    }

    #[test]
    fn history_line_has_fixed_layout() {
        let mut batch = ImportBatch::begin(Uuid::nil(), "Lawley", "a.xlsx", 10);
        batch.counts.new_entities = 4;
        batch.counts.updated_entities = 3;
        batch.counts.status_changes = 2;
        let at = DateTime::parse_from_rfc3339("2025-08-01T10:00:00+00:00")
            .expect("timestamp")
            .with_timezone(&Utc);
        assert_eq!(
            history_line(&batch, at),
            "2025-08-01T10:00:00+00:00 | a.xlsx | Rows: 10 | New: 4 | Updated: 3 | Changes: 2 | Status: processing"
        );
    }

    #[test]
    fn text_report_lists_anomalies_and_dead_letters() {
        let text = render_text(&sample_report());
        assert!(text.contains("Unique Properties: 13"));
        assert!(text.contains("POLE_OVER_CAPACITY"));
        assert!(text.contains("Stat (did you mean \"Status\"?)"));
        assert!(text.contains("row 7 (303): constraint violated after 1 attempt(s)"));
        assert!(!text.contains("VALIDATION RESULTS"));
    }

    #[test]
    fn html_report_escapes_values() {
        let html = render_html(&sample_report()).expect("render");
        assert!(html.contains("lawley &lt;june&gt;.xlsx"));
        assert!(html.contains("POLE_OVER_CAPACITY"));
        assert!(html.contains("in progress"));
    }
}
