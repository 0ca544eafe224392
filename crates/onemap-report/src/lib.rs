//! Import reports: text, JSON and HTML renderings of a batch plus the import history log.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use onemap_core::{fields, ImportBatch, QualityTier, StatusChange, StoredRecord};
use onemap_storage::ImportStore;
use onemap_sync::validation::integrity_anomalies;
use onemap_sync::{export_snapshots, Anomaly, ValidationConfig, ValidationReport};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

mod render;

pub use render::{history_line, render_html, render_text};

pub const CRATE_NAME: &str = "onemap-report";

pub const HISTORY_LOG: &str = "import-history.log";
pub const TOP_STATUS_CHANGES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportStatistics {
    pub total_records: usize,
    pub unique_properties: usize,
    pub unique_poles: usize,
    pub unique_agents: usize,
    pub average_quality_score: f64,
    pub records_with_status: usize,
    pub records_with_poles: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityBucket {
    pub tier: QualityTier,
    pub label: String,
    pub record_count: usize,
    pub percentage: f64,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChangeSummary {
    pub field_name: String,
    pub changes: usize,
    pub affected_entities: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub generated_at: DateTime<Utc>,
    pub batch: ImportBatch,
    pub statistics: ReportStatistics,
    pub quality_distribution: Vec<QualityBucket>,
    pub change_summary: Vec<FieldChangeSummary>,
    pub top_status_changes: Vec<StatusChange>,
    pub anomalies: Vec<Anomaly>,
    pub validation: Option<ValidationReport>,
}

impl ImportReport {
    pub fn build(
        batch: ImportBatch,
        records: &[StoredRecord],
        changes: &[StatusChange],
        validation: Option<ValidationReport>,
        config: &ValidationConfig,
    ) -> Self {
        // Stored rows are unique per file; repeated ids only surface in source validation.
        let mut anomalies: Vec<Anomaly> = validation
            .iter()
            .flat_map(|v| v.anomalies.iter())
            .filter(|a| matches!(a, Anomaly::DuplicatePropertyIds { .. }))
            .cloned()
            .collect();
        anomalies.extend(integrity_anomalies(records, config));
        Self {
            generated_at: Utc::now(),
            statistics: statistics(records),
            quality_distribution: quality_distribution(records),
            change_summary: change_summary(changes),
            top_status_changes: top_status_changes(changes),
            anomalies,
            validation,
            batch,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn statistics(records: &[StoredRecord]) -> ReportStatistics {
    if records.is_empty() {
        return ReportStatistics::default();
    }
    let distinct = |field: &str| -> usize {
        records
            .iter()
            .filter_map(|r| r.record.display(field))
            .collect::<HashSet<_>>()
            .len()
    };
    let total_score: f64 = records.iter().map(|r| r.data_quality_score).sum();
    ReportStatistics {
        total_records: records.len(),
        unique_properties: records
            .iter()
            .map(|r| r.natural_key.as_str())
            .collect::<HashSet<_>>()
            .len(),
        unique_poles: distinct(fields::POLE_NUMBER),
        unique_agents: distinct(fields::FIELD_AGENT_NAME),
        average_quality_score: round2(total_score / records.len() as f64),
        records_with_status: records
            .iter()
            .filter(|r| r.record.is_present(fields::STATUS))
            .count(),
        records_with_poles: records
            .iter()
            .filter(|r| r.record.is_present(fields::POLE_NUMBER))
            .count(),
    }
}

/// One bucket per tier, best first, including empty tiers.
pub fn quality_distribution(records: &[StoredRecord]) -> Vec<QualityBucket> {
    let mut scores: BTreeMap<QualityTier, Vec<f64>> = BTreeMap::new();
    for record in records {
        scores
            .entry(QualityTier::for_score(record.data_quality_score))
            .or_default()
            .push(record.data_quality_score);
    }
    [
        QualityTier::Excellent,
        QualityTier::Good,
        QualityTier::Fair,
        QualityTier::Poor,
    ]
    .into_iter()
    .map(|tier| {
        let tier_scores = scores.get(&tier).map(Vec::as_slice).unwrap_or_default();
        let record_count = tier_scores.len();
        let (percentage, average_score) = if record_count == 0 {
            (0.0, 0.0)
        } else {
            (
                ((record_count as f64 / records.len() as f64) * 1000.0).round() / 10.0,
                round2(tier_scores.iter().sum::<f64>() / record_count as f64),
            )
        };
        QualityBucket {
            tier,
            label: tier.label().to_string(),
            record_count,
            percentage,
            average_score,
        }
    })
    .collect()
}

/// Changes per field, most changed first.
pub fn change_summary(changes: &[StatusChange]) -> Vec<FieldChangeSummary> {
    let mut by_field: BTreeMap<&str, (usize, BTreeSet<&str>)> = BTreeMap::new();
    for change in changes {
        let entry = by_field.entry(change.field_name.as_str()).or_default();
        entry.0 += 1;
        entry.1.insert(change.entity_id.as_str());
    }
    let mut summary: Vec<FieldChangeSummary> = by_field
        .into_iter()
        .map(|(field, (count, entities))| FieldChangeSummary {
            field_name: field.to_string(),
            changes: count,
            affected_entities: entities.len(),
        })
        .collect();
    summary.sort_by(|a, b| b.changes.cmp(&a.changes).then(a.field_name.cmp(&b.field_name)));
    summary
}

/// The most recent `status` changes, newest first.
pub fn top_status_changes(changes: &[StatusChange]) -> Vec<StatusChange> {
    let mut status: Vec<StatusChange> = changes
        .iter()
        .filter(|c| c.field_name == fields::STATUS)
        .cloned()
        .collect();
    status.sort_by(|a, b| {
        b.change_date
            .cmp(&a.change_date)
            .then(a.entity_id.cmp(&b.entity_id))
    });
    status.truncate(TOP_STATUS_CHANGES);
    status
}

#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    pub validation: Option<ValidationReport>,
    pub validation_config: ValidationConfig,
    pub export_snapshots: bool,
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub batch_dir: PathBuf,
    pub text: PathBuf,
    pub json: PathBuf,
    pub html: PathBuf,
    pub history_log: PathBuf,
    pub snapshot_manifest: Option<PathBuf>,
}

/// Writes reports under `reports_dir`: one directory per batch plus the shared history log.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    reports_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    pub fn batch_dir(&self, batch_id: Uuid) -> PathBuf {
        self.reports_dir.join(batch_id.to_string())
    }

    pub fn history_log(&self) -> PathBuf {
        self.reports_dir.join(HISTORY_LOG)
    }

    /// Loads the batch (`batch_id`, or the most recent one) and its data from `store`
    /// and writes every report format.
    pub async fn generate(
        &self,
        store: &dyn ImportStore,
        batch_id: Option<Uuid>,
        options: ReportOptions,
    ) -> Result<(ImportReport, ReportPaths)> {
        let batch = match batch_id {
            Some(id) => store
                .get_batch(id)
                .await
                .with_context(|| format!("loading import batch {id}"))?
                .with_context(|| format!("import batch {id} not found"))?,
            None => store
                .latest_batch()
                .await
                .context("loading latest import batch")?
                .context("no import batch found")?,
        };
        let records = store
            .records_for_file(&batch.source_file)
            .await
            .with_context(|| format!("loading records for {}", batch.source_file))?;
        let changes = store
            .status_changes_for_batch(batch.id)
            .await
            .with_context(|| format!("loading status changes for batch {}", batch.id))?;

        let report = ImportReport::build(
            batch,
            &records,
            &changes,
            options.validation,
            &options.validation_config,
        );
        let mut paths = self.write(&report).await?;
        if options.export_snapshots {
            let batch_dir = paths.batch_dir.clone();
            let batch_id = report.batch.id;
            let manifest = tokio::task::spawn_blocking(move || {
                export_snapshots(&batch_dir, batch_id, &records, &changes)
            })
            .await
            .context("snapshot export task panicked")??;
            info!(batch_id = %report.batch.id, manifest = %manifest.display(), "parquet snapshots exported");
            paths.snapshot_manifest = Some(manifest);
        }
        Ok((report, paths))
    }

    pub async fn write(&self, report: &ImportReport) -> Result<ReportPaths> {
        let batch_dir = self.batch_dir(report.batch.id);
        tokio::fs::create_dir_all(&batch_dir)
            .await
            .with_context(|| format!("creating {}", batch_dir.display()))?;

        let text = batch_dir.join("import-report.txt");
        write_file(&text, render_text(report).as_bytes()).await?;

        let json = batch_dir.join("import-report.json");
        let json_bytes = serde_json::to_vec_pretty(report).context("serializing import report")?;
        write_file(&json, &json_bytes).await?;

        let html = batch_dir.join("import-report.html");
        write_file(&html, render_html(report)?.as_bytes()).await?;

        let history_log = self.append_history(&report.batch, Utc::now()).await?;
        info!(batch_id = %report.batch.id, dir = %batch_dir.display(), "import report written");

        Ok(ReportPaths {
            batch_dir,
            text,
            json,
            html,
            history_log,
            snapshot_manifest: None,
        })
    }

    pub async fn append_history(&self, batch: &ImportBatch, at: DateTime<Utc>) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.reports_dir)
            .await
            .with_context(|| format!("creating {}", self.reports_dir.display()))?;
        let path = self.history_log();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let line = format!("{}\n", history_line(batch, at));
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", path.display()))?;
        Ok(path)
    }

    /// Saves a validation report as `validation-<timestamp>.json`.
    pub async fn write_validation(&self, report: &ValidationReport) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.reports_dir)
            .await
            .with_context(|| format!("creating {}", self.reports_dir.display()))?;
        let path = self.reports_dir.join(format!(
            "validation-{}.json",
            report.generated_at.format("%Y%m%dT%H%M%S%.3fZ")
        ));
        let bytes = serde_json::to_vec_pretty(report).context("serializing validation report")?;
        write_file(&path, &bytes).await?;
        Ok(path)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}
