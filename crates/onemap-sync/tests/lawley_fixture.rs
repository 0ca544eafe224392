use std::path::{Path, PathBuf};
use std::sync::Arc;

use onemap_core::{fields, BatchStatus};
use onemap_source::{read_snapshot, ColumnMapping};
use onemap_storage::{BackoffPolicy, ImportStore, MemoryStore};
use onemap_sync::validation::{integrity_anomalies, validate_snapshot};
use onemap_sync::{ImportConfig, ImportOptions, ImportPipeline};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture(name: &str) -> PathBuf {
    workspace_root().join("fixtures/onemap").join(name)
}

#[tokio::test]
async fn two_daily_exports_reconcile_into_snapshots_and_changes() {
    let root = workspace_root();
    assert!(fixture("Lawley_01082025.csv").exists());
    assert!(fixture("Lawley_02082025.csv").exists());

    let dir = tempfile::tempdir().expect("tempdir");
    let config = ImportConfig {
        artifacts_dir: dir.path().join("artifacts"),
        reports_dir: dir.path().join("reports"),
        retry: BackoffPolicy::no_delay(2),
        ..ImportConfig::default()
    };
    let mapping =
        ColumnMapping::load(root.join("mappings/onemap-lawley.yaml")).expect("lawley mapping");
    let store = Arc::new(MemoryStore::new());
    let pipeline = ImportPipeline::new(&config, store.clone(), mapping.clone());

    let first = pipeline
        .run(fixture("Lawley_01082025.csv"), &ImportOptions::default())
        .await
        .expect("first import");
    assert_eq!(first.status, BatchStatus::Completed);
    assert_eq!(first.counts.total_rows, 16);
    assert_eq!(first.counts.new_entities, 14);
    assert_eq!(first.counts.processed_rows, 14);
    assert_eq!(first.counts.error_rows, 1);
    assert_eq!(first.counts.duplicate_rows, 1);
    assert_eq!(first.counts.status_changes, 0);
    assert_eq!(first.unmapped_columns.len(), 1);
    assert_eq!(first.unmapped_columns[0].header, "Survey Notes");
    assert!(first.artifact_path.is_some());

    let day_one = store
        .records_for_file("Lawley_01082025.csv")
        .await
        .expect("records");
    let kinds: Vec<&str> = integrity_anomalies(&day_one, &config.validation())
        .iter()
        .map(|a| a.kind())
        .collect();
    assert!(kinds.contains(&"POLE_OVER_CAPACITY"));
    assert!(kinds.contains(&"MISSING_POLE_NUMBERS"));

    let second = pipeline
        .run(fixture("Lawley_02082025.csv"), &ImportOptions::default())
        .await
        .expect("second import");
    assert_eq!(second.counts.total_rows, 14);
    assert_eq!(second.counts.new_entities, 0);
    assert_eq!(second.counts.updated_entities, 2);
    assert_eq!(second.counts.unchanged_entities, 12);
    assert_eq!(second.counts.status_changes, 2);

    let changes = store
        .status_changes_for_batch(second.batch_id)
        .await
        .expect("changes");
    let status = changes
        .iter()
        .find(|c| c.field_name == fields::STATUS)
        .expect("status change");
    assert_eq!(status.entity_id, "249101");
    assert_eq!(
        status.new_value.as_deref(),
        Some("Home Sign Ups: Approved & Installation Scheduled")
    );
    assert_eq!(
        status.previous_source_file.as_deref(),
        Some("Lawley_01082025.csv")
    );
    let pole = changes
        .iter()
        .find(|c| c.field_name == fields::POLE_NUMBER)
        .expect("pole change");
    assert_eq!(pole.entity_id, "249114");
    assert_eq!(pole.old_value, None);

    let snapshot = read_snapshot(fixture("Lawley_02082025.csv"), &mapping).expect("snapshot");
    let stored = store
        .records_for_file(&snapshot.source_file)
        .await
        .expect("stored");
    let report = validate_snapshot(&snapshot, &mapping, &stored, &config.validation());
    assert_eq!(report.summary.missing_in_db, 0);
    assert_eq!(report.summary.missing_in_source, 0);
    assert_eq!(report.summary.accuracy, 100.0);
    assert!(report.passes(config.validation_threshold));
}
