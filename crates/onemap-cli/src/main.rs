use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use onemap_core::ImportBatch;
use onemap_report::{history_line, ReportOptions, ReportWriter};
use onemap_source::{read_snapshot, ColumnMapping, UnmappedPolicy};
use onemap_storage::{ArtifactStore, ImportStore, PostgresStore};
use onemap_sync::validation::validate_snapshot;
use onemap_sync::{BatchTracker, ImportConfig, ImportOptions, ImportPipeline, ValidationReport};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "onemap")]
#[command(version, about = "Import OneMap spreadsheet exports into the PostgreSQL staging store")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for `ImportConfig::from_env`.
#[derive(Debug, Clone, Default, Args)]
struct GlobalArgs {
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Column mapping artifact (YAML).
    #[arg(long, global = true)]
    mapping: Option<PathBuf>,

    #[arg(long, global = true)]
    project: Option<String>,

    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one spreadsheet (xlsx/xls/ods/csv) as a new batch.
    Import(ImportArgs),
    /// Compare a spreadsheet with the records stored for it.
    Validate(ValidateArgs),
    /// Write reports for a batch (the latest one by default).
    Report(ReportArgs),
    /// List recent import batches.
    History(HistoryArgs),
    /// Apply database migrations.
    Migrate,
    /// Fail batches stuck in `processing`.
    Recover(RecoverArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    file: PathBuf,

    /// Run every step without persisting rows, batches or archives.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Only process the first N data rows.
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long)]
    batch_id: Option<Uuid>,

    /// Skip report generation after the import.
    #[arg(long, default_value_t = false)]
    no_report: bool,

    /// Fail the batch when the sheet has columns the mapping does not know.
    #[arg(long, default_value_t = false)]
    reject_unmapped: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    file: PathBuf,

    #[arg(long)]
    batch_id: Option<Uuid>,

    /// Compare every mapped field instead of the key fields.
    #[arg(long, default_value_t = false)]
    full: bool,

    /// Minimum accuracy in percent.
    #[arg(long)]
    threshold: Option<f64>,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long)]
    batch_id: Option<Uuid>,

    /// Re-validate the archived source file and include the results.
    #[arg(long, default_value_t = false)]
    validate: bool,

    #[arg(long, default_value_t = false)]
    no_snapshots: bool,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
struct RecoverArgs {
    #[arg(long, default_value_t = 24)]
    older_than_hours: i64,
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run(Cli::parse()).await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(mut config: ImportConfig, global: &GlobalArgs) -> ImportConfig {
    if let Some(url) = &global.database_url {
        config.database_url = url.clone();
    }
    if let Some(mapping) = &global.mapping {
        config.mapping_path = mapping.clone();
    }
    if let Some(project) = &global.project {
        config.project_name = project.clone();
    }
    if let Some(dir) = &global.reports_dir {
        config.reports_dir = dir.clone();
    }
    config
}

async fn run(cli: Cli) -> Result<()> {
    let config = apply_overrides(ImportConfig::from_env(), &cli.global);

    match cli.command {
        Commands::Import(args) => import(&config, args).await,
        Commands::Validate(args) => validate(&config, args).await,
        Commands::Report(args) => report(&config, args).await,
        Commands::History(args) => history(&config, args).await,
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
            store.close().await;
            Ok(())
        }
        Commands::Recover(args) => {
            let store = connect(&config).await?;
            let tracker = BatchTracker::new(store.clone(), config.retry);
            let failed = tracker.recover_stale(args.older_than_hours).await?;
            println!("recovered {} stale batch(es)", failed.len());
            store.close().await;
            Ok(())
        }
    }
}

async fn connect(config: &ImportConfig) -> Result<Arc<PostgresStore>> {
    let store = PostgresStore::connect(&config.database_url)
        .await
        .context("connecting to the staging database")?;
    Ok(Arc::new(store))
}

fn load_mapping(config: &ImportConfig) -> Result<ColumnMapping> {
    ColumnMapping::load(&config.mapping_path)
        .with_context(|| format!("loading column mapping {}", config.mapping_path.display()))
}

async fn import(config: &ImportConfig, args: ImportArgs) -> Result<()> {
    let mapping = load_mapping(config)?;
    let store = connect(config).await?;
    let pipeline = ImportPipeline::new(config, store.clone(), mapping);
    let options = ImportOptions {
        dry_run: args.dry_run,
        limit: args.limit,
        batch_id: args.batch_id,
        unmapped_policy: if args.reject_unmapped {
            UnmappedPolicy::Reject
        } else {
            config.unmapped_policy
        },
    };

    let summary = pipeline.run(&args.file, &options).await?;
    let counts = &summary.counts;
    println!(
        "import {}: batch_id={} rows={} processed={} new={} updated={} unchanged={} duplicates={} errors={} changes={} dead_letters={}",
        summary.status,
        summary.batch_id,
        counts.total_rows,
        counts.processed_rows,
        counts.new_entities,
        counts.updated_entities,
        counts.unchanged_entities,
        counts.duplicate_rows,
        counts.error_rows,
        counts.status_changes,
        counts.dead_letters
    );
    for column in &summary.unmapped_columns {
        warn!(header = %column.header, suggestion = ?column.suggestion, "unmapped column kept in extras");
    }

    if summary.dry_run || args.no_report {
        store.close().await;
        return Ok(());
    }
    let writer = ReportWriter::new(&config.reports_dir);
    let (_, paths) = writer
        .generate(
            store.as_ref(),
            Some(summary.batch_id),
            ReportOptions {
                validation: None,
                validation_config: config.validation(),
                export_snapshots: true,
            },
        )
        .await?;
    println!("report: {}", paths.batch_dir.display());
    store.close().await;
    Ok(())
}

async fn validation_for(
    config: &ImportConfig,
    store: &dyn ImportStore,
    mapping: ColumnMapping,
    file: &Path,
    full: bool,
) -> Result<ValidationReport> {
    let owned = file.to_path_buf();
    let reader_mapping = mapping.clone();
    let snapshot = tokio::task::spawn_blocking(move || read_snapshot(&owned, &reader_mapping))
        .await
        .context("joining source reader task")?
        .with_context(|| format!("reading source file {}", file.display()))?;
    let stored = store
        .records_for_file(&snapshot.source_file)
        .await
        .with_context(|| format!("loading stored records for {}", snapshot.source_file))?;
    let validation_config = onemap_sync::ValidationConfig {
        full,
        ..config.validation()
    };
    Ok(validate_snapshot(&snapshot, &mapping, &stored, &validation_config))
}

async fn validate(config: &ImportConfig, args: ValidateArgs) -> Result<()> {
    let mapping = load_mapping(config)?;
    let store = connect(config).await?;
    let mut report = validation_for(config, store.as_ref(), mapping, &args.file, args.full).await?;
    if args.batch_id.is_some() {
        report.batch_id = args.batch_id;
    }
    store.close().await;

    let path = ReportWriter::new(&config.reports_dir)
        .write_validation(&report)
        .await?;
    let summary = &report.summary;
    println!(
        "validation: checked={} passed={} failed={} missing_in_db={} missing_in_source={} accuracy={:.1}% anomalies={} report={}",
        summary.validated_records,
        summary.passed_records,
        summary.failed_records,
        summary.missing_in_db,
        summary.missing_in_source,
        summary.accuracy,
        report.anomalies.len(),
        path.display()
    );

    let threshold = args.threshold.unwrap_or(config.validation_threshold);
    if !report.passes(threshold) {
        bail!(
            "validation accuracy {:.1}% is below the {:.1}% threshold",
            summary.accuracy,
            threshold
        );
    }
    Ok(())
}

async fn report(config: &ImportConfig, args: ReportArgs) -> Result<()> {
    let store = connect(config).await?;
    let batch = select_batch(store.as_ref(), args.batch_id).await?;

    let validation = if args.validate {
        let artifact = batch
            .artifact_path
            .as_deref()
            .with_context(|| format!("batch {} has no archived source file", batch.id))?;
        let path = ArtifactStore::new(&config.artifacts_dir).resolve(artifact);
        let mapping = load_mapping(config)?;
        let mut report = validation_for(config, store.as_ref(), mapping, &path, false).await?;
        report.batch_id = Some(batch.id);
        Some(report)
    } else {
        None
    };

    let writer = ReportWriter::new(&config.reports_dir);
    if let Some(validation) = &validation {
        writer.write_validation(validation).await?;
    }
    let (_, paths) = writer
        .generate(
            store.as_ref(),
            Some(batch.id),
            ReportOptions {
                validation,
                validation_config: config.validation(),
                export_snapshots: !args.no_snapshots,
            },
        )
        .await?;
    println!("report: {}", paths.batch_dir.display());
    store.close().await;
    Ok(())
}

async fn select_batch(store: &dyn ImportStore, batch_id: Option<Uuid>) -> Result<ImportBatch> {
    match batch_id {
        Some(id) => store
            .get_batch(id)
            .await
            .with_context(|| format!("loading import batch {id}"))?
            .with_context(|| format!("import batch {id} not found")),
        None => store
            .latest_batch()
            .await
            .context("loading latest import batch")?
            .context("no import batch found"),
    }
}

async fn history(config: &ImportConfig, args: HistoryArgs) -> Result<()> {
    let store = connect(config).await?;
    let batches = store
        .list_batches(args.limit)
        .await
        .context("listing import batches")?;
    if batches.is_empty() {
        println!("no import batches");
    }
    for batch in &batches {
        println!("{} | {}", batch.id, history_line(batch, batch.import_started));
        if let Some(details) = &batch.error_details {
            println!("    error: {details}");
        }
    }
    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_flags_parse() {
        let cli = Cli::try_parse_from([
            "onemap",
            "import",
            "Lawley.xlsx",
            "--dry-run",
            "--limit",
            "50",
            "--reject-unmapped",
            "--project",
            "Mohadin",
        ])
        .expect("parse");
        assert_eq!(cli.global.project.as_deref(), Some("Mohadin"));
        match cli.command {
            Commands::Import(args) => {
                assert_eq!(args.file, PathBuf::from("Lawley.xlsx"));
                assert!(args.dry_run);
                assert_eq!(args.limit, Some(50));
                assert!(args.reject_unmapped);
                assert!(!args.no_report);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn invalid_batch_id_is_rejected() {
        let err = Cli::try_parse_from(["onemap", "report", "--batch-id", "not-a-uuid"])
            .expect_err("uuid required");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn validate_and_recover_defaults() {
        let cli = Cli::try_parse_from(["onemap", "validate", "a.csv", "--full"]).expect("parse");
        match cli.command {
            Commands::Validate(args) => {
                assert!(args.full);
                assert_eq!(args.threshold, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
        let cli = Cli::try_parse_from(["onemap", "recover"]).expect("parse");
        match cli.command {
            Commands::Recover(args) => assert_eq!(args.older_than_hours, 24),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn overrides_replace_environment_values() {
        let global = GlobalArgs {
            database_url: Some("postgres://other/db".into()),
            mapping: Some(PathBuf::from("mappings/custom.yaml")),
            project: None,
            reports_dir: Some(PathBuf::from("/tmp/reports")),
        };
        let config = apply_overrides(ImportConfig::default(), &global);
        assert_eq!(config.database_url, "postgres://other/db");
        assert_eq!(config.mapping_path, PathBuf::from("mappings/custom.yaml"));
        assert_eq!(config.project_name, "Lawley");
        assert_eq!(config.reports_dir, PathBuf::from("/tmp/reports"));
    }
}
