//! Source archive, retry policy and destination stores for OneMap imports.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

mod dry_run;
mod memory;
mod postgres;
mod store;

pub use dry_run::DryRunStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{BatchOutcome, ImportStore, StoreError, WriteMode};

pub const CRATE_NAME: &str = "onemap-storage";

#[derive(Debug, Clone)]
pub struct ArchivedSource {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive of imported spreadsheets, so a batch can always be re-validated
/// against the exact bytes it was built from.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative_path: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative_path)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<project>/<yyyymmdd>_<hash prefix>/<original file name>`; the file name is kept so
    /// the archived copy still carries the batch's `source_file`.
    pub fn archive_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        project: &str,
        content_hash: &str,
        file_name: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d").to_string();
        let prefix = &content_hash[..content_hash.len().min(12)];
        PathBuf::from(slug(project))
            .join(format!("{stamp}_{prefix}"))
            .join(file_name)
    }

    pub async fn archive_file(
        &self,
        captured_at: DateTime<Utc>,
        project: &str,
        source_path: &Path,
    ) -> anyhow::Result<ArchivedSource> {
        let bytes = fs::read(source_path)
            .await
            .with_context(|| format!("reading source file {}", source_path.display()))?;
        let file_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "source.bin".to_string());
        self.archive_bytes(captured_at, project, &file_name, &bytes)
            .await
    }

    /// Writes through a temp file and rename; an identical archive already on disk is reused.
    pub async fn archive_bytes(
        &self,
        captured_at: DateTime<Utc>,
        project: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSource> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.archive_relative_path(captured_at, project, &content_hash, file_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedSource {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

fn slug(input: &str) -> String {
    let slug = input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Connection drops, pool exhaustion, serialization failures and deadlocks are worth
/// another attempt; constraint and decode errors are not.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
            RetryDisposition::Retryable
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code)
                if code.starts_with("08")
                    || code == "40001"
                    || code == "40P01"
                    || code == "57P01" =>
            {
                RetryDisposition::Retryable
            }
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn no_delay(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{operation} failed after {attempts} attempt(s)")]
pub struct RetryExhausted {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub error: StoreError,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy runs out.
pub async fn with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = err.disposition() == RetryDisposition::Retryable;
                if retryable && attempt < policy.max_retries {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(operation, attempt = attempt + 1, ?delay, error = %err, "retrying store operation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(RetryExhausted {
                    operation: operation.to_string(),
                    attempts: (attempt + 1) as u32,
                    error: err,
                });
            }
        }
    }
}
