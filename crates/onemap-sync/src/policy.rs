use onemap_core::{FieldDifference, MappedRecord, StoredRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOutcome {
    New,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordWrite {
    Insert,
    Update(Uuid),
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub outcome: EntityOutcome,
    pub write: RecordWrite,
    pub changes: Vec<FieldDifference>,
    pub previous_source_file: Option<String>,
}

/// Decides what happens to one keyed row given what the store already holds.
pub trait ReconciliationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `same_file` is the row already stored for this source file; `prior` is the latest
    /// snapshot of the key from any other file and is only consulted when `same_file` is absent.
    fn reconcile(
        &self,
        incoming: &MappedRecord,
        incoming_hash: &str,
        same_file: Option<&StoredRecord>,
        prior: Option<&StoredRecord>,
        tracked_fields: &[String],
    ) -> Reconciliation;
}

/// One snapshot row per (source file, key); re-imports of a file update in place, new
/// files append a snapshot and diff it against the previous one.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalPolicy;

impl ReconciliationPolicy for CanonicalPolicy {
    fn name(&self) -> &'static str {
        "canonical"
    }

    fn reconcile(
        &self,
        incoming: &MappedRecord,
        incoming_hash: &str,
        same_file: Option<&StoredRecord>,
        prior: Option<&StoredRecord>,
        tracked_fields: &[String],
    ) -> Reconciliation {
        if let Some(existing) = same_file {
            if existing.content_hash == incoming_hash {
                return Reconciliation {
                    outcome: EntityOutcome::Unchanged,
                    write: RecordWrite::Skip,
                    changes: Vec::new(),
                    previous_source_file: None,
                };
            }
            return Reconciliation {
                outcome: EntityOutcome::Updated,
                write: RecordWrite::Update(existing.id),
                changes: incoming.tracked_differences(&existing.record, tracked_fields),
                previous_source_file: Some(existing.source_file.clone()),
            };
        }

        match prior {
            Some(previous) => Reconciliation {
                outcome: if previous.content_hash == incoming_hash {
                    EntityOutcome::Unchanged
                } else {
                    EntityOutcome::Updated
                },
                write: RecordWrite::Insert,
                changes: incoming.tracked_differences(&previous.record, tracked_fields),
                previous_source_file: Some(previous.source_file.clone()),
            },
            None => Reconciliation {
                outcome: EntityOutcome::New,
                write: RecordWrite::Insert,
                changes: Vec::new(),
                previous_source_file: None,
            },
        }
    }
}
