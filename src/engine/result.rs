// ABOUTME: Result types aggregated by the sync engine
// ABOUTME: Per-batch and per-run outcome reporting, serializable for callers

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cursor::SyncCursor;
use crate::entity::EntityType;
use crate::error::RecordError;
use crate::mapper::MappedRecord;
use crate::schema::TableSchemaStats;

/// Outcome of one entity batch (one fetched page).
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub entity: EntityType,
    pub attempted: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<RecordError>,
}

impl BatchResult {
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            attempted: 0,
            successful: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    pub fn record_failure(&mut self, error: RecordError) {
        self.failed += 1;
        self.errors.push(error);
    }
}

/// Aggregated outcome for one entity across all pages of a run.
#[derive(Debug, Clone, Serialize)]
pub struct EntityRunResult {
    pub entity: EntityType,
    pub pages: usize,
    pub pages_failed: usize,
    pub attempted: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<RecordError>,
    /// Cursor position after the run.
    pub cursor: Option<SyncCursor>,
}

impl EntityRunResult {
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            pages: 0,
            pages_failed: 0,
            attempted: 0,
            successful: 0,
            failed: 0,
            errors: Vec::new(),
            cursor: None,
        }
    }

    pub fn absorb(&mut self, batch: BatchResult) {
        self.pages += 1;
        self.attempted += batch.attempted;
        self.successful += batch.successful;
        self.failed += batch.failed;
        self.errors.extend(batch.errors);
    }
}

/// Outcome of one whole sync run.
///
/// No failure is swallowed silently, but none aborts the run: every error
/// is enumerated here with its stage and offending key.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunResult {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub entities: Vec<EntityRunResult>,
    pub cancelled: bool,
}

impl SyncRunResult {
    pub fn successful(&self) -> usize {
        self.entities.iter().map(|e| e.successful).sum()
    }

    pub fn failed(&self) -> usize {
        self.entities.iter().map(|e| e.failed).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.entities.iter().all(|e| e.pages_failed == 0)
    }
}

/// Outcome of syncing one record on demand.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOneResult {
    pub entity: EntityType,
    pub key: String,
    /// The mapped (pre-filter) record, if the feed returned one.
    pub record: Option<MappedRecord>,
    /// Results of syncing the record's children (e.g. a listing's media).
    pub child_results: Vec<BatchResult>,
}

/// Observable engine state for callers.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub cursors: Vec<SyncCursor>,
    pub schema: Vec<TableSchemaStats>,
}
