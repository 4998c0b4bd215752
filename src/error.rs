// ABOUTME: Error taxonomy for the sync engine
// ABOUTME: Distinguishes per-record, per-chunk, and per-page failure scopes

use serde::{Deserialize, Serialize};

/// Pipeline stage at which a record (or page/chunk) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Mapping,
    Validation,
    Referential,
    Persistence,
    Transport,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Mapping => "mapping",
            Stage::Validation => "validation",
            Stage::Referential => "referential",
            Stage::Persistence => "persistence",
            Stage::Transport => "transport",
        };
        f.write_str(s)
    }
}

/// One recorded failure, attributed to an offending key and a stage.
///
/// Nothing in the engine escalates these to run-fatal; they are collected
/// into the batch result and reported to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordError {
    /// Primary key of the offending record, or a synthetic marker like
    /// "page@skip=2000" when the failure is not attributable to one record.
    pub key: String,
    pub stage: Stage,
    pub message: String,
}

impl RecordError {
    pub fn new(key: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            stage,
            message: message.into(),
        }
    }
}

/// Engine-level errors.
///
/// Only `CursorStore` aborts a run: silently restarting from the epoch on a
/// bad cursor store would reprocess the entire feed, so it is surfaced to
/// the caller instead. Everything else is isolated to a record, chunk, or
/// page and folded into the run result.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The record's declared primary key field is absent or empty. The
    /// only way mapping a single record can fail.
    #[error("invalid primary key in field '{field}': {reason}")]
    InvalidPrimaryKey { field: String, reason: String },

    /// No usable column schema for a table; the filter degrades, it does
    /// not fail the record.
    #[error("schema unavailable for table '{table}': {reason}")]
    SchemaUnavailable { table: String, reason: String },

    /// A child record references a parent key that does not exist.
    #[error("missing parent '{parent_key}' in table '{parent_table}'")]
    ReferentialViolation {
        parent_key: String,
        parent_table: String,
    },

    /// A persistence chunk was rejected; other chunks are still attempted.
    #[error("persistence failed for table '{table}': {message}")]
    Persistence { table: String, message: String },

    /// The feed was unreachable for one page; the run continues past it.
    #[error("feed transport error: {0}")]
    Transport(String),

    /// The cursor store exists but cannot be read or written.
    #[error("cursor store failure: {0}")]
    CursorStore(String),
}
