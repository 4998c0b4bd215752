// ABOUTME: Sync State Tracker - resumable (timestamp, key) cursor per entity type
// ABOUTME: Strictly monotonic advancement, persisted as JSON (load-on-start, save-on-advance)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::entity::EntityType;
use crate::error::SyncError;

/// Resumable pagination position for one entity type.
///
/// Ordered lexicographically by `(last_timestamp, last_key)`. Mutated only
/// after a batch is fully processed; never deleted, only explicitly reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub entity: EntityType,
    pub last_timestamp: DateTime<Utc>,
    pub last_key: String,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    /// Cursor at the epoch: the first sync for an entity starts here.
    pub fn epoch(entity: EntityType) -> Self {
        Self {
            entity,
            last_timestamp: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
            last_key: String::new(),
            updated_at: Utc::now(),
        }
    }

    /// The `(timestamp, key)` position used for ordering comparisons.
    pub fn position(&self) -> (DateTime<Utc>, &str) {
        (self.last_timestamp, self.last_key.as_str())
    }
}

/// On-disk cursor state, versioned for forward migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorFile {
    version: u32,
    cursors: HashMap<String, SyncCursor>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CursorFile {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            cursors: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Tracks and persists one cursor per entity type.
///
/// An absent state file is the fresh-install bootstrap case and starts from
/// the epoch. A file that exists but cannot be read is surfaced as an
/// error: silently restarting from the epoch would reprocess the whole feed.
pub struct CursorTracker {
    state: CursorFile,
    path: PathBuf,
}

impl CursorTracker {
    pub async fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            tracing::info!("No cursor state at {:?}, starting fresh", path);
            return Ok(Self {
                state: CursorFile::new(),
                path: path.to_path_buf(),
            });
        }

        let contents = fs::read_to_string(path).await.map_err(|e| {
            SyncError::CursorStore(format!("failed to read {:?}: {}", path, e))
        })?;
        let state: CursorFile = serde_json::from_str(&contents).map_err(|e| {
            SyncError::CursorStore(format!("failed to parse {:?}: {}", path, e))
        })?;

        tracing::info!(
            "Loaded cursor state from {:?} ({} cursor(s))",
            path,
            state.cursors.len()
        );
        Ok(Self {
            state,
            path: path.to_path_buf(),
        })
    }

    /// Default state file location under the user's home directory.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".listing-replicator")
            .join("cursors.json")
    }

    /// Current cursor for an entity, or the epoch if it has never synced.
    pub fn get(&self, entity: EntityType) -> SyncCursor {
        self.state
            .cursors
            .get(entity.resource())
            .cloned()
            .unwrap_or_else(|| SyncCursor::epoch(entity))
    }

    /// All stored cursors, for status reporting.
    pub fn all(&self) -> Vec<SyncCursor> {
        let mut cursors: Vec<SyncCursor> = self.state.cursors.values().cloned().collect();
        cursors.sort_by(|a, b| a.entity.resource().cmp(b.entity.resource()));
        cursors
    }

    /// Advance an entity's cursor and persist the new state.
    ///
    /// The advance is rejected as a no-op unless `(timestamp, key)` strictly
    /// exceeds the stored position, which protects against out-of-order
    /// batch completion. Returns whether the cursor moved.
    pub async fn advance(
        &mut self,
        entity: EntityType,
        timestamp: DateTime<Utc>,
        key: &str,
    ) -> Result<bool, SyncError> {
        let current = self.get(entity);
        if (timestamp, key) <= current.position() {
            tracing::debug!(
                "Rejected non-monotonic cursor advance for {}: ({}, {}) <= ({}, {})",
                entity,
                timestamp,
                key,
                current.last_timestamp,
                current.last_key
            );
            return Ok(false);
        }

        self.state.cursors.insert(
            entity.resource().to_string(),
            SyncCursor {
                entity,
                last_timestamp: timestamp,
                last_key: key.to_string(),
                updated_at: Utc::now(),
            },
        );
        self.state.updated_at = Utc::now();
        self.save().await?;
        Ok(true)
    }

    /// Explicitly reset an entity's cursor to the epoch (or all of them).
    pub async fn reset(&mut self, entity: Option<EntityType>) -> Result<(), SyncError> {
        match entity {
            Some(e) => {
                self.state.cursors.remove(e.resource());
                tracing::info!("Cursor reset for {}", e);
            }
            None => {
                self.state.cursors.clear();
                tracing::info!("All cursors reset");
            }
        }
        self.state.updated_at = Utc::now();
        self.save().await
    }

    async fn save(&self) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::CursorStore(format!("failed to create {:?}: {}", parent, e))
            })?;
        }
        let contents = serde_json::to_string_pretty(&self.state)
            .map_err(|e| SyncError::CursorStore(format!("failed to serialize state: {}", e)))?;
        fs::write(&self.path, contents).await.map_err(|e| {
            SyncError::CursorStore(format!("failed to write {:?}: {}", self.path, e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    async fn tracker(dir: &tempfile::TempDir) -> CursorTracker {
        CursorTracker::load(&dir.path().join("cursors.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_tracker_starts_at_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir).await;
        let cursor = t.get(EntityType::Property);
        assert_eq!(cursor.last_timestamp, ts(0));
        assert_eq!(cursor.last_key, "");
    }

    #[tokio::test]
    async fn test_advance_moves_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker(&dir).await;
        let moved = t.advance(EntityType::Property, ts(100), "L5").await.unwrap();
        assert!(moved);
        let cursor = t.get(EntityType::Property);
        assert_eq!(cursor.position(), (ts(100), "L5"));
    }

    #[tokio::test]
    async fn test_non_monotonic_advance_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker(&dir).await;
        t.advance(EntityType::Property, ts(100), "L5").await.unwrap();

        // Equal position: rejected.
        assert!(!t.advance(EntityType::Property, ts(100), "L5").await.unwrap());
        // Older timestamp: rejected.
        assert!(!t.advance(EntityType::Property, ts(99), "L9").await.unwrap());
        // Same timestamp, smaller key: rejected.
        assert!(!t.advance(EntityType::Property, ts(100), "L4").await.unwrap());
        assert_eq!(t.get(EntityType::Property).position(), (ts(100), "L5"));

        // Same timestamp, larger key: the tie-break advances.
        assert!(t.advance(EntityType::Property, ts(100), "L6").await.unwrap());
    }

    #[tokio::test]
    async fn test_entities_track_independently() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker(&dir).await;
        t.advance(EntityType::Property, ts(100), "L1").await.unwrap();
        assert_eq!(t.get(EntityType::Media).last_key, "");
    }

    #[tokio::test]
    async fn test_reset_returns_to_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker(&dir).await;
        t.advance(EntityType::Property, ts(100), "L1").await.unwrap();
        t.reset(Some(EntityType::Property)).await.unwrap();
        assert_eq!(t.get(EntityType::Property).last_timestamp, ts(0));
    }
}
