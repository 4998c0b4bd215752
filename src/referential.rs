// ABOUTME: Referential Filter - drops child records whose parent key is missing
// ABOUTME: One set query per batch; configurable fail-open when the check errors

use std::collections::HashSet;

use serde_json::Value;

use crate::entity::ParentLink;
use crate::error::{RecordError, Stage, SyncError};
use crate::mapper::MappedRecord;
use crate::store::Store;

/// What to do when the parent-existence check itself fails.
///
/// Fail-open treats a failed check as "everyone passes" and lets
/// persistence reject offending rows individually; fail-closed rejects the
/// whole batch up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialPolicy {
    #[default]
    FailOpen,
    FailClosed,
}

/// Outcome of partitioning one batch of child records.
#[derive(Debug)]
pub struct ReferentialOutcome {
    pub valid: Vec<MappedRecord>,
    /// One error per removed record, stage `referential`.
    pub invalid: Vec<RecordError>,
}

/// Partition `records` into those whose parent key currently exists and
/// those that would bounce off a foreign key.
///
/// The distinct parent keys of the whole batch are checked with a single
/// persistence query, so a 1,000-record page referencing 40 listings costs
/// one round trip.
pub async fn filter_by_existing_parents<S: Store + ?Sized>(
    store: &S,
    link: &ParentLink,
    key_field: &str,
    records: Vec<MappedRecord>,
    policy: ReferentialPolicy,
) -> ReferentialOutcome {
    if records.is_empty() {
        return ReferentialOutcome {
            valid: records,
            invalid: Vec::new(),
        };
    }

    let mut wanted: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for record in &records {
        if let Some(parent) = parent_key(record, link.field) {
            if seen.insert(parent.clone()) {
                wanted.push(parent);
            }
        }
    }

    let existing = match store
        .existing_keys(link.table, link.key_column, &wanted)
        .await
    {
        Ok(keys) => keys,
        Err(e) => match policy {
            ReferentialPolicy::FailOpen => {
                // Degrade to "treat all as valid"; persistence rejects
                // offending rows one by one.
                tracing::warn!(
                    "Parent existence check against '{}' failed, passing {} record(s) through: {:#}",
                    link.table,
                    records.len(),
                    e
                );
                return ReferentialOutcome {
                    valid: records,
                    invalid: Vec::new(),
                };
            }
            ReferentialPolicy::FailClosed => {
                tracing::warn!(
                    "Parent existence check against '{}' failed, rejecting {} record(s): {:#}",
                    link.table,
                    records.len(),
                    e
                );
                let invalid = records
                    .iter()
                    .map(|r| {
                        RecordError::new(
                            record_key_or_unknown(r, key_field),
                            Stage::Referential,
                            format!("parent check against '{}' failed", link.table),
                        )
                    })
                    .collect();
                return ReferentialOutcome {
                    valid: Vec::new(),
                    invalid,
                };
            }
        },
    };

    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for record in records {
        match parent_key(&record, link.field) {
            Some(parent) if existing.contains(&parent) => valid.push(record),
            Some(parent) => invalid.push(RecordError::new(
                record_key_or_unknown(&record, key_field),
                Stage::Referential,
                SyncError::ReferentialViolation {
                    parent_key: parent,
                    parent_table: link.table.to_string(),
                }
                .to_string(),
            )),
            None => invalid.push(RecordError::new(
                record_key_or_unknown(&record, key_field),
                Stage::Referential,
                format!("missing parent key field '{}'", link.field),
            )),
        }
    }

    if !invalid.is_empty() {
        tracing::info!(
            "Referential filter removed {} of {} record(s) missing parents in '{}'",
            invalid.len(),
            invalid.len() + valid.len(),
            link.table
        );
    }

    ReferentialOutcome { valid, invalid }
}

fn parent_key(record: &MappedRecord, field: &str) -> Option<String> {
    match record.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn record_key_or_unknown(record: &MappedRecord, key_field: &str) -> String {
    match record.get(key_field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "<unknown>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct ParentStore {
        existing: Option<Vec<String>>,
        queries: Mutex<Vec<Vec<String>>>,
    }

    impl ParentStore {
        fn with(existing: &[&str]) -> Self {
            Self {
                existing: Some(existing.iter().map(|s| s.to_string()).collect()),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn broken() -> Self {
            Self {
                existing: None,
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Store for ParentStore {
        async fn upsert(
            &self,
            _table: &str,
            _key: &str,
            _rows: &[MappedRecord],
        ) -> Result<u64> {
            Ok(0)
        }

        async fn existing_keys(
            &self,
            _table: &str,
            _column: &str,
            values: &[String],
        ) -> Result<HashSet<String>> {
            self.queries.lock().unwrap().push(values.to_vec());
            match &self.existing {
                Some(keys) => Ok(keys
                    .iter()
                    .filter(|k| values.contains(k))
                    .cloned()
                    .collect()),
                None => Err(anyhow!("database unavailable")),
            }
        }

        async fn probe_columns(&self, _table: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn sample_row_columns(&self, _table: &str) -> Result<Option<Vec<String>>> {
            Ok(None)
        }
    }

    fn link() -> ParentLink {
        ParentLink {
            field: "ResourceRecordKey",
            table: "property",
            key_column: "ListingKey",
        }
    }

    fn media(key: &str, parent: &str) -> MappedRecord {
        json!({"MediaKey": key, "ResourceRecordKey": parent})
            .as_object()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_partitions_by_parent_existence() {
        let store = ParentStore::with(&["A"]);
        let records = vec![media("M1", "A"), media("M2", "B")];

        let out =
            filter_by_existing_parents(&store, &link(), "MediaKey", records, Default::default())
                .await;

        assert_eq!(out.valid.len(), 1);
        assert_eq!(out.invalid.len(), 1);
        assert_eq!(out.invalid[0].key, "M2");
        assert_eq!(out.invalid[0].stage, Stage::Referential);
    }

    #[tokio::test]
    async fn test_single_query_with_distinct_parents() {
        let store = ParentStore::with(&["A"]);
        let records = vec![media("M1", "A"), media("M2", "A"), media("M3", "A")];

        filter_by_existing_parents(&store, &link(), "MediaKey", records, Default::default())
            .await;

        let queries = store.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0], vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_fail_open_passes_everything_through() {
        let store = ParentStore::broken();
        let records = vec![media("M1", "A"), media("M2", "B")];

        let out = filter_by_existing_parents(
            &store,
            &link(),
            "MediaKey",
            records,
            ReferentialPolicy::FailOpen,
        )
        .await;

        assert_eq!(out.valid.len(), 2);
        assert!(out.invalid.is_empty());
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_everything() {
        let store = ParentStore::broken();
        let records = vec![media("M1", "A")];

        let out = filter_by_existing_parents(
            &store,
            &link(),
            "MediaKey",
            records,
            ReferentialPolicy::FailClosed,
        )
        .await;

        assert!(out.valid.is_empty());
        assert_eq!(out.invalid.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_parent_field_is_invalid() {
        let store = ParentStore::with(&["A"]);
        let mut rec = media("M1", "A");
        rec.remove("ResourceRecordKey");

        let out =
            filter_by_existing_parents(&store, &link(), "MediaKey", vec![rec], Default::default())
                .await;

        assert!(out.valid.is_empty());
        assert!(out.invalid[0].message.contains("ResourceRecordKey"));
    }
}
