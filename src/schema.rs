// ABOUTME: Schema Filter - strips columns the target table does not currently have
// ABOUTME: Caches per-table column sets with a TTL and a probe circuit breaker

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::mapper::MappedRecord;
use crate::store::Store;

/// Cached column knowledge is trusted for this long.
const SCHEMA_TTL_MINUTES: i64 = 5;
/// A tripped table is not probed again until this cooldown elapses.
const BREAKER_COOLDOWN_MINUTES: i64 = 30;
/// A confirmed-empty table is not rechecked until this interval elapses.
const EMPTY_RECHECK_MINUTES: i64 = 10;
/// Consecutive probe failures before the breaker trips.
const TRIP_THRESHOLD: u32 = 3;

/// Lifecycle state of a table's column knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    /// Never probed, or last probe failed below the trip threshold.
    Unknown,
    /// Columns cached from a successful probe.
    Known,
    /// Confirmed zero rows and no discoverable schema. Terminal until the
    /// recheck interval elapses or an explicit reset.
    Empty,
    /// Breaker open after repeated probe failures; no probe I/O until the
    /// cooldown elapses.
    Tripped,
}

/// Where the current column set came from.
///
/// Managed tables carry a declared capability set; runtime probing acts as
/// a validator. A tripped declared table degrades to its declared set; an
/// undeclared one degrades to dropping everything.
#[derive(Debug, Clone)]
pub enum ColumnSource {
    Declared(HashSet<String>),
    Probed(HashSet<String>),
    Unavailable,
}

impl ColumnSource {
    fn columns(&self) -> Option<&HashSet<String>> {
        match self {
            ColumnSource::Declared(cols) | ColumnSource::Probed(cols) => Some(cols),
            ColumnSource::Unavailable => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ColumnSource::Declared(_) => "declared",
            ColumnSource::Probed(_) => "probed",
            ColumnSource::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug)]
struct TableEntry {
    state: TableState,
    source: ColumnSource,
    fetched_at: Option<DateTime<Utc>>,
    /// When the current Empty/Tripped state was entered.
    state_since: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    probes: u64,
    dropped_keys: u64,
}

impl TableEntry {
    fn new() -> Self {
        Self {
            state: TableState::Unknown,
            source: ColumnSource::Unavailable,
            fetched_at: None,
            state_since: None,
            consecutive_failures: 0,
            probes: 0,
            dropped_keys: 0,
        }
    }
}

/// Result of filtering one record against a table's known columns.
#[derive(Debug)]
pub struct FilterResult {
    /// The record restricted to columns known to exist. Empty when the
    /// table's schema is unavailable.
    pub record: MappedRecord,
    /// How many keys were stripped. Dropped keys are expected, recoverable
    /// schema drift, never an error.
    pub dropped: usize,
}

/// Observable per-table cache/breaker state, for `status()` and operators.
#[derive(Debug, Clone, Serialize)]
pub struct TableSchemaStats {
    pub table: String,
    pub state: TableState,
    pub source: &'static str,
    pub column_count: usize,
    pub consecutive_failures: u32,
    pub probes: u64,
    pub dropped_keys: u64,
}

/// Process-scoped schema cache and circuit breaker.
///
/// Constructed once at engine startup with the declared capability set per
/// managed table; the engine passes it explicitly wherever filtering
/// happens. Single-logical-worker access is assumed; parallel workers must
/// serialize mutations per table.
pub struct SchemaFilter {
    declared: HashMap<String, HashSet<String>>,
    tables: HashMap<String, TableEntry>,
}

impl SchemaFilter {
    pub fn new(declared: HashMap<String, Vec<String>>) -> Self {
        Self {
            declared: declared
                .into_iter()
                .map(|(table, cols)| (table, cols.into_iter().collect()))
                .collect(),
            tables: HashMap::new(),
        }
    }

    /// Filter a mapped record down to the columns currently known to exist
    /// in `table`, probing (or declining to probe) as the breaker allows.
    pub async fn filter_for_table<S: Store + ?Sized>(
        &mut self,
        store: &S,
        table: &str,
        record: &MappedRecord,
    ) -> FilterResult {
        self.ensure_resolved(store, table).await;

        let entry = self
            .tables
            .entry(table.to_string())
            .or_insert_with(TableEntry::new);

        let result = match entry.source.columns() {
            Some(columns) => {
                let mut kept = MappedRecord::new();
                for (key, value) in record {
                    if columns.contains(key) {
                        kept.insert(key.clone(), value.clone());
                    }
                }
                let dropped = record.len() - kept.len();
                FilterResult {
                    record: kept,
                    dropped,
                }
            }
            None => FilterResult {
                record: MappedRecord::new(),
                dropped: record.len(),
            },
        };

        if result.dropped > 0 {
            entry.dropped_keys += result.dropped as u64;
            tracing::debug!(
                "Dropped {} unknown column(s) for table '{}'",
                result.dropped,
                table
            );
        }
        result
    }

    /// Make sure the table's entry reflects current knowledge, probing only
    /// when the state machine allows it.
    async fn ensure_resolved<S: Store + ?Sized>(&mut self, store: &S, table: &str) {
        let now = Utc::now();
        let declared = self.declared.get(table).cloned();
        let entry = self
            .tables
            .entry(table.to_string())
            .or_insert_with(TableEntry::new);

        match entry.state {
            TableState::Known => {
                if let Some(fetched_at) = entry.fetched_at {
                    if now - fetched_at < Duration::minutes(SCHEMA_TTL_MINUTES) {
                        return;
                    }
                }
            }
            TableState::Tripped => {
                let within_cooldown = entry
                    .state_since
                    .map(|t| now - t < Duration::minutes(BREAKER_COOLDOWN_MINUTES))
                    .unwrap_or(false);
                if within_cooldown {
                    // The breaker's whole purpose: zero probe I/O here.
                    return;
                }
                tracing::info!(
                    "Circuit breaker cooldown elapsed for table '{}', allowing probes again",
                    table
                );
                entry.state = TableState::Unknown;
                entry.state_since = None;
                entry.consecutive_failures = 0;
            }
            TableState::Empty => {
                let within_recheck = entry
                    .state_since
                    .map(|t| now - t < Duration::minutes(EMPTY_RECHECK_MINUTES))
                    .unwrap_or(false);
                if within_recheck {
                    return;
                }
            }
            TableState::Unknown => {}
        }

        Self::probe(store, table, entry, declared, now).await;
    }

    /// One probe cycle: catalog query first, then the one-row fallback.
    async fn probe<S: Store + ?Sized>(
        store: &S,
        table: &str,
        entry: &mut TableEntry,
        declared: Option<HashSet<String>>,
        now: DateTime<Utc>,
    ) {
        entry.probes += 1;

        match store.probe_columns(table).await {
            Ok(cols) if !cols.is_empty() => {
                Self::cache_known(entry, cols, now);
                return;
            }
            Ok(_) => {
                tracing::debug!("Catalog probe for '{}' returned no columns", table);
            }
            Err(e) => {
                tracing::warn!("Catalog probe for '{}' failed: {:#}", table, e);
            }
        }

        match store.sample_row_columns(table).await {
            Ok(Some(cols)) if !cols.is_empty() => {
                Self::cache_known(entry, cols, now);
            }
            Ok(None) | Ok(Some(_)) => {
                // Zero rows and no discoverable schema: retrying before the
                // recheck interval is never useful, so this bypasses the
                // failure counter and parks the table immediately.
                tracing::warn!(
                    "Table '{}' confirmed empty with no discoverable schema",
                    table
                );
                entry.state = TableState::Empty;
                entry.state_since = Some(now);
                entry.source = ColumnSource::Unavailable;
            }
            Err(e) => {
                entry.consecutive_failures += 1;
                tracing::warn!(
                    "Row probe for '{}' failed ({} consecutive): {:#}",
                    table,
                    entry.consecutive_failures,
                    e
                );
                entry.source = match declared {
                    Some(cols) => ColumnSource::Declared(cols),
                    None => ColumnSource::Unavailable,
                };
                if entry.consecutive_failures >= TRIP_THRESHOLD {
                    tracing::warn!(
                        "Circuit breaker tripped for table '{}' after {} failures",
                        table,
                        entry.consecutive_failures
                    );
                    entry.state = TableState::Tripped;
                    entry.state_since = Some(now);
                } else {
                    entry.state = TableState::Unknown;
                }
            }
        }
    }

    fn cache_known(entry: &mut TableEntry, cols: Vec<String>, now: DateTime<Utc>) {
        entry.state = TableState::Known;
        entry.source = ColumnSource::Probed(cols.into_iter().collect());
        entry.fetched_at = Some(now);
        entry.state_since = None;
        entry.consecutive_failures = 0;
    }

    /// Clear cached state, counters, and timers for one table or all.
    pub fn reset(&mut self, table: Option<&str>) {
        match table {
            Some(name) => {
                self.tables.remove(name);
                tracing::info!("Schema cache reset for table '{}'", name);
            }
            None => {
                self.tables.clear();
                tracing::info!("Schema cache reset for all tables");
            }
        }
    }

    /// Snapshot of every tracked table's cache/breaker state.
    pub fn stats(&self) -> Vec<TableSchemaStats> {
        let mut stats: Vec<TableSchemaStats> = self
            .tables
            .iter()
            .map(|(table, entry)| TableSchemaStats {
                table: table.clone(),
                state: entry.state,
                source: entry.source.label(),
                column_count: entry.source.columns().map(HashSet::len).unwrap_or(0),
                consecutive_failures: entry.consecutive_failures,
                probes: entry.probes,
                dropped_keys: entry.dropped_keys,
            })
            .collect();
        stats.sort_by(|a, b| a.table.cmp(&b.table));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Store stub with scriptable probe behavior and call counting.
    struct ProbeStore {
        columns: Option<Vec<String>>,
        sample: Result<Option<Vec<String>>, String>,
        probe_calls: Mutex<u64>,
    }

    impl ProbeStore {
        fn healthy(cols: &[&str]) -> Self {
            Self {
                columns: Some(cols.iter().map(|s| s.to_string()).collect()),
                sample: Ok(None),
                probe_calls: Mutex::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                columns: None,
                sample: Err("connection refused".to_string()),
                probe_calls: Mutex::new(0),
            }
        }

        fn empty_table() -> Self {
            Self {
                columns: Some(Vec::new()),
                sample: Ok(None),
                probe_calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u64 {
            *self.probe_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Store for ProbeStore {
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
            _values: &[String],
        ) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }

        async fn probe_columns(&self, _table: &str) -> Result<Vec<String>> {
            *self.probe_calls.lock().unwrap() += 1;
            match &self.columns {
                Some(cols) => Ok(cols.clone()),
                None => Err(anyhow!("catalog unavailable")),
            }
        }

        async fn sample_row_columns(&self, _table: &str) -> Result<Option<Vec<String>>> {
            match &self.sample {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(anyhow!(e.clone())),
            }
        }
    }

    fn record(fields: &[(&str, serde_json::Value)]) -> MappedRecord {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn filter() -> SchemaFilter {
        SchemaFilter::new(HashMap::new())
    }

    #[tokio::test]
    async fn test_known_schema_is_cached_within_ttl() {
        let store = ProbeStore::healthy(&["ListingKey", "City"]);
        let mut schema = filter();
        let rec = record(&[("ListingKey", json!("L1")), ("City", json!("Austin"))]);

        schema.filter_for_table(&store, "property", &rec).await;
        schema.filter_for_table(&store, "property", &rec).await;
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_columns_are_dropped_not_errors() {
        let store = ProbeStore::healthy(&["ListingKey"]);
        let mut schema = filter();
        let rec = record(&[("ListingKey", json!("L1")), ("Bogus", json!(1))]);

        let out = schema.filter_for_table(&store, "property", &rec).await;
        assert_eq!(out.dropped, 1);
        assert_eq!(out.record.len(), 1);
        assert!(out.record.contains_key("ListingKey"));
        assert_eq!(schema.stats()[0].dropped_keys, 1);
    }

    #[tokio::test]
    async fn test_breaker_trips_after_three_failures_and_stops_probing() {
        let store = ProbeStore::failing();
        let mut schema = filter();
        let rec = record(&[("ListingKey", json!("L1"))]);

        for _ in 0..3 {
            let out = schema.filter_for_table(&store, "property", &rec).await;
            assert!(out.record.is_empty());
        }
        assert_eq!(store.calls(), 3);

        // Tripped: further calls must not probe at all.
        for _ in 0..5 {
            schema.filter_for_table(&store, "property", &rec).await;
        }
        assert_eq!(store.calls(), 3);

        let stats = schema.stats();
        assert_eq!(stats[0].state, TableState::Tripped);
    }

    #[tokio::test]
    async fn test_tripped_declared_table_degrades_to_declared_set() {
        let store = ProbeStore::failing();
        let mut declared = HashMap::new();
        declared.insert(
            "property".to_string(),
            vec!["ListingKey".to_string(), "City".to_string()],
        );
        let mut schema = SchemaFilter::new(declared);
        let rec = record(&[
            ("ListingKey", json!("L1")),
            ("City", json!("Austin")),
            ("Bogus", json!(1)),
        ]);

        let mut last = None;
        for _ in 0..4 {
            last = Some(schema.filter_for_table(&store, "property", &rec).await);
        }
        // Breaker is open, but the declared capability set still applies.
        assert_eq!(store.calls(), 3);
        let out = last.unwrap();
        assert_eq!(out.record.len(), 2);
        assert_eq!(out.dropped, 1);
        assert_eq!(schema.stats()[0].source, "declared");
    }

    #[tokio::test]
    async fn test_empty_table_bypasses_failure_counter() {
        let store = ProbeStore::empty_table();
        let mut schema = filter();
        let rec = record(&[("ListingKey", json!("L1"))]);

        let out = schema.filter_for_table(&store, "property", &rec).await;
        assert!(out.record.is_empty());
        assert_eq!(store.calls(), 1);

        let stats = schema.stats();
        assert_eq!(stats[0].state, TableState::Empty);
        assert_eq!(stats[0].consecutive_failures, 0);

        // Within the recheck interval: no further probes.
        schema.filter_for_table(&store, "property", &rec).await;
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_elapse_allows_probing_again() {
        let store = ProbeStore::failing();
        let mut schema = filter();
        let rec = record(&[("ListingKey", json!("L1"))]);

        for _ in 0..3 {
            schema.filter_for_table(&store, "property", &rec).await;
        }
        assert_eq!(store.calls(), 3);

        // Backdate the trip past the cooldown window.
        let entry = schema.tables.get_mut("property").unwrap();
        entry.state_since =
            Some(Utc::now() - Duration::minutes(BREAKER_COOLDOWN_MINUTES + 1));

        schema.filter_for_table(&store, "property", &rec).await;
        assert_eq!(store.calls(), 4);
        // Auto-reset restarted the counter from zero.
        assert_eq!(schema.stats()[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_reprobes() {
        let store = ProbeStore::healthy(&["ListingKey"]);
        let mut schema = filter();
        let rec = record(&[("ListingKey", json!("L1"))]);

        schema.filter_for_table(&store, "property", &rec).await;
        let entry = schema.tables.get_mut("property").unwrap();
        entry.fetched_at = Some(Utc::now() - Duration::minutes(SCHEMA_TTL_MINUTES + 1));

        schema.filter_for_table(&store, "property", &rec).await;
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn test_manual_reset_clears_breaker() {
        let store = ProbeStore::failing();
        let mut schema = filter();
        let rec = record(&[("ListingKey", json!("L1"))]);

        for _ in 0..3 {
            schema.filter_for_table(&store, "property", &rec).await;
        }
        assert_eq!(schema.stats()[0].state, TableState::Tripped);

        schema.reset(Some("property"));
        assert!(schema.stats().is_empty());

        schema.filter_for_table(&store, "property", &rec).await;
        assert_eq!(store.calls(), 4);
    }
}
