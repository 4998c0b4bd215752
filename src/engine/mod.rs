// ABOUTME: Batch Orchestrator - drives cursor-paginated sync runs end to end
// ABOUTME: Fetch, map, filter, chunked persist, then advance the cursor

mod result;

pub use result::{BatchResult, EngineStatus, EntityRunResult, SyncOneResult, SyncRunResult};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::cursor::{CursorTracker, SyncCursor};
use crate::entity::EntityType;
use crate::error::{RecordError, Stage, SyncError};
use crate::feed::{FeedClient, PageRequest};
use crate::mapper::{self, MappedRecord, RawRecord};
use crate::referential::{self, ReferentialPolicy};
use crate::schema::SchemaFilter;
use crate::store::Store;

/// Tuning for a sync run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fetch page size.
    pub batch_size: usize,
    /// Persistence chunk size, independent of the fetch page size so one
    /// bad chunk cannot take an entire page with it.
    pub chunk_size: usize,
    /// Behavior when the parent-existence check itself fails.
    pub referential_policy: ReferentialPolicy,
    /// Consecutive page-fetch failures before the entity's run is abandoned
    /// for this cycle. Skipped pages are recorded, never retried in a loop.
    pub max_consecutive_fetch_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            chunk_size: 500,
            referential_policy: ReferentialPolicy::FailOpen,
            max_consecutive_fetch_failures: 3,
        }
    }
}

/// The incremental synchronization engine.
///
/// One logical worker per run: a page is fully processed before the next is
/// requested, bounding memory to one page of records. Entities run in
/// parent-first order so the referential filter sees durably persisted
/// parents.
pub struct SyncEngine<F: FeedClient, S: Store> {
    feed: F,
    store: S,
    schema: SchemaFilter,
    cursors: CursorTracker,
    config: EngineConfig,
    cancel: Option<tokio::sync::watch::Receiver<bool>>,
}

impl<F: FeedClient, S: Store> SyncEngine<F, S> {
    pub fn new(feed: F, store: S, cursors: CursorTracker, config: EngineConfig) -> Self {
        let declared = EntityType::all()
            .into_iter()
            .map(|e| (e.table().to_string(), mapper::declared_columns(e)))
            .collect();
        Self {
            feed,
            store,
            schema: SchemaFilter::new(declared),
            cursors,
            config,
            cancel: None,
        }
    }

    /// Install a cancellation flag, checked between batches only: an
    /// in-flight chunk always completes or explicitly fails first.
    pub fn with_cancellation(mut self, cancel: tokio::sync::watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Sync every entity from its stored cursor.
    pub async fn run_incremental_sync(&mut self) -> anyhow::Result<SyncRunResult> {
        self.run().await
    }

    /// Reset every cursor to the epoch, then sync everything.
    pub async fn run_full_sync(&mut self) -> anyhow::Result<SyncRunResult> {
        self.cursors.reset(None).await?;
        self.run().await
    }

    async fn run(&mut self) -> anyhow::Result<SyncRunResult> {
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let mut entities = Vec::new();
        let mut cancelled = false;

        for entity in EntityType::all() {
            if self.is_cancelled() {
                cancelled = true;
                break;
            }
            let result = self.sync_entity(entity).await?;
            tracing::info!(
                "{}: {} page(s), {} attempted, {} written, {} failed",
                entity,
                result.pages,
                result.attempted,
                result.successful,
                result.failed
            );
            entities.push(result);
        }

        let run = SyncRunResult {
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            entities,
            cancelled,
        };
        tracing::info!(
            "Sync run finished in {}ms: {} written, {} failed",
            run.duration_ms,
            run.successful(),
            run.failed()
        );
        Ok(run)
    }

    /// Sync one entity from its cursor until the feed is drained.
    async fn sync_entity(&mut self, entity: EntityType) -> anyhow::Result<EntityRunResult> {
        let mut result = EntityRunResult::new(entity);
        let order_by = format!("{},{}", entity.timestamp_field(), entity.key_field());
        let mut skip = 0usize;
        let mut consecutive_fetch_failures = 0u32;

        let cursor = self.cursors.get(entity);
        let filter = cursor_filter(entity, &cursor);

        match self.feed.count(entity.resource(), filter.as_deref()).await {
            Ok(total) => tracing::info!("{}: {} record(s) pending past cursor", entity, total),
            Err(e) => tracing::warn!("{}: feed count unavailable: {:#}", entity, e),
        }

        loop {
            if self.is_cancelled() {
                tracing::info!("{}: cancelled between batches", entity);
                break;
            }

            let cursor = self.cursors.get(entity);
            let request = PageRequest {
                order_by: order_by.clone(),
                top: self.config.batch_size,
                skip,
                filter: cursor_filter(entity, &cursor),
            };

            let records = match self.feed.fetch_page(entity.resource(), &request).await {
                Ok(records) => {
                    consecutive_fetch_failures = 0;
                    records
                }
                Err(e) => {
                    // One lost page, not a lost run: record it, step one
                    // page width forward, and keep going.
                    tracing::warn!(
                        "{}: page fetch at skip={} failed, skipping it: {:#}",
                        entity,
                        skip,
                        e
                    );
                    result.pages_failed += 1;
                    result.errors.push(RecordError::new(
                        format!("page@skip={}", skip),
                        Stage::Transport,
                        SyncError::Transport(format!("{:#}", e)).to_string(),
                    ));
                    skip += self.config.batch_size;
                    consecutive_fetch_failures += 1;
                    if consecutive_fetch_failures >= self.config.max_consecutive_fetch_failures {
                        tracing::error!(
                            "{}: abandoning run after {} consecutive fetch failures",
                            entity,
                            consecutive_fetch_failures
                        );
                        break;
                    }
                    continue;
                }
            };

            let page_len = records.len();
            if page_len == 0 {
                break;
            }

            let page_max = page_high_water(entity, &records);
            let batch = self.process_page(entity, records).await;
            result.absorb(batch);

            // The cursor moves past the whole page regardless of per-record
            // outcome; individual failures must not stall it.
            let advanced = match page_max {
                Some((ts, ref key)) => self.cursors.advance(entity, ts, key).await?,
                None => false,
            };
            if advanced {
                skip = 0;
            } else {
                // No usable timestamps in this page: step by offset instead
                // so the same page is never refetched.
                skip += page_len;
            }

            if page_len < self.config.batch_size {
                break;
            }
        }

        result.cursor = Some(self.cursors.get(entity));
        Ok(result)
    }

    /// Map, schema-filter, referentially filter, and persist one page.
    async fn process_page(&mut self, entity: EntityType, records: Vec<RawRecord>) -> BatchResult {
        let mut batch = BatchResult::new(entity);
        batch.attempted = records.len();

        let mut mapped_good: Vec<MappedRecord> = Vec::new();
        for raw in &records {
            match mapper::map_record(entity, raw, None) {
                Ok(mapped) => {
                    let filtered = self
                        .schema
                        .filter_for_table(&self.store, entity.table(), &mapped)
                        .await;
                    if filtered.record.contains_key(entity.key_field()) {
                        mapped_good.push(filtered.record);
                    } else {
                        // Schema degraded to drop-everything (or at least
                        // the key); the record cannot be persisted now.
                        let key = mapper::record_key(raw, entity.key_field())
                            .unwrap_or_else(|_| "<unknown>".to_string());
                        batch.record_failure(RecordError::new(
                            key,
                            Stage::Validation,
                            SyncError::SchemaUnavailable {
                                table: entity.table().to_string(),
                                reason: "no usable column set".to_string(),
                            }
                            .to_string(),
                        ));
                    }
                }
                Err(e) => {
                    let key = raw
                        .get(entity.key_field())
                        .and_then(Value::as_str)
                        .unwrap_or("<missing>");
                    batch.record_failure(RecordError::new(key, Stage::Mapping, e.to_string()));
                }
            }
        }

        let survivors = match entity.parent() {
            Some(link) => {
                let outcome = referential::filter_by_existing_parents(
                    &self.store,
                    &link,
                    entity.key_field(),
                    mapped_good,
                    self.config.referential_policy,
                )
                .await;
                for error in outcome.invalid {
                    batch.record_failure(error);
                }
                outcome.valid
            }
            None => mapped_good,
        };

        self.persist_chunks(entity, survivors, &mut batch).await;
        batch
    }

    /// Persist survivors in fixed-size chunks; a rejected chunk fails alone.
    async fn persist_chunks(
        &mut self,
        entity: EntityType,
        records: Vec<MappedRecord>,
        batch: &mut BatchResult,
    ) {
        for chunk in records.chunks(self.config.chunk_size) {
            match self
                .store
                .upsert(entity.table(), entity.key_field(), chunk)
                .await
            {
                Ok(_) => batch.successful += chunk.len(),
                Err(e) => {
                    tracing::warn!(
                        "{}: chunk of {} record(s) rejected: {:#}",
                        entity,
                        chunk.len(),
                        e
                    );
                    let message = SyncError::Persistence {
                        table: entity.table().to_string(),
                        message: format!("{:#}", e),
                    }
                    .to_string();
                    for record in chunk {
                        let key = record
                            .get(entity.key_field())
                            .and_then(Value::as_str)
                            .unwrap_or("<unknown>");
                        batch.record_failure(RecordError::new(
                            key,
                            Stage::Persistence,
                            message.clone(),
                        ));
                    }
                }
            }
        }
    }

    /// Fetch, map, and persist a single record by key, then its children.
    ///
    /// For a property this is also where the auxiliary room child records
    /// are fetched, so the composite room columns come from real children
    /// rather than the flat fallback.
    pub async fn sync_one(
        &mut self,
        entity: EntityType,
        key: &str,
    ) -> anyhow::Result<SyncOneResult> {
        let filter = format!("{} eq '{}'", entity.key_field(), key);
        let request = PageRequest {
            order_by: entity.key_field().to_string(),
            top: 1,
            skip: 0,
            filter: Some(filter),
        };

        let records = self.feed.fetch_page(entity.resource(), &request).await?;
        let Some(raw) = records.into_iter().next() else {
            tracing::info!("{} '{}' not found on feed", entity, key);
            return Ok(SyncOneResult {
                entity,
                key: key.to_string(),
                record: None,
                child_results: Vec::new(),
            });
        };

        let rooms = if entity == EntityType::Property {
            self.fetch_rooms(key).await
        } else {
            None
        };

        let mapped = mapper::map_record(entity, &raw, rooms.as_deref())?;
        let filtered = self
            .schema
            .filter_for_table(&self.store, entity.table(), &mapped)
            .await;
        self.store
            .upsert(entity.table(), entity.key_field(), &[filtered.record])
            .await?;

        let mut child_results = Vec::new();
        if entity == EntityType::Property {
            child_results.push(self.sync_children_of(key).await);
        }

        Ok(SyncOneResult {
            entity,
            key: key.to_string(),
            record: Some(mapped),
            child_results,
        })
    }

    /// Auxiliary room child records for one listing. Best-effort: a feed
    /// without a rooms resource falls back to flat fields.
    async fn fetch_rooms(&self, listing_key: &str) -> Option<Vec<RawRecord>> {
        let request = PageRequest {
            order_by: "RoomKey".to_string(),
            top: 100,
            skip: 0,
            filter: Some(format!("ListingKey eq '{}'", listing_key)),
        };
        match self.feed.fetch_page("PropertyRooms", &request).await {
            Ok(rooms) if !rooms.is_empty() => Some(rooms),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("Room fetch for '{}' failed: {:#}", listing_key, e);
                None
            }
        }
    }

    /// Sync all media belonging to one listing.
    async fn sync_children_of(&mut self, listing_key: &str) -> BatchResult {
        let entity = EntityType::Media;
        let request = PageRequest {
            order_by: format!("{},{}", entity.timestamp_field(), entity.key_field()),
            top: self.config.batch_size,
            skip: 0,
            filter: Some(format!("ResourceRecordKey eq '{}'", listing_key)),
        };

        match self.feed.fetch_page(entity.resource(), &request).await {
            Ok(records) => self.process_page(entity, records).await,
            Err(e) => {
                let mut batch = BatchResult::new(entity);
                batch.record_failure(RecordError::new(
                    listing_key,
                    Stage::Transport,
                    SyncError::Transport(format!("{:#}", e)).to_string(),
                ));
                batch
            }
        }
    }

    /// Per-entity cursors plus schema cache/breaker state.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            cursors: self.cursors.all(),
            schema: self.schema.stats(),
        }
    }

    /// Clear schema cache and breaker state for one table or all tables.
    pub fn reset_schema(&mut self, table: Option<&str>) {
        self.schema.reset(table);
    }

    /// Reset one entity's cursor (or all) to the epoch.
    pub async fn reset_cursor(&mut self, entity: Option<EntityType>) -> anyhow::Result<()> {
        self.cursors.reset(entity).await?;
        Ok(())
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }
}

/// Feed filter resuming strictly after the cursor position, with the
/// primary-key tiebreak that makes the total order stable.
fn cursor_filter(entity: EntityType, cursor: &SyncCursor) -> Option<String> {
    if cursor.last_key.is_empty() {
        return None;
    }
    let ts = cursor
        .last_timestamp
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    Some(format!(
        "({ts_field} gt {ts}) or ({ts_field} eq {ts} and {key_field} gt '{key}')",
        ts_field = entity.timestamp_field(),
        key_field = entity.key_field(),
        ts = ts,
        key = cursor.last_key
    ))
}

/// Highest `(timestamp, key)` in a page, over every record carrying both a
/// parseable timestamp and a valid primary key. A record missing either
/// cannot name a resumable position: an empty key in particular would read
/// back as the epoch and refetch the whole feed.
fn page_high_water(
    entity: EntityType,
    records: &[RawRecord],
) -> Option<(DateTime<Utc>, String)> {
    records
        .iter()
        .filter_map(|raw| {
            let ts = mapper::parse_timestamp(raw.get(entity.timestamp_field())?)?;
            let key = mapper::record_key(raw, entity.key_field()).ok()?;
            Some((ts, key))
        })
        .max()
}
