// ABOUTME: Persistence client - idempotent upserts and schema probes for PostgreSQL
// ABOUTME: Defines the Store trait consumed by the engine and its tokio-postgres impl

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use serde_json::Value;
use tokio_postgres::Client;

use crate::mapper::MappedRecord;

/// Persistence operations the sync engine depends on.
///
/// The engine only ever talks to persistence through this seam, so tests
/// can substitute an in-memory store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent upsert of one chunk of rows keyed by `key_column`.
    /// Returns the number of rows written.
    async fn upsert(&self, table: &str, key_column: &str, rows: &[MappedRecord]) -> Result<u64>;

    /// Which of `values` currently exist in `table.column`.
    async fn existing_keys(
        &self,
        table: &str,
        column: &str,
        values: &[String],
    ) -> Result<HashSet<String>>;

    /// Enumerate live columns of a table via the catalog.
    async fn probe_columns(&self, table: &str) -> Result<Vec<String>>;

    /// Fallback probe: read one row and return its keys, or `None` when the
    /// table is confirmed to hold zero rows.
    async fn sample_row_columns(&self, table: &str) -> Result<Option<Vec<String>>>;
}

/// PostgreSQL-backed store.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Connect to the target database, retrying transient failures with
    /// exponential backoff.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let tls = TlsConnector::builder()
            .build()
            .context("Failed to build TLS connector")?;
        let tls = MakeTlsConnector::new(tls);

        let mut delay = std::time::Duration::from_secs(1);
        let mut last_err = None;
        for attempt in 1..=3u32 {
            match tokio_postgres::connect(database_url, tls.clone()).await {
                Ok((client, connection)) => {
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            tracing::error!("PostgreSQL connection error: {}", e);
                        }
                    });
                    return Ok(Self { client });
                }
                Err(e) => {
                    tracing::warn!(
                        "Database connection attempt {} failed: {}. Retrying in {:?}",
                        attempt,
                        e,
                        delay
                    );
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        match last_err {
            Some(e) => Err(e).context("Failed to connect to target database after 3 attempts"),
            None => bail!("Failed to connect to target database"),
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert(&self, table: &str, key_column: &str, rows: &[MappedRecord]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        validate_table_name(table)?;

        // All rows in a chunk share the filtered key space; the first row
        // names the columns.
        let mut columns: Vec<String> = rows[0].keys().cloned().collect();
        columns.sort();
        if !columns.iter().any(|c| c == key_column) {
            bail!(
                "Cannot upsert into '{}': key column '{}' was filtered out",
                table,
                key_column
            );
        }

        let query = build_upsert_query(table, key_column, &columns);
        let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());

        let affected = self
            .client
            .execute(&query, &[&payload])
            .await
            .with_context(|| format!("Failed to upsert chunk into '{}'", table))?;

        Ok(affected)
    }

    async fn existing_keys(
        &self,
        table: &str,
        column: &str,
        values: &[String],
    ) -> Result<HashSet<String>> {
        if values.is_empty() {
            return Ok(HashSet::new());
        }
        validate_table_name(table)?;

        let query = format!(
            "SELECT \"{}\"::text FROM \"{}\" WHERE \"{}\"::text = ANY($1)",
            column, table, column
        );
        let owned: Vec<String> = values.to_vec();
        let rows = self
            .client
            .query(&query, &[&owned])
            .await
            .with_context(|| format!("Failed to check existing keys in '{}'", table))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn probe_columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT column_name FROM information_schema.columns
                 WHERE table_schema = 'public' AND table_name = $1
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .with_context(|| format!("Failed to probe columns for '{}'", table))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn sample_row_columns(&self, table: &str) -> Result<Option<Vec<String>>> {
        validate_table_name(table)?;

        let query = format!("SELECT row_to_json(t)::jsonb FROM \"{}\" t LIMIT 1", table);
        let rows = self
            .client
            .query(&query, &[])
            .await
            .with_context(|| format!("Failed to sample a row from '{}'", table))?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let value: Value = row.get(0);
        let keys = value
            .as_object()
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();
        Ok(Some(keys))
    }
}

/// Build a multi-row upsert over a single jsonb parameter.
///
/// `jsonb_populate_recordset` converts the JSON rows into the table's row
/// type, so PostgreSQL performs all value coercion (including JSON arrays
/// into array columns). Generates a query like:
///
/// ```sql
/// INSERT INTO "property" ("City", "ListingKey")
/// SELECT "City", "ListingKey" FROM jsonb_populate_recordset(NULL::"property", $1)
/// ON CONFLICT ("ListingKey") DO UPDATE SET "City" = EXCLUDED."City"
/// ```
fn build_upsert_query(table: &str, key_column: &str, columns: &[String]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c)).collect();

    let update_columns: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != key_column)
        .map(|c| format!("\"{}\" = EXCLUDED.\"{}\"", c, c))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO \"{}\" ({}) SELECT {} FROM jsonb_populate_recordset(NULL::\"{}\", $1) ON CONFLICT (\"{}\") {}",
        table,
        quoted.join(", "),
        quoted.join(", "),
        table,
        key_column,
        update_clause
    )
}

/// Validate a table name before interpolating it into SQL.
///
/// Identifiers come from the entity catalog, not user input, but every SQL
/// builder in this module refuses anything outside `[a-z_][a-z0-9_]*`.
pub fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
        && table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        bail!("Invalid table name '{}'", table);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_upsert_query() {
        let query = build_upsert_query(
            "property",
            "ListingKey",
            &[
                "City".to_string(),
                "ListPrice".to_string(),
                "ListingKey".to_string(),
            ],
        );
        assert!(query.contains("INSERT INTO \"property\" (\"City\", \"ListPrice\", \"ListingKey\")"));
        assert!(query.contains("jsonb_populate_recordset(NULL::\"property\", $1)"));
        assert!(query.contains("ON CONFLICT (\"ListingKey\")"));
        assert!(query.contains("\"City\" = EXCLUDED.\"City\""));
        assert!(!query.contains("\"ListingKey\" = EXCLUDED"));
    }

    #[test]
    fn test_build_upsert_query_key_only() {
        let query = build_upsert_query("media", "MediaKey", &["MediaKey".to_string()]);
        assert!(query.contains("DO NOTHING"));
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("property").is_ok());
        assert!(validate_table_name("media_2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("Property").is_err());
        assert!(validate_table_name("drop table;--").is_err());
    }
}
