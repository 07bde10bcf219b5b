//! Staging table manager.
//!
//! Loads a correlated buffer into a session temp table, merges it into the
//! destination while capturing each generated identity next to the row's
//! correlation key, and reads those pairs back:
//!
//! 1. Derive the staging columns from the destination's metadata
//! 2. `CREATE TABLE #BulkStaging` / `#BulkOutput`
//! 3. Bulk transfer the buffer into `#BulkStaging`
//! 4. `MERGE ... OUTPUT ... INTO #BulkOutput`
//! 5. Read `#BulkOutput` into a [`GeneratedIdentityMap`]
//! 6. Drop both temp tables, whatever happened before
//!
//! Temp tables live for the session, so every statement here has to run as a
//! plain batch on the same connection.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::{TransferBuffer, CORRELATION_COLUMN};
use crate::core::identifier::quote_unchecked;
use crate::core::schema::{ColumnDefinition, TableSchema};
use crate::core::traits::BulkConnection;
use crate::core::value::SqlValue;
use crate::error::{BulkError, Result};
use crate::operation::{CommitProgress, CommitState};
use crate::transfer::{BulkCopyExecutor, TransferTarget};

pub const STAGING_TABLE: &str = "#BulkStaging";
pub const OUTPUT_TABLE: &str = "#BulkOutput";

/// Generated identity values keyed by correlation key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedIdentityMap {
    values: BTreeMap<i64, SqlValue<'static>>,
}

impl GeneratedIdentityMap {
    /// Build the map from read-back rows. A repeated key is a merge error.
    pub fn from_rows(table: &str, rows: Vec<(i64, SqlValue<'static>)>) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (key, value) in rows {
            if values.insert(key, value).is_some() {
                return Err(BulkError::merge(
                    table,
                    format!("correlation key {} returned more than once", key),
                ));
            }
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: i64) -> Option<&SqlValue<'static>> {
        self.values.get(&key)
    }

    /// Take the value for `key` out of the map.
    pub fn take(&mut self, key: i64) -> Option<SqlValue<'static>> {
        self.values.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Staging copy of the destination columns, in load order.
///
/// Each column keeps the destination's type and nullability; identity and
/// computed flags are dropped since the staging table only holds values.
pub fn staging_columns(schema: &TableSchema, destinations: &[&str]) -> Result<Vec<ColumnDefinition>> {
    destinations
        .iter()
        .map(|name| {
            let column = schema.column(name).ok_or_else(|| {
                BulkError::schema_mismatch(
                    schema.full_name(),
                    format!("column {} does not exist in the destination table", name),
                )
            })?;
            if column.is_computed {
                return Err(BulkError::schema_mismatch(
                    schema.full_name(),
                    format!("column {} is computed and cannot be loaded", column.name),
                ));
            }
            Ok(ColumnDefinition {
                is_identity: false,
                is_computed: false,
                ..column.clone()
            })
        })
        .collect()
}

fn correlation_column() -> ColumnDefinition {
    ColumnDefinition::new(CORRELATION_COLUMN, "bigint").not_null()
}

fn drop_if_exists(table: &str) -> String {
    format!(
        "IF OBJECT_ID('tempdb..{t}') IS NOT NULL DROP TABLE {t};",
        t = table
    )
}

/// DDL for both temp tables, preceded by a guarded drop of leftovers.
pub fn create_staging_sql(columns: &[ColumnDefinition], identity: &ColumnDefinition) -> String {
    let staging_cols: Vec<String> = columns
        .iter()
        .map(|c| {
            format!(
                "{} {} {}",
                quote_unchecked(&c.name),
                c.type_declaration(),
                if c.is_nullable { "NULL" } else { "NOT NULL" }
            )
        })
        .collect();

    format!(
        "{} {} CREATE TABLE {} ({}, {} BIGINT NOT NULL); CREATE TABLE {} ({} BIGINT NOT NULL, {} {} NULL);",
        drop_if_exists(STAGING_TABLE),
        drop_if_exists(OUTPUT_TABLE),
        STAGING_TABLE,
        staging_cols.join(", "),
        quote_unchecked(CORRELATION_COLUMN),
        OUTPUT_TABLE,
        quote_unchecked(CORRELATION_COLUMN),
        quote_unchecked(&identity.name),
        identity.type_declaration()
    )
}

/// MERGE that inserts every staged row and records `(correlation key, identity)`.
///
/// `ON 1 = 0` never matches, so every source row is inserted; unlike
/// `INSERT ... SELECT`, MERGE may reference source columns in its OUTPUT.
pub fn merge_sql(target: &str, columns: &[&str], identity: &str) -> String {
    let insert_cols: Vec<String> = columns.iter().map(|c| quote_unchecked(c)).collect();
    let source_cols: Vec<String> = insert_cols.iter().map(|c| format!("source.{}", c)).collect();
    let key = quote_unchecked(CORRELATION_COLUMN);
    let id = quote_unchecked(identity);

    format!(
        "MERGE INTO {} WITH (HOLDLOCK) AS target USING {} AS source ON 1 = 0 \
         WHEN NOT MATCHED BY TARGET THEN INSERT ({}) VALUES ({}) \
         OUTPUT source.{}, INSERTED.{} INTO {} ({}, {});",
        target,
        STAGING_TABLE,
        insert_cols.join(", "),
        source_cols.join(", "),
        key,
        id,
        OUTPUT_TABLE,
        key,
        id
    )
}

pub fn read_back_sql(identity: &str) -> String {
    let key = quote_unchecked(CORRELATION_COLUMN);
    format!(
        "SELECT {}, {} FROM {} ORDER BY {};",
        key,
        quote_unchecked(identity),
        OUTPUT_TABLE,
        key
    )
}

pub fn drop_staging_sql() -> String {
    format!("{} {}", drop_if_exists(STAGING_TABLE), drop_if_exists(OUTPUT_TABLE))
}

/// Scoped ownership of the temp tables.
///
/// Acquired before the tables are created and released with
/// [`release`](Self::release), which drops them. A guard dropped without
/// release (the commit future itself was dropped) leaves the tables to the
/// end of the session and logs a warning.
#[derive(Debug)]
pub struct StagingTable {
    target: String,
    released: bool,
}

impl StagingTable {
    pub fn acquire(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            released: false,
        }
    }

    /// Drop the temp tables.
    pub async fn release<C: BulkConnection + ?Sized>(mut self, conn: &mut C) -> Result<()> {
        self.released = true;
        conn.execute(&drop_staging_sql()).await.map_err(|e| {
            BulkError::merge(&self.target, format!("drop staging tables: {}", e))
        })?;
        debug!("Dropped staging tables for {}", self.target);
        Ok(())
    }
}

impl Drop for StagingTable {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "Staging tables for {} were not dropped; they remain until the session ends",
                self.target
            );
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BulkError::Cancelled);
    }
    Ok(())
}

/// Runs the staged load for one destination table.
pub struct StagingTableManager<'a> {
    /// Quoted destination name.
    pub target: &'a str,
    pub schema: &'a TableSchema,
    /// `(buffer column, destination column)` pairs.
    pub mappings: &'a [(String, String)],
    /// Destination column receiving the generated value.
    pub identity: &'a str,
}

impl<'a> StagingTableManager<'a> {
    /// Stage, merge and read back. Temp tables are dropped on every exit path
    /// that returns, including errors and cancellation.
    pub async fn load<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        executor: &BulkCopyExecutor,
        buffer: &TransferBuffer,
        cancel: &CancellationToken,
        progress: &CommitProgress,
    ) -> Result<GeneratedIdentityMap> {
        check_cancelled(cancel)?;

        let guard = StagingTable::acquire(self.target);
        let outcome = self.run(conn, executor, buffer, cancel, progress).await;
        let dropped = guard.release(conn).await;

        match (outcome, dropped) {
            (Ok(map), Ok(())) => {
                progress.advance(self.target, CommitState::StagingDropped);
                Ok(map)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(drop_err)) => {
                warn!("{}", drop_err);
                Err(e)
            }
        }
    }

    async fn run<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        executor: &BulkCopyExecutor,
        buffer: &TransferBuffer,
        cancel: &CancellationToken,
        progress: &CommitProgress,
    ) -> Result<GeneratedIdentityMap> {
        if !buffer.is_correlated() {
            return Err(BulkError::merge(
                self.target,
                "staging requires a buffer with a correlation column",
            ));
        }

        let destinations: Vec<&str> = self.mappings.iter().map(|(_, d)| d.as_str()).collect();
        let columns = staging_columns(self.schema, &destinations)?;
        let identity = self.schema.column(self.identity).ok_or_else(|| {
            BulkError::schema_mismatch(
                self.schema.full_name(),
                format!("identity column {} does not exist in the destination table", self.identity),
            )
        })?;

        check_cancelled(cancel)?;
        conn.execute(&create_staging_sql(&columns, identity))
            .await
            .map_err(|e| BulkError::schema_mismatch(self.schema.full_name(), format!("create staging table: {}", e)))?;
        debug!("Created staging tables for {}", self.target);
        progress.advance(self.target, CommitState::StagingCreated);

        check_cancelled(cancel)?;
        let mut staging_layout = columns.clone();
        staging_layout.push(correlation_column());
        let staging = TransferTarget::new(STAGING_TABLE, staging_layout);
        executor
            .for_staging()
            .write_to_server_async(conn, &staging, buffer, self.mappings)
            .await?;
        progress.advance(self.target, CommitState::StagedDataLoaded);

        check_cancelled(cancel)?;
        let column_names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        conn.execute(&merge_sql(self.target, &column_names, &identity.name))
            .await
            .map_err(|e| BulkError::merge(self.target, e.to_string()))?;
        debug!("Merged {} staged rows into {}", buffer.len(), self.target);
        progress.advance(self.target, CommitState::Merged);

        check_cancelled(cancel)?;
        let rows = conn
            .query_generated_keys(&read_back_sql(&identity.name), &identity.data_type)
            .await
            .map_err(|e| BulkError::merge(self.target, format!("read generated keys: {}", e)))?;
        let map = GeneratedIdentityMap::from_rows(self.target, rows)?;

        if map.len() != buffer.len() {
            return Err(BulkError::merge(
                self.target,
                format!("expected {} generated keys, got {}", buffer.len(), map.len()),
            ));
        }
        progress.advance(self.target, CommitState::IdentitiesReadBack);
        Ok(map)
    }
}
