//! Bulk transfer executor.
//!
//! Copies a [`TransferBuffer`] into a destination table over the TDS
//! bulk-load protocol. Buffer columns are mapped onto the destination's
//! insertable columns first; destination columns the buffer does not carry
//! are sent as typed NULLs, since a TDS bulk load always writes every
//! insertable column in table order.
//!
//! The [`BulkCopySettings`] flags are applied around the load. Batching and
//! per-batch or table-lock transactions wrap the bulk requests. Kept identity
//! values and constraint checking switch to parameterized row INSERTs, since
//! a TDS bulk load neither accepts explicit identities nor checks constraints.
//! The timeout bounds each store round trip against one deadline for the whole
//! transfer; rollback and `IDENTITY_INSERT OFF` still run after it elapses.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use tracing::{debug, warn};

use crate::buffer::TransferBuffer;
use crate::config::BulkCopySettings;
use crate::core::schema::ColumnDefinition;
use crate::core::traits::{BlockingConnection, BulkConnection};
use crate::core::value::{SqlNullType, SqlValue};
use crate::error::{BulkError, Result};

/// Table a buffer is copied into.
#[derive(Debug, Clone)]
pub struct TransferTarget {
    /// Quoted name as used in SQL (`[dbo].[Customers]`, `#BulkStaging`).
    pub table: String,
    /// All columns of the table, in table order.
    pub columns: Vec<ColumnDefinition>,
}

impl TransferTarget {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnDefinition>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }
}

/// One destination column and the buffer column feeding it (`None` = NULL).
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedColumn {
    pub column: ColumnDefinition,
    pub source: Option<usize>,
}

/// Map buffer columns onto the target's insertable columns.
///
/// `mappings` holds `(buffer column, destination column)` renames; unmapped
/// buffer columns keep their own name. A buffer column with no insertable
/// destination, or two buffer columns landing on the same destination, is a
/// transfer error: the store would reject the load anyway.
pub fn plan_columns(
    buffer_columns: &[String],
    mappings: &[(String, String)],
    target: &TransferTarget,
    keep_identity: bool,
) -> Result<Vec<PlannedColumn>> {
    let mut plan: Vec<PlannedColumn> = target
        .columns
        .iter()
        .filter(|c| c.is_insertable(keep_identity))
        .map(|c| PlannedColumn {
            column: c.clone(),
            source: None,
        })
        .collect();

    for (index, name) in buffer_columns.iter().enumerate() {
        let destination = mappings
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, dest)| dest.as_str())
            .unwrap_or(name.as_str());

        let slot = plan
            .iter_mut()
            .find(|p| p.column.matches(destination))
            .ok_or_else(|| {
                BulkError::transfer(
                    &target.table,
                    format!(
                        "column {} (from {}) is not an insertable column of the destination",
                        destination, name
                    ),
                )
            })?;

        if let Some(previous) = slot.source {
            return Err(BulkError::transfer(
                &target.table,
                format!(
                    "columns {} and {} both map to destination column {}",
                    buffer_columns[previous], name, slot.column.name
                ),
            ));
        }
        slot.source = Some(index);
    }

    Ok(plan)
}

/// Project buffer rows onto the planned column layout.
fn project_rows(buffer: &TransferBuffer, plan: &[PlannedColumn]) -> Vec<Vec<SqlValue<'static>>> {
    buffer
        .rows()
        .iter()
        .map(|row| {
            plan.iter()
                .map(|p| match p.source {
                    Some(i) => row[i].clone(),
                    None => SqlValue::Null(SqlNullType::for_mssql_type(&p.column.data_type)),
                })
                .collect()
        })
        .collect()
}

/// Copies buffers into tables with a fixed set of bulk copy options.
#[derive(Debug, Clone, Default)]
pub struct BulkCopyExecutor {
    settings: BulkCopySettings,
}

impl BulkCopyExecutor {
    pub fn new(settings: BulkCopySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BulkCopySettings {
        &self.settings
    }

    /// Executor for a staging table: the staging copy has no identity and no
    /// constraints, so those options apply to the merge target only.
    pub fn for_staging(&self) -> Self {
        Self {
            settings: BulkCopySettings {
                keep_identity: false,
                check_constraints: false,
                ..self.settings.clone()
            },
        }
    }

    /// Copy `buffer` into `target`, blocking the calling thread.
    ///
    /// Same outcome and row count as [`write_to_server_async`](Self::write_to_server_async).
    pub fn write_to_server<C: BulkConnection>(
        &self,
        conn: &mut BlockingConnection<C>,
        target: &TransferTarget,
        buffer: &TransferBuffer,
        mappings: &[(String, String)],
    ) -> Result<u64> {
        conn.run(|c| self.write_to_server_async(c, target, buffer, mappings))
    }

    /// Copy `buffer` into `target`.
    ///
    /// Returns the number of rows transferred, which always equals the buffer
    /// length; any store failure fails the whole transfer.
    pub async fn write_to_server_async<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        target: &TransferTarget,
        buffer: &TransferBuffer,
        mappings: &[(String, String)],
    ) -> Result<u64> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let plan = plan_columns(buffer.columns(), mappings, target, self.settings.keep_identity)?;
        let rows = project_rows(buffer, &plan);
        let expected = rows.len() as u64;

        let deadline = match self.settings.timeout_secs {
            0 => None,
            secs => Some(Deadline::after(secs)),
        };
        let transferred = self
            .transfer(conn, target, &plan, rows, deadline)
            .await
            .map_err(|e| into_transfer_error(&target.table, e))?;

        if transferred != expected {
            return Err(BulkError::transfer(
                &target.table,
                format!("transferred {} of {} rows", transferred, expected),
            ));
        }
        Ok(transferred)
    }

    async fn transfer<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        target: &TransferTarget,
        plan: &[PlannedColumn],
        rows: Vec<Vec<SqlValue<'static>>>,
        deadline: Option<Deadline>,
    ) -> Result<u64> {
        let table = target.table.as_str();
        let columns: Vec<ColumnDefinition> = plan.iter().map(|p| p.column.clone()).collect();
        let identity_insert = self.settings.keep_identity
            && plan.iter().any(|p| p.column.is_identity && p.source.is_some());
        // Row INSERTs are ordinary DML: FK and CHECK constraints apply to each loaded row.
        let row_insert = identity_insert || self.settings.check_constraints;

        if !self.settings.table_lock {
            return self
                .send_batches(conn, table, &columns, rows, identity_insert, row_insert, deadline)
                .await;
        }

        let locked = within(deadline, table, conn.execute(&table_lock_sql(table))).await;
        if let Err(e) = locked {
            rollback(conn, table).await;
            return Err(step_error(table, "table lock", e));
        }

        let sent = self
            .send_batches(conn, table, &columns, rows, identity_insert, row_insert, deadline)
            .await;
        commit_or_rollback(conn, table, sent, deadline).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_batches<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        table: &str,
        columns: &[ColumnDefinition],
        rows: Vec<Vec<SqlValue<'static>>>,
        identity_insert: bool,
        row_insert: bool,
        deadline: Option<Deadline>,
    ) -> Result<u64> {
        if identity_insert {
            let on = within(deadline, table, conn.execute(&identity_insert_sql(table, true))).await;
            if let Err(e) = on {
                // The ON may have reached the server before the failure.
                let off = conn.execute(&identity_insert_sql(table, false)).await;
                if let Err(off) = off {
                    warn!("Could not turn IDENTITY_INSERT off for {}: {}", table, off);
                }
                return Err(step_error(table, "identity insert on", e));
            }
        }

        let result = self
            .send_rows(conn, table, columns, rows, row_insert, deadline)
            .await;

        if identity_insert {
            // Runs past the deadline so the session never keeps IDENTITY_INSERT on.
            let off = conn.execute(&identity_insert_sql(table, false)).await;
            if let Err(e) = off {
                if result.is_ok() {
                    return Err(step_error(table, "identity insert off", e));
                }
                warn!("Could not turn IDENTITY_INSERT off for {}: {}", table, e);
            }
        }

        result
    }

    async fn send_rows<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        table: &str,
        columns: &[ColumnDefinition],
        rows: Vec<Vec<SqlValue<'static>>>,
        row_insert: bool,
        deadline: Option<Deadline>,
    ) -> Result<u64> {
        let batch_size = self.settings.effective_batch_size(rows.len());
        let per_batch_tx = self.settings.use_internal_transaction && !self.settings.table_lock;

        let mut total = 0u64;
        let mut rows = rows.into_iter();
        let mut batch_no = 0usize;
        loop {
            let batch: Vec<_> = rows.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            batch_no += 1;
            let count = batch.len();

            let sent = self
                .send_batch(conn, table, columns, batch, row_insert, per_batch_tx, deadline)
                .await?;
            debug!("Batch {} of {} rows sent to {}", batch_no, count, table);
            total += sent;
        }
        Ok(total)
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_batch<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        table: &str,
        columns: &[ColumnDefinition],
        batch: Vec<Vec<SqlValue<'static>>>,
        row_insert: bool,
        in_transaction: bool,
        deadline: Option<Deadline>,
    ) -> Result<u64> {
        if in_transaction {
            let begun = within(deadline, table, conn.execute("BEGIN TRANSACTION")).await;
            if let Err(e) = begun {
                rollback(conn, table).await;
                return Err(step_error(table, "begin transaction", e));
            }
        }

        // Explicit identity values and constraint checks cannot go through the TDS bulk path.
        let sent = if row_insert {
            within(deadline, table, conn.insert_rows(table, columns, batch)).await
        } else {
            within(deadline, table, conn.bulk_insert(table, columns, batch)).await
        };

        if !in_transaction {
            return sent;
        }
        commit_or_rollback(conn, table, sent, deadline).await
    }
}

/// Upper bound on the store round trips of one transfer.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    secs: u64,
}

impl Deadline {
    fn after(secs: u64) -> Self {
        Self {
            at: Instant::now() + Duration::from_secs(secs),
            secs,
        }
    }
}

/// Await one store round trip, failing once the deadline has passed.
///
/// Cleanup (rollback, `IDENTITY_INSERT OFF`) is not run through here, so an
/// elapsed transfer still leaves the session clean.
async fn within<T, F>(deadline: Option<Deadline>, table: &str, io: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        None => io.await,
        Some(d) => tokio::time::timeout_at(d.at, io).await.map_err(|_| {
            BulkError::transfer(table, format!("timed out after {}s", d.secs))
        })?,
    }
}

/// Commit after a successful send; roll back after any failure, including a failed commit.
async fn commit_or_rollback<C: BulkConnection + ?Sized>(
    conn: &mut C,
    table: &str,
    sent: Result<u64>,
    deadline: Option<Deadline>,
) -> Result<u64> {
    let outcome = match sent {
        Ok(count) => within(deadline, table, conn.execute("COMMIT TRANSACTION"))
            .await
            .map(|_| count)
            .map_err(|e| step_error(table, "commit transaction", e)),
        Err(e) => Err(e),
    };
    if outcome.is_err() {
        rollback(conn, table).await;
    }
    outcome
}

async fn rollback<C: BulkConnection + ?Sized>(conn: &mut C, table: &str) {
    if let Err(e) = conn.execute("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await {
        warn!("Rollback after failed transfer into {} failed: {}", table, e);
    }
}

fn step_error(table: &str, step: &str, err: BulkError) -> BulkError {
    match err {
        BulkError::Transfer { .. } => err,
        other => BulkError::transfer(table, format!("{}: {}", step, other)),
    }
}

/// Keep transfer and cancellation errors; wrap everything else as a transfer error.
fn into_transfer_error(table: &str, err: BulkError) -> BulkError {
    match err {
        BulkError::Transfer { .. } | BulkError::Cancelled => err,
        other => BulkError::transfer(table, other.to_string()),
    }
}

/// Open a transaction holding an exclusive lock on `table` until commit.
///
/// The scan has to read a row: `TOP (0)` compiles to a constant scan that
/// never touches the table and takes no lock.
pub fn table_lock_sql(table: &str) -> String {
    format!(
        "BEGIN TRANSACTION; SELECT TOP (1) 1 FROM {} WITH (TABLOCKX, HOLDLOCK);",
        table
    )
}

pub fn identity_insert_sql(table: &str, on: bool) -> String {
    format!("SET IDENTITY_INSERT {} {};", table, if on { "ON" } else { "OFF" })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> TransferTarget {
        TransferTarget::new(
            "[dbo].[Customers]",
            vec![
                ColumnDefinition::new("Id", "int").identity(),
                ColumnDefinition::new("first_name", "nvarchar").with_length(100),
                ColumnDefinition::new("Email", "nvarchar").with_length(200),
                ColumnDefinition::new("CreatedAt", "datetime2"),
            ],
        )
    }

    fn names(columns: &[&str]) -> Vec<String> {
        columns.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_plan_applies_mappings_and_fills_nulls() {
        let mappings = vec![("FirstName".to_string(), "first_name".to_string())];
        let plan = plan_columns(&names(&["Email", "FirstName"]), &mappings, &customers(), false).unwrap();

        let layout: Vec<_> = plan.iter().map(|p| (p.column.name.as_str(), p.source)).collect();
        assert_eq!(
            layout,
            vec![("first_name", Some(1)), ("Email", Some(0)), ("CreatedAt", None)]
        );
    }

    #[test]
    fn test_plan_includes_identity_when_kept() {
        let plan = plan_columns(&names(&["Id", "Email"]), &[], &customers(), true).unwrap();
        assert_eq!(plan[0].column.name, "Id");
        assert_eq!(plan[0].source, Some(0));
    }

    #[test]
    fn test_plan_rejects_identity_without_keep_identity() {
        let err = plan_columns(&names(&["Id", "Email"]), &[], &customers(), false).unwrap_err();
        assert!(matches!(err, BulkError::Transfer { .. }));
    }

    #[test]
    fn test_plan_rejects_unknown_column() {
        let err = plan_columns(&names(&["Phone"]), &[], &customers(), false).unwrap_err();
        assert!(err.to_string().contains("Phone"));
    }

    #[test]
    fn test_plan_rejects_destination_collision() {
        let mappings = vec![
            ("FirstName".to_string(), "Email".to_string()),
            ("Mail".to_string(), "email".to_string()),
        ];
        let err = plan_columns(&names(&["FirstName", "Mail"]), &mappings, &customers(), false).unwrap_err();
        assert!(err.to_string().contains("both map to destination column Email"));
    }

    #[test]
    fn test_for_staging_drops_target_only_options() {
        let executor = BulkCopyExecutor::new(BulkCopySettings {
            keep_identity: true,
            check_constraints: true,
            table_lock: true,
            batch_size: Some(10),
            ..BulkCopySettings::default()
        });
        let staging = executor.for_staging();
        assert!(!staging.settings().keep_identity);
        assert!(!staging.settings().check_constraints);
        assert!(staging.settings().table_lock);
        assert_eq!(staging.settings().batch_size, Some(10));
    }

    #[test]
    fn test_option_sql() {
        assert_eq!(
            table_lock_sql("[dbo].[Customers]"),
            "BEGIN TRANSACTION; SELECT TOP (1) 1 FROM [dbo].[Customers] WITH (TABLOCKX, HOLDLOCK);"
        );
        assert_eq!(
            identity_insert_sql("[dbo].[Customers]", false),
            "SET IDENTITY_INSERT [dbo].[Customers] OFF;"
        );
    }
}
