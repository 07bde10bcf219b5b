//! The seam between the load engine and the store.
//!
//! - [`BulkConnection`]: the I/O surface a commit needs (open, execute,
//!   metadata, TDS bulk load, key read-back)
//! - [`BlockingConnection`]: runs the same commit future on a private runtime
//!   for callers without an async context
//!
//! The engine assumes exclusive use of one connection for the duration of a
//! commit and never closes it.

use std::future::Future;

use async_trait::async_trait;

use crate::error::Result;

use super::schema::{ColumnDefinition, TableSchema};
use super::value::SqlValue;

/// Store operations used by a bulk insert commit.
#[async_trait]
pub trait BulkConnection: Send {
    /// Whether the underlying session is open.
    fn is_open(&self) -> bool;

    /// Open the session. Only called when [`is_open`](Self::is_open) is false.
    async fn open(&mut self) -> Result<()>;

    /// Execute a statement batch that returns no rows.
    ///
    /// Runs as a plain batch in the session scope, so temp tables and
    /// `SET` options it creates stay visible to later calls.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Load column metadata for `schema.table`, in column order.
    async fn table_schema(&mut self, schema: &str, table: &str) -> Result<TableSchema>;

    /// Stream rows into `table` with the TDS bulk-load protocol.
    ///
    /// `table` is already quoted. Each row holds one value per entry of
    /// `columns`, which are the table's insertable columns in table order.
    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[ColumnDefinition],
        rows: Vec<Vec<SqlValue<'static>>>,
    ) -> Result<u64>;

    /// Insert rows with parameterized `INSERT` statements.
    ///
    /// Used where the bulk-load protocol cannot carry the data (explicit
    /// identity values).
    async fn insert_rows(
        &mut self,
        table: &str,
        columns: &[ColumnDefinition],
        rows: Vec<Vec<SqlValue<'static>>>,
    ) -> Result<u64>;

    /// Run a query whose rows are `(correlation key, generated value)`.
    ///
    /// `value_type` is the SQL type of the generated column.
    async fn query_generated_keys(
        &mut self,
        sql: &str,
        value_type: &str,
    ) -> Result<Vec<(i64, SqlValue<'static>)>>;
}

/// Blocking adapter around a [`BulkConnection`].
///
/// Owns a current-thread runtime; the wrapped connection must be opened on
/// that runtime (the engine does so lazily), because socket resources are
/// tied to the runtime that created them.
pub struct BlockingConnection<C> {
    runtime: tokio::runtime::Runtime,
    inner: C,
}

impl<C: BulkConnection> BlockingConnection<C> {
    /// Wrap a (typically not yet opened) connection.
    pub fn new(inner: C) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime, inner })
    }

    /// Drive an async operation on the wrapped connection to completion.
    pub fn run<'a, F, Fut>(&'a mut self, f: F) -> Fut::Output
    where
        F: FnOnce(&'a mut C) -> Fut,
        Fut: Future,
    {
        let BlockingConnection { runtime, inner } = self;
        runtime.block_on(f(inner))
    }

    /// Borrow the wrapped connection.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// Mutably borrow the wrapped connection.
    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    /// Unwrap the connection, dropping the runtime.
    pub fn into_inner(self) -> C {
        self.inner
    }
}
