//! SQL Server connection backed by Tiberius.
//!
//! [`MssqlConnection`] implements [`BulkConnection`]: statements run as plain
//! batches (`simple_query`) so temp tables and `SET` options persist for the
//! session, rows go over TDS bulk insert, metadata comes from `sys.columns`.

mod connection;
mod reader;
mod writer;

pub use connection::{build_config, build_pool, MssqlConnectionManager};

use async_trait::async_trait;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::core::schema::{ColumnDefinition, TableSchema};
use crate::core::traits::BulkConnection;
use crate::core::value::SqlValue;
use crate::error::{BulkError, Result};

pub use writer::MssqlClient;

/// A caller-owned SQL Server session.
///
/// Created closed with [`new`](Self::new) and opened on first use by the
/// commit engine, or opened up front with [`connect`](Self::connect).
pub struct MssqlConnection {
    config: ConnectionConfig,
    client: Option<MssqlClient>,
}

impl MssqlConnection {
    /// A connection that opens lazily.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    /// Open a connection now.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let client = connection::connect(&config).await?;
        Ok(Self {
            config,
            client: Some(client),
        })
    }

    /// Wrap an already logged-in Tiberius client.
    pub fn from_client(config: ConnectionConfig, client: MssqlClient) -> Self {
        Self {
            config,
            client: Some(client),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Close the session. The commit engine never calls this.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await?;
        }
        Ok(())
    }

    fn client(&mut self) -> Result<&mut MssqlClient> {
        self.client.as_mut().ok_or_else(|| {
            BulkError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "MSSQL connection is not open",
            ))
        })
    }
}

impl std::fmt::Debug for MssqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlConnection")
            .field("config", &self.config)
            .field("open", &self.client.is_some())
            .finish()
    }
}

#[async_trait]
impl BulkConnection for MssqlConnection {
    fn is_open(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        if self.client.is_none() {
            self.client = Some(connection::connect(&self.config).await?);
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        debug!("Executing: {}", sql);
        self.client()?.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    async fn table_schema(&mut self, schema: &str, table: &str) -> Result<TableSchema> {
        reader::load_table_schema(self.client()?, schema, table).await
    }

    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[ColumnDefinition],
        rows: Vec<Vec<SqlValue<'static>>>,
    ) -> Result<u64> {
        writer::write_rows(self.client()?, table, columns, rows).await
    }

    async fn insert_rows(
        &mut self,
        table: &str,
        columns: &[ColumnDefinition],
        rows: Vec<Vec<SqlValue<'static>>>,
    ) -> Result<u64> {
        writer::insert_rows(self.client()?, table, columns, &rows).await
    }

    async fn query_generated_keys(
        &mut self,
        sql: &str,
        value_type: &str,
    ) -> Result<Vec<(i64, SqlValue<'static>)>> {
        reader::query_key_values(self.client()?, sql, value_type).await
    }
}
