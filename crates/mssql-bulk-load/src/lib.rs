//! # mssql-bulk-load
//!
//! Staged bulk loading of in-memory records into SQL Server.
//!
//! Records are read through explicit field descriptors into a transfer buffer
//! and streamed with the TDS bulk-load protocol. When generated identity
//! values have to come back, rows go through a session temp table and a
//! single `MERGE ... OUTPUT` that pairs every generated key with the row it
//! came from; the keys are then written into the records.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_bulk_load::{
//!     BulkInsert, BulkRecord, ConnectionConfig, Field, IdentityDirection, IdentityField,
//!     MssqlConnection, Result,
//! };
//!
//! struct Customer {
//!     id: i32,
//!     name: String,
//! }
//!
//! impl BulkRecord for Customer {
//!     fn fields() -> Vec<Field<Self>> {
//!         vec![
//!             Field::new("Id", |c: &Customer| c.id.into()),
//!             Field::new("Name", |c: &Customer| c.name.clone().into()),
//!         ]
//!     }
//! }
//!
//! # async fn run(config: ConnectionConfig) -> Result<()> {
//! let mut conn = MssqlConnection::new(config);
//! let mut customers = vec![Customer { id: 0, name: "Ada".into() }];
//!
//! let op = BulkInsert::<Customer>::new("Customers")
//!     .add_all_columns()
//!     .set_identity_column(
//!         IdentityField::new("Id", |c: &Customer| c.id.into(), |c: &mut Customer, v| {
//!             c.id = v.as_i64().unwrap_or_default() as i32;
//!             Ok(())
//!         }),
//!         IdentityDirection::InputOutput,
//!     )
//!     .build()?;
//!
//! let inserted = op.commit_async(&mut conn, &mut customers).await?;
//! assert_eq!(inserted, 1);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod columns;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod index;
pub mod operation;
pub mod staging;
pub mod transfer;

pub use buffer::{TransferBuffer, CORRELATION_COLUMN};
pub use columns::{
    BulkRecord, ColumnMappings, ColumnSet, Field, IdentityDescriptor, IdentityDirection,
    IdentityField,
};
pub use config::{BulkCopySettings, ConnectionConfig, LoadConfig};
pub use crate::core::{BlockingConnection, BulkConnection, ColumnDefinition, SqlNullType, SqlValue, TableSchema};
pub use drivers::{MssqlConnection, MssqlConnectionManager};
pub use error::{BulkError, Result};
pub use index::IndexMaintenance;
pub use operation::{BulkInsert, BulkInsertOperation, CommitProgress, CommitState};
pub use staging::{GeneratedIdentityMap, StagingTableManager};
pub use transfer::{BulkCopyExecutor, TransferTarget};

pub use tokio_util::sync::CancellationToken;
