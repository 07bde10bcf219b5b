//! Core abstractions shared by the load engine and the drivers.
//!
//! - [`value`]: `SqlValue` row values
//! - [`schema`]: destination column metadata
//! - [`identifier`]: identifier validation and quoting
//! - [`traits`]: the `BulkConnection` seam and its blocking adapter

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use identifier::{qualify_mssql, quote_mssql, validate_identifier};
pub use schema::{format_mssql_type, ColumnDefinition, TableSchema};
pub use traits::{BlockingConnection, BulkConnection};
pub use value::{SqlNullType, SqlValue};
