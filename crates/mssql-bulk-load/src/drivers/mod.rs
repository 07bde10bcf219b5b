//! Store drivers implementing [`BulkConnection`](crate::core::traits::BulkConnection).

pub mod mssql;

pub use mssql::{MssqlConnection, MssqlConnectionManager};
