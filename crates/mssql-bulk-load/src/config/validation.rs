//! Configuration validation.

use super::{BulkCopySettings, ConnectionConfig, LoadConfig};
use crate::error::{BulkError, Result};

/// Validate the whole load configuration.
pub fn validate(config: &LoadConfig) -> Result<()> {
    validate_connection(&config.connection)?;
    validate_settings(&config.bulk_copy)
}

/// Validate connection settings.
pub fn validate_connection(connection: &ConnectionConfig) -> Result<()> {
    if connection.host.is_empty() {
        return Err(BulkError::Config("connection.host is required".into()));
    }
    if connection.database.is_empty() {
        return Err(BulkError::Config("connection.database is required".into()));
    }
    if connection.user.is_empty() {
        return Err(BulkError::Config("connection.user is required".into()));
    }
    Ok(())
}

/// Validate bulk copy settings.
pub fn validate_settings(settings: &BulkCopySettings) -> Result<()> {
    if let Some(0) = settings.batch_size {
        return Err(BulkError::Config(
            "bulk_copy.batch_size must be at least 1".into(),
        ));
    }
    if settings.use_internal_transaction && settings.table_lock {
        // Both wrap the load in a transaction; the table lock one wins.
        tracing::debug!("bulk_copy.use_internal_transaction is ignored while table_lock is set");
    }
    Ok(())
}
