//! Error types for the bulk load engine.

use thiserror::Error;

/// Main error type for bulk load operations.
#[derive(Error, Debug)]
pub enum BulkError {
    /// Invalid column removal/mapping, missing identity descriptor, bad settings.
    /// Always raised before any store I/O.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Staging schema could not be derived from (or diverges from) the destination table
    #[error("Schema mismatch for table {table}: {message}")]
    SchemaMismatch { table: String, message: String },

    /// Network or store failure during the bulk transfer
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Merge statement failed, or generated keys could not be correlated to records
    #[error("Merge failed for table {table}: {message}")]
    Merge { table: String, message: String },

    /// Disabling or rebuilding non-clustered indexes failed
    #[error("Index maintenance failed for table {table}: {message}")]
    IndexMaintenance { table: String, message: String },

    /// Raw driver error (connection, login, protocol)
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// IO error (file operations, socket setup)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Commit was cancelled by the caller
    #[error("Bulk load cancelled")]
    Cancelled,
}

impl BulkError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        BulkError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a SchemaMismatch error
    pub fn schema_mismatch(table: impl Into<String>, message: impl Into<String>) -> Self {
        BulkError::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        BulkError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Merge error
    pub fn merge(table: impl Into<String>, message: impl Into<String>) -> Self {
        BulkError::Merge {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an IndexMaintenance error
    pub fn index_maintenance(table: impl Into<String>, message: impl Into<String>) -> Self {
        BulkError::IndexMaintenance {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Append `note` to the message of an error that carries one.
    ///
    /// Cancellation and wrapped driver errors are returned unchanged.
    pub fn annotate(self, note: &str) -> Self {
        match self {
            BulkError::Config(message) => BulkError::Config(format!("{} ({})", message, note)),
            BulkError::SchemaMismatch { table, message } => BulkError::SchemaMismatch {
                table,
                message: format!("{} ({})", message, note),
            },
            BulkError::Transfer { table, message } => BulkError::Transfer {
                table,
                message: format!("{} ({})", message, note),
            },
            BulkError::Merge { table, message } => BulkError::Merge {
                table,
                message: format!("{} ({})", message, note),
            },
            BulkError::IndexMaintenance { table, message } => BulkError::IndexMaintenance {
                table,
                message: format!("{} ({})", message, note),
            },
            other => other,
        }
    }

    /// Whether this error was raised by a caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BulkError::Cancelled)
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for bulk load operations.
pub type Result<T> = std::result::Result<T, BulkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_carry_table() {
        let err = BulkError::transfer("[dbo].[Customers]", "bulk insert send: broken pipe");
        assert_eq!(
            err.to_string(),
            "Transfer failed for table [dbo].[Customers]: bulk insert send: broken pipe"
        );

        let err = BulkError::merge("[dbo].[Customers]", "expected 3 generated keys, got 2");
        assert!(matches!(err, BulkError::Merge { .. }));
    }

    #[test]
    fn test_format_detailed_includes_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = BulkError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: reset by peer"));
    }

    #[test]
    fn test_annotate_keeps_category() {
        let err = BulkError::merge("[dbo].[Orders]", "merge failed").annotate("indexes left disabled");
        assert!(matches!(err, BulkError::Merge { .. }));
        assert_eq!(
            err.to_string(),
            "Merge failed for table [dbo].[Orders]: merge failed (indexes left disabled)"
        );
        assert!(BulkError::Cancelled.annotate("note").is_cancelled());
    }

    #[test]
    fn test_is_cancelled() {
        assert!(BulkError::Cancelled.is_cancelled());
        assert!(!BulkError::Config("x".into()).is_cancelled());
    }
}
