//! Identifier validation and quoting for generated SQL.
//!
//! Table, schema and column names cannot be bound as parameters, so every
//! identifier that ends up in generated DDL/DML goes through this module:
//! 1. Validate it (no null bytes, no empty names, bounded length)
//! 2. Wrap it in brackets, doubling any closing bracket inside

use crate::error::{BulkError, Result};

/// Maximum identifier length in SQL Server.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// # Errors
///
/// Returns `BulkError::Config` for invalid identifiers with a descriptive message.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BulkError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(BulkError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(BulkError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("users")?, "[users]");
/// assert_eq!(quote_mssql("table]name")?, "[table]]name]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(quote_unchecked(name))
}

/// Quote a name that has already been validated.
pub(crate) fn quote_unchecked(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Qualify a SQL Server table name with schema: `[schema].[table]`.
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}

/// Escape a value for use inside an N'...' string literal.
pub(crate) fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("Customers").is_ok());
        assert!(validate_identifier("first name").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        assert!(matches!(validate_identifier(""), Err(BulkError::Config(_))));
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        assert!(validate_identifier("users\0; DROP TABLE x").is_err());
    }

    #[test]
    fn test_validate_identifier_length_boundary() {
        assert!(validate_identifier(&"a".repeat(128)).is_ok());
        assert!(validate_identifier(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_quote_mssql_escapes_bracket() {
        assert_eq!(quote_mssql("users").unwrap(), "[users]");
        assert_eq!(quote_mssql("table]name").unwrap(), "[table]]name]");
    }

    #[test]
    fn test_quote_mssql_sql_injection_safely_quoted() {
        let quoted = quote_mssql("x]; DROP TABLE users; --").unwrap();
        assert_eq!(quoted, "[x]]; DROP TABLE users; --]");
    }

    #[test]
    fn test_qualify_mssql() {
        assert_eq!(qualify_mssql("dbo", "Customers").unwrap(), "[dbo].[Customers]");
        assert!(qualify_mssql("", "Customers").is_err());
        assert!(qualify_mssql("dbo", "").is_err());
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("O'Brien"), "O''Brien");
    }
}
