//! Tabular buffer builder.
//!
//! Reads every record through the resolved field accessors into an owned
//! row/column buffer. On the staging path a correlation column holding the
//! row's position (0..N-1) is appended so generated keys can be matched back
//! to records without relying on physical row order.

use crate::columns::ResolvedColumns;
use crate::core::value::SqlValue;

/// Name of the synthetic correlation column.
pub const CORRELATION_COLUMN: &str = "_bulk_row_id";

/// Rows ready for transfer, one per record, in record order.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferBuffer {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue<'static>>>,
    correlated: bool,
}

impl TransferBuffer {
    /// Build a buffer for `records` from the resolved columns.
    ///
    /// Columns are named after the source fields; destination names are
    /// applied by the transfer executor.
    pub fn build<T>(resolved: &ResolvedColumns<T>, records: &[T]) -> Self {
        let correlated = resolved.requires_staging;

        let mut columns: Vec<String> = resolved
            .columns
            .iter()
            .map(|c| c.field.name().to_string())
            .collect();
        if correlated {
            columns.push(CORRELATION_COLUMN.to_string());
        }

        let rows = records
            .iter()
            .enumerate()
            .map(|(position, record)| {
                let mut row = Vec::with_capacity(columns.len());
                row.extend(resolved.columns.iter().map(|c| c.field.read(record)));
                if correlated {
                    row.push(SqlValue::I64(position as i64));
                }
                row
            })
            .collect();

        Self {
            columns,
            rows,
            correlated,
        }
    }

    /// Column names, including the correlation column when present.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<SqlValue<'static>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether the buffer carries a correlation column.
    pub fn is_correlated(&self) -> bool {
        self.correlated
    }

    /// Position of a column by name, ignoring case.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Correlation key of the row at `position`.
    pub fn correlation_key(&self, position: usize) -> Option<i64> {
        if !self.correlated {
            return None;
        }
        self.rows
            .get(position)
            .and_then(|row| row.last())
            .and_then(SqlValue::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{
        resolve, BulkRecord, ColumnMappings, ColumnSet, Field, IdentityDescriptor,
        IdentityDirection, IdentityField,
    };
    use crate::core::value::SqlNullType;

    struct Book {
        id: i64,
        title: String,
        isbn: Option<String>,
    }

    impl BulkRecord for Book {
        fn fields() -> Vec<Field<Self>> {
            vec![
                Field::new("Id", |b: &Book| b.id.into()),
                Field::new("Title", |b: &Book| b.title.clone().into()),
                Field::new("ISBN", |b: &Book| b.isbn.clone().into()),
            ]
        }
    }

    fn books() -> Vec<Book> {
        vec![
            Book {
                id: 0,
                title: "Dune".into(),
                isbn: Some("978-0441013593".into()),
            },
            Book {
                id: 0,
                title: "Solaris".into(),
                isbn: None,
            },
        ]
    }

    fn identity() -> IdentityDescriptor<Book> {
        IdentityDescriptor {
            field: IdentityField::new(
                "Id",
                |b: &Book| b.id.into(),
                |b: &mut Book, v| {
                    b.id = v.as_i64().unwrap_or_default();
                    Ok(())
                },
            ),
            direction: IdentityDirection::InputOutput,
        }
    }

    #[test]
    fn test_build_direct_buffer_preserves_order() {
        let set: ColumnSet<Book> = Book::fields().into_iter().collect();
        let resolved = resolve(&set, &ColumnMappings::new(), None, false).unwrap();
        let buffer = TransferBuffer::build(&resolved, &books());

        assert_eq!(buffer.columns(), &["Id", "Title", "ISBN"]);
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.is_correlated());
        assert_eq!(buffer.rows()[0][1].as_str(), Some("Dune"));
        assert_eq!(buffer.rows()[1][1].as_str(), Some("Solaris"));
        assert_eq!(buffer.rows()[1][2], SqlValue::Null(SqlNullType::String));
        assert_eq!(buffer.correlation_key(0), None);
    }

    #[test]
    fn test_build_staged_buffer_appends_correlation_key() {
        let set: ColumnSet<Book> = Book::fields().into_iter().collect();
        let identity = identity();
        let resolved = resolve(&set, &ColumnMappings::new(), Some(&identity), false).unwrap();
        let buffer = TransferBuffer::build(&resolved, &books());

        assert_eq!(buffer.columns(), &["Title", "ISBN", CORRELATION_COLUMN]);
        assert!(buffer.is_correlated());
        assert_eq!(buffer.correlation_key(0), Some(0));
        assert_eq!(buffer.correlation_key(1), Some(1));
        assert_eq!(buffer.correlation_key(2), None);
    }

    #[test]
    fn test_build_does_not_touch_column_set() {
        let set: ColumnSet<Book> = Book::fields().into_iter().collect();
        let identity = identity();
        let resolved = resolve(&set, &ColumnMappings::new(), Some(&identity), false).unwrap();
        let _ = TransferBuffer::build(&resolved, &books());
        assert_eq!(set.names(), vec!["Id", "Title", "ISBN"]);
    }

    #[test]
    fn test_empty_records_give_empty_buffer() {
        let set: ColumnSet<Book> = Book::fields().into_iter().collect();
        let resolved = resolve(&set, &ColumnMappings::new(), None, false).unwrap();
        let buffer = TransferBuffer::build(&resolved, &[]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.column_index("isbn"), Some(2));
    }
}
