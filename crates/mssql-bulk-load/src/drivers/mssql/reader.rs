//! Metadata and result readers for the MSSQL connection.

use std::borrow::Cow;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tiberius::Row;
use uuid::Uuid;

use crate::core::schema::{ColumnDefinition, TableSchema};
use crate::core::value::{SqlNullType, SqlValue};
use crate::error::{BulkError, Result};

use super::writer::MssqlClient;

const COLUMNS_QUERY: &str = r#"SELECT c.name, TYPE_NAME(c.system_type_id) AS data_type,
           c.max_length, c.precision, c.scale, c.is_nullable, c.is_identity, c.is_computed
    FROM sys.columns c
    JOIN sys.tables t ON c.object_id = t.object_id
    JOIN sys.schemas s ON t.schema_id = s.schema_id
    WHERE s.name = @P1 AND t.name = @P2
    ORDER BY c.column_id"#;

/// Load column metadata for `schema.table` from `sys.columns`.
///
/// An unknown table yields an empty column list.
pub(crate) async fn load_table_schema(
    client: &mut MssqlClient,
    schema: &str,
    table: &str,
) -> Result<TableSchema> {
    let rows = client
        .query(COLUMNS_QUERY, &[&schema, &table])
        .await?
        .into_first_result()
        .await?;

    let columns = rows
        .iter()
        .map(|row| ColumnDefinition {
            name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
            data_type: row.get::<&str, _>(1).unwrap_or_default().to_string(),
            max_length: row.get::<i16, _>(2).map(i32::from).unwrap_or(0),
            precision: row.get::<u8, _>(3).map(i32::from).unwrap_or(0),
            scale: row.get::<u8, _>(4).map(i32::from).unwrap_or(0),
            is_nullable: row.get::<bool, _>(5).unwrap_or(true),
            is_identity: row.get::<bool, _>(6).unwrap_or(false),
            is_computed: row.get::<bool, _>(7).unwrap_or(false),
        })
        .collect();

    Ok(TableSchema::new(schema, table, columns))
}

/// Run a `(bigint key, value)` query as a plain batch.
///
/// Plain batches see the session's temp tables.
pub(crate) async fn query_key_values(
    client: &mut MssqlClient,
    sql: &str,
    value_type: &str,
) -> Result<Vec<(i64, SqlValue<'static>)>> {
    let rows = client.simple_query(sql).await?.into_first_result().await?;

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let key = row.get::<i64, _>(0).ok_or_else(|| {
                BulkError::Config(format!("result row {} has a NULL key", i))
            })?;
            Ok((key, convert_row_value(row, 1, value_type)))
        })
        .collect()
}

/// Convert a result column to `SqlValue` based on its SQL Server type.
pub(crate) fn convert_row_value(row: &Row, idx: usize, data_type: &str) -> SqlValue<'static> {
    let dt = data_type.to_lowercase();

    match dt.as_str() {
        "bit" => row
            .get::<bool, _>(idx)
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "tinyint" => row
            .get::<u8, _>(idx)
            .map(|v| SqlValue::I16(v as i16))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "smallint" => row
            .get::<i16, _>(idx)
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int" => row
            .get::<i32, _>(idx)
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "bigint" => row
            .get::<i64, _>(idx)
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "real" => row
            .get::<f32, _>(idx)
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float" => row
            .get::<f64, _>(idx)
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "uniqueidentifier" => row
            .get::<Uuid, _>(idx)
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "datetime" | "datetime2" | "smalldatetime" => row
            .get::<NaiveDateTime, _>(idx)
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "datetimeoffset" => row
            .get::<DateTime<FixedOffset>, _>(idx)
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .get::<NaiveDate, _>(idx)
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "time" => row
            .get::<NaiveTime, _>(idx)
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => row
            .get::<&[u8], _>(idx)
            .map(|v| SqlValue::Bytes(Cow::Owned(v.to_vec())))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        "decimal" | "numeric" | "money" | "smallmoney" => row
            .get::<rust_decimal::Decimal, _>(idx)
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        _ => row
            .get::<&str, _>(idx)
            .map(|s| SqlValue::Text(Cow::Owned(s.to_string())))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
    }
}
