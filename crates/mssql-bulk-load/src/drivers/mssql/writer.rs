//! Row writers for the MSSQL connection.
//!
//! TDS bulk insert carries most rows. Rows with strings beyond the TDS bulk
//! limit, and rows with explicit identity values, go through batched
//! parameterized `INSERT` statements instead.

use std::borrow::Cow;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use tiberius::{Client, ColumnData, ToSql, TokenRow};
use tokio::net::TcpStream;
use tokio_util::compat::Compat;
use tracing::debug;

use crate::core::identifier::quote_unchecked;
use crate::core::schema::ColumnDefinition;
use crate::core::value::{SqlNullType, SqlValue};
use crate::error::{BulkError, Result};

/// Maximum string length (in bytes) for TDS bulk insert.
const BULK_INSERT_STRING_LIMIT: usize = 65535;

/// SQL Server's limit on parameters per statement.
const MAX_PARAMS_PER_STATEMENT: usize = 2100;

/// Upper bound on rows per fallback INSERT (VALUES list limit).
const MAX_ROWS_PER_INSERT: usize = 1000;

pub type MssqlClient = Client<Compat<TcpStream>>;

/// Whether a row holds a string the TDS bulk path cannot carry (UTF-16 size).
pub(crate) fn row_has_oversized_strings(row: &[SqlValue<'_>]) -> bool {
    row.iter().any(|v| match v {
        SqlValue::Text(s) => s.encode_utf16().count() * 2 > BULK_INSERT_STRING_LIMIT,
        _ => false,
    })
}

/// Bulk insert `rows` into `table`, falling back to INSERT for oversized rows.
///
/// Both halves share the caller's transaction state; the executor decides
/// whether the whole call is wrapped.
pub(crate) async fn write_rows(
    client: &mut MssqlClient,
    table: &str,
    columns: &[ColumnDefinition],
    rows: Vec<Vec<SqlValue<'static>>>,
) -> Result<u64> {
    let (oversized, bulk): (Vec<_>, Vec<_>) =
        rows.into_iter().partition(|row| row_has_oversized_strings(row));

    let mut total = bulk_insert_rows(client, table, &bulk).await?;

    if !oversized.is_empty() {
        debug!(
            "Falling back to INSERT for {} rows with oversized strings in {}",
            oversized.len(),
            table
        );
        total += insert_rows(client, table, columns, &oversized).await?;
    }

    Ok(total)
}

/// Send rows over the TDS bulk-load protocol.
///
/// Tiberius reads the column layout from the table itself; each row must
/// hold one value per insertable column, in table order.
pub(crate) async fn bulk_insert_rows(
    client: &mut MssqlClient,
    table: &str,
    rows: &[Vec<SqlValue<'static>>],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut bulk_load = client
        .bulk_insert(table)
        .await
        .map_err(|e| BulkError::transfer(table, format!("bulk insert init: {}", e)))?;

    for row in rows {
        let mut token_row = TokenRow::new();
        for value in row {
            token_row.push(sql_value_to_column_data(value));
        }
        bulk_load
            .send(token_row)
            .await
            .map_err(|e| BulkError::transfer(table, format!("bulk insert send: {}", e)))?;
    }

    let result = bulk_load
        .finalize()
        .await
        .map_err(|e| BulkError::transfer(table, format!("bulk insert finalize: {}", e)))?;

    debug!(
        "Bulk inserted {} rows into {} (reported: {})",
        rows.len(),
        table,
        result.total()
    );
    Ok(rows.len() as u64)
}

/// Insert rows with batched parameterized `INSERT ... VALUES` statements.
pub(crate) async fn insert_rows(
    client: &mut MssqlClient,
    table: &str,
    columns: &[ColumnDefinition],
    rows: &[Vec<SqlValue<'static>>],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let cols_per_row = columns.len();
    if cols_per_row == 0 {
        return Err(BulkError::transfer(table, "Cannot insert with zero columns"));
    }

    let col_str = columns
        .iter()
        .map(|c| quote_unchecked(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let max_rows_per_batch = max_rows_per_insert(cols_per_row);
    let mut total_inserted = 0u64;

    for batch in rows.chunks(max_rows_per_batch) {
        let sql = insert_sql(table, &col_str, cols_per_row, batch.len());

        let params: Vec<Box<dyn ToSql>> = batch
            .iter()
            .flat_map(|row| row.iter().map(sql_value_to_sql_param))
            .collect();
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        client
            .execute(sql.as_str(), &param_refs)
            .await
            .map_err(|e| BulkError::transfer(table, format!("batched INSERT: {}", e)))?;

        total_inserted += batch.len() as u64;
    }

    Ok(total_inserted)
}

/// Rows per INSERT statement so the parameter count stays under 2100.
pub(crate) fn max_rows_per_insert(cols_per_row: usize) -> usize {
    (MAX_PARAMS_PER_STATEMENT / cols_per_row.max(1)).clamp(1, MAX_ROWS_PER_INSERT)
}

fn insert_sql(table: &str, col_str: &str, cols_per_row: usize, rows: usize) -> String {
    let mut param_idx = 1;
    let value_groups: Vec<String> = (0..rows)
        .map(|_| {
            let placeholders: Vec<String> = (0..cols_per_row)
                .map(|_| {
                    let p = format!("@P{}", param_idx);
                    param_idx += 1;
                    p
                })
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        col_str,
        value_groups.join(", ")
    )
}

/// Days since 0001-01-01, the TDS date epoch.
fn tds_days(date: NaiveDate) -> Option<u32> {
    u32::try_from(date.num_days_from_ce() - 1).ok()
}

/// 100ns increments since midnight (TDS time scale 7).
fn tds_increments(time: NaiveTime) -> u64 {
    let nanos = time.num_seconds_from_midnight() as u64 * 1_000_000_000 + time.nanosecond() as u64;
    nanos / 100
}

fn tds_datetime2(dt: NaiveDateTime) -> Option<tiberius::time::DateTime2> {
    let date = tiberius::time::Date::new(tds_days(dt.date())?);
    let time = tiberius::time::Time::new(tds_increments(dt.time()), 7);
    Some(tiberius::time::DateTime2::new(date, time))
}

fn sql_value_to_sql_param(value: &SqlValue<'_>) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(null_type) => match null_type {
            SqlNullType::Bool => Box::new(Option::<bool>::None),
            SqlNullType::I16 => Box::new(Option::<i16>::None),
            SqlNullType::I32 => Box::new(Option::<i32>::None),
            SqlNullType::I64 => Box::new(Option::<i64>::None),
            SqlNullType::F32 => Box::new(Option::<f32>::None),
            SqlNullType::F64 => Box::new(Option::<f64>::None),
            SqlNullType::Bytes => Box::new(Option::<Vec<u8>>::None),
            SqlNullType::Uuid => Box::new(Option::<uuid::Uuid>::None),
            SqlNullType::Decimal => Box::new(Option::<rust_decimal::Decimal>::None),
            SqlNullType::DateTime => Box::new(Option::<NaiveDateTime>::None),
            SqlNullType::DateTimeOffset => {
                Box::new(Option::<chrono::DateTime<chrono::FixedOffset>>::None)
            }
            SqlNullType::Date => Box::new(Option::<NaiveDate>::None),
            SqlNullType::Time => Box::new(Option::<NaiveTime>::None),
            SqlNullType::String => Box::new(Option::<String>::None),
        },
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::Text(s) => Box::new(s.to_string()),
        SqlValue::Bytes(b) => Box::new(b.to_vec()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::Time(t) => Box::new(*t),
    }
}

pub(crate) fn sql_value_to_column_data(value: &SqlValue<'_>) -> ColumnData<'static> {
    match value {
        SqlValue::Null(null_type) => match null_type {
            SqlNullType::Bool => ColumnData::Bit(None),
            SqlNullType::I16 => ColumnData::I16(None),
            SqlNullType::I32 => ColumnData::I32(None),
            SqlNullType::I64 => ColumnData::I64(None),
            SqlNullType::F32 => ColumnData::F32(None),
            SqlNullType::F64 => ColumnData::F64(None),
            SqlNullType::String => ColumnData::String(None),
            SqlNullType::Bytes => ColumnData::Binary(None),
            SqlNullType::Uuid => ColumnData::Guid(None),
            SqlNullType::Decimal => ColumnData::Numeric(None),
            SqlNullType::DateTime => ColumnData::DateTime2(None),
            SqlNullType::DateTimeOffset => ColumnData::DateTimeOffset(None),
            SqlNullType::Date => ColumnData::Date(None),
            SqlNullType::Time => ColumnData::Time(None),
        },
        SqlValue::Bool(b) => ColumnData::Bit(Some(*b)),
        SqlValue::I16(i) => ColumnData::I16(Some(*i)),
        SqlValue::I32(i) => ColumnData::I32(Some(*i)),
        SqlValue::I64(i) => ColumnData::I64(Some(*i)),
        // Non-finite floats have no SQL Server representation.
        SqlValue::F32(f) => ColumnData::F32(f.is_finite().then_some(*f)),
        SqlValue::F64(f) => ColumnData::F64(f.is_finite().then_some(*f)),
        SqlValue::Text(s) => ColumnData::String(Some(Cow::Owned(s.to_string()))),
        SqlValue::Bytes(b) => ColumnData::Binary(Some(Cow::Owned(b.to_vec()))),
        SqlValue::Uuid(u) => ColumnData::Guid(Some(*u)),
        SqlValue::Decimal(d) => ColumnData::Numeric(Some(
            tiberius::numeric::Numeric::new_with_scale(d.mantissa(), d.scale() as u8),
        )),
        SqlValue::DateTime(dt) => ColumnData::DateTime2(tds_datetime2(*dt)),
        SqlValue::DateTimeOffset(dto) => {
            let offset_minutes = (dto.offset().local_minus_utc() / 60) as i16;
            ColumnData::DateTimeOffset(
                tds_datetime2(dto.naive_utc())
                    .map(|dt2| tiberius::time::DateTimeOffset::new(dt2, offset_minutes)),
            )
        }
        SqlValue::Date(d) => ColumnData::Date(tds_days(*d).map(tiberius::time::Date::new)),
        SqlValue::Time(t) => ColumnData::Time(Some(tiberius::time::Time::new(tds_increments(*t), 7))),
    }
}
