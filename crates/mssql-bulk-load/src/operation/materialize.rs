//! Result materializer: generated identities back into records.

use crate::buffer::TransferBuffer;
use crate::columns::ResolvedIdentity;
use crate::error::{BulkError, Result};
use crate::staging::GeneratedIdentityMap;

/// Write each record's generated identity through the identity setter.
///
/// Records are visited in their original order and matched by correlation
/// key. A record without a generated value fails the commit.
pub fn write_back_identities<T>(
    table: &str,
    records: &mut [T],
    identity: &ResolvedIdentity<T>,
    buffer: &TransferBuffer,
    mut generated: GeneratedIdentityMap,
) -> Result<usize> {
    if records.len() != buffer.len() {
        return Err(BulkError::merge(
            table,
            format!("buffer holds {} rows for {} records", buffer.len(), records.len()),
        ));
    }

    for (position, record) in records.iter_mut().enumerate() {
        let key = buffer.correlation_key(position).ok_or_else(|| {
            BulkError::merge(table, format!("row {} has no correlation key", position))
        })?;
        let value = generated.take(key).ok_or_else(|| {
            BulkError::merge(table, format!("no generated {} for correlation key {}", identity.destination, key))
        })?;
        identity.field.write(record, value).map_err(|e| match e {
            BulkError::Merge { .. } => e,
            other => BulkError::merge(
                table,
                format!("write {} of row {}: {}", identity.field.name(), position, other),
            ),
        })?;
    }

    Ok(records.len())
}
