//! Non-clustered index suspension around a load.
//!
//! Disabling only touches NONCLUSTERED indexes: a disabled clustered index
//! takes the whole table offline. Rebuilding uses `ALTER INDEX ALL`, which
//! brings every disabled index back.

use tracing::debug;

use crate::core::identifier::{escape_literal, qualify_mssql};
use crate::core::traits::BulkConnection;
use crate::error::{BulkError, Result};

/// Disable and rebuild commands for one table.
#[derive(Debug, Clone)]
pub struct IndexMaintenance {
    table: String,
}

impl IndexMaintenance {
    pub fn new(schema: &str, table: &str) -> Result<Self> {
        Ok(Self {
            table: qualify_mssql(schema, table)?,
        })
    }

    /// Batch that disables every enabled non-clustered index of the table.
    pub fn disable_sql(&self) -> String {
        let literal = escape_literal(&self.table);
        format!(
            "DECLARE @sql NVARCHAR(MAX) = N''; \
             SELECT @sql = @sql + N'ALTER INDEX ' + QUOTENAME(i.name) + N' ON {literal} DISABLE; ' \
             FROM sys.indexes i \
             WHERE i.object_id = OBJECT_ID(N'{literal}') \
             AND i.type_desc = 'NONCLUSTERED' AND i.is_disabled = 0; \
             EXEC sp_executesql @sql;"
        )
    }

    pub fn rebuild_sql(&self) -> String {
        format!("ALTER INDEX ALL ON {} REBUILD;", self.table)
    }

    pub async fn disable<C: BulkConnection + ?Sized>(&self, conn: &mut C) -> Result<()> {
        debug!("Disabling non-clustered indexes on {}", self.table);
        conn.execute(&self.disable_sql())
            .await
            .map_err(|e| BulkError::index_maintenance(&self.table, format!("disable: {}", e)))?;
        Ok(())
    }

    pub async fn rebuild<C: BulkConnection + ?Sized>(&self, conn: &mut C) -> Result<()> {
        debug!("Rebuilding indexes on {}", self.table);
        conn.execute(&self.rebuild_sql())
            .await
            .map_err(|e| BulkError::index_maintenance(&self.table, format!("rebuild: {}", e)))?;
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}
