//! Bulk insert configuration stages and the commit engine.
//!
//! [`BulkInsert`] is an immutable configuration stage: every method returns a
//! new stage and leaves the receiver untouched. [`BulkInsert::build`]
//! validates the accumulated configuration into a read-only
//! [`BulkInsertOperation`], which can be committed any number of times.
//!
//! A commit runs as one sequence against one connection; [`CommitState`]
//! lists its states and [`CommitProgress`] records the ones it passed.

mod materialize;
mod progress;

pub use materialize::write_back_identities;
pub use progress::{CommitProgress, CommitState};

use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::TransferBuffer;
use crate::columns::{
    resolve, BulkRecord, ColumnMappings, ColumnSet, Field, IdentityDescriptor, IdentityDirection,
    IdentityField, ResolvedColumns,
};
use crate::config::{validate_settings, BulkCopySettings};
use crate::core::identifier::{qualify_mssql, validate_identifier};
use crate::core::schema::TableSchema;
use crate::core::traits::{BlockingConnection, BulkConnection};
use crate::error::{BulkError, Result};
use crate::index::IndexMaintenance;
use crate::staging::{GeneratedIdentityMap, StagingTableManager};
use crate::transfer::{BulkCopyExecutor, TransferTarget};

const DEFAULT_SCHEMA: &str = "dbo";

/// Accumulated bulk insert configuration.
pub struct BulkInsert<T> {
    table: String,
    schema: String,
    columns: ColumnSet<T>,
    mappings: ColumnMappings,
    identity: Option<IdentityDescriptor<T>>,
    disable_indexes: bool,
    settings: BulkCopySettings,
}

impl<T> Clone for BulkInsert<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            schema: self.schema.clone(),
            columns: self.columns.clone(),
            mappings: self.mappings.clone(),
            identity: self.identity.clone(),
            disable_indexes: self.disable_indexes,
            settings: self.settings.clone(),
        }
    }
}

impl<T> fmt::Debug for BulkInsert<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkInsert")
            .field("table", &self.table)
            .field("schema", &self.schema)
            .field("columns", &self.columns)
            .field("mappings", &self.mappings)
            .field("identity", &self.identity)
            .field("disable_indexes", &self.disable_indexes)
            .field("settings", &self.settings)
            .finish()
    }
}

impl<T> BulkInsert<T> {
    /// Start configuring a load into `table` (schema `dbo`).
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            columns: ColumnSet::new(),
            mappings: ColumnMappings::new(),
            identity: None,
            disable_indexes: false,
            settings: BulkCopySettings::default(),
        }
    }

    pub fn with_schema(&self, schema: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.schema = schema.into();
        next
    }

    /// Add every field the record type describes.
    pub fn add_all_columns(&self) -> Self
    where
        T: BulkRecord,
    {
        let mut next = self.clone();
        for field in T::fields() {
            next.columns.insert(field);
        }
        next
    }

    pub fn add_column(&self, field: Field<T>) -> Self {
        let mut next = self.clone();
        next.columns.insert(field);
        next
    }

    /// Remove a column from the set. Fails if the column is not in the set.
    pub fn remove_column(&self, name: &str) -> Result<Self> {
        let mut next = self.clone();
        next.columns.remove(name)?;
        Ok(next)
    }

    /// Load `field` into `destination` instead of a column of the same name.
    pub fn custom_column_mapping(&self, field: &str, destination: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.mappings.map(field, destination);
        next
    }

    /// Declare the table's identity column and how generated values flow.
    pub fn set_identity_column(&self, field: IdentityField<T>, direction: IdentityDirection) -> Self {
        let mut next = self.clone();
        next.identity = Some(IdentityDescriptor { field, direction });
        next
    }

    /// Disable non-clustered indexes for the load and rebuild them afterwards.
    pub fn tmp_disable_all_non_clustered_indexes(&self) -> Self {
        let mut next = self.clone();
        next.disable_indexes = true;
        next
    }

    pub fn with_bulk_copy_settings(&self, settings: BulkCopySettings) -> Self {
        let mut next = self.clone();
        next.settings = settings;
        next
    }

    pub fn columns(&self) -> &ColumnSet<T> {
        &self.columns
    }

    /// Validate the configuration into a committable operation.
    ///
    /// No store I/O happens here.
    pub fn build(&self) -> Result<BulkInsertOperation<T>> {
        validate_identifier(&self.schema)?;
        validate_identifier(&self.table)?;
        validate_settings(&self.settings)?;

        if self.columns.is_empty() {
            return Err(BulkError::Config(format!(
                "No columns added for {}.{}; use add_all_columns or add_column",
                self.schema, self.table
            )));
        }

        if let Some(identity) = &self.identity {
            if identity.direction == IdentityDirection::InputOutput && self.settings.keep_identity {
                return Err(BulkError::Config(
                    "keep_identity cannot be combined with an InputOutput identity column: \
                     supplied values would be inserted and nothing generated"
                        .into(),
                ));
            }
        }

        // Catches invalid mapping targets before any I/O.
        resolve(
            &self.columns,
            &self.mappings,
            self.identity.as_ref(),
            self.settings.keep_identity,
        )?;

        Ok(BulkInsertOperation {
            qualified: qualify_mssql(&self.schema, &self.table)?,
            config: self.clone(),
        })
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BulkError::Cancelled);
    }
    Ok(())
}

/// A validated, read-only bulk insert.
pub struct BulkInsertOperation<T> {
    config: BulkInsert<T>,
    qualified: String,
}

impl<T> fmt::Debug for BulkInsertOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkInsertOperation")
            .field("table", &self.qualified)
            .field("config", &self.config)
            .finish()
    }
}

impl<T> BulkInsertOperation<T> {
    /// Destination as it appears in generated SQL.
    pub fn table(&self) -> &str {
        &self.qualified
    }

    /// Commit `records`, blocking the calling thread.
    ///
    /// Runs on the wrapper's runtime with the same outcome as
    /// [`commit_async`](Self::commit_async).
    pub fn commit<C: BulkConnection>(
        &self,
        conn: &mut BlockingConnection<C>,
        records: &mut [T],
    ) -> Result<u64> {
        conn.run(|c| self.commit_async(c, records))
    }

    /// Commit `records` and return the number of rows inserted.
    pub async fn commit_async<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        records: &mut [T],
    ) -> Result<u64> {
        self.commit_async_with_cancellation(conn, records, CancellationToken::new())
            .await
    }

    /// Commit `records`, checking `cancel` before each store round trip.
    ///
    /// Staging tables created before the cancellation are still dropped.
    pub async fn commit_async_with_cancellation<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        records: &mut [T],
        cancel: CancellationToken,
    ) -> Result<u64> {
        self.commit_async_with_progress(conn, records, cancel, &CommitProgress::new())
            .await
    }

    /// Commit `records`, recording every state transition in `progress`.
    ///
    /// A failed or cancelled commit ends in [`CommitState::Aborted`];
    /// [`CommitProgress::indexes_left_disabled`] then tells whether the
    /// non-clustered indexes still need a rebuild.
    pub async fn commit_async_with_progress<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        records: &mut [T],
        cancel: CancellationToken,
        progress: &CommitProgress,
    ) -> Result<u64> {
        if records.is_empty() {
            debug!("{}: no records, nothing to commit", self.qualified);
            return Ok(0);
        }

        match self.run(conn, records, &cancel, progress).await {
            Ok(inserted) => {
                progress.advance(&self.qualified, CommitState::Done);
                Ok(inserted)
            }
            Err(e) => {
                progress.advance(&self.qualified, CommitState::Aborted);
                if progress.indexes_left_disabled() {
                    warn!(
                        "Load into {} failed; non-clustered indexes stay disabled until rebuilt: {}",
                        self.qualified, e
                    );
                    return Err(e.annotate(&format!(
                        "non-clustered indexes on {} were left disabled; run ALTER INDEX ALL ON {} REBUILD",
                        self.qualified, self.qualified
                    )));
                }
                Err(e)
            }
        }
    }

    async fn run<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        records: &mut [T],
        cancel: &CancellationToken,
        progress: &CommitProgress,
    ) -> Result<u64> {
        let config = &self.config;
        let table = self.qualified.as_str();

        let resolved = resolve(
            &config.columns,
            &config.mappings,
            config.identity.as_ref(),
            config.settings.keep_identity,
        )?;
        progress.advance(table, CommitState::ColumnsResolved);

        let buffer = TransferBuffer::build(&resolved, records);
        progress.advance(table, CommitState::BufferBuilt);

        check_cancelled(cancel)?;
        if !conn.is_open() {
            debug!("Opening connection for {}", table);
            conn.open().await?;
        }

        check_cancelled(cancel)?;
        let schema = conn.table_schema(&config.schema, &config.table).await?;
        self.check_destination(&schema, &resolved)?;

        let indexes = if config.disable_indexes {
            Some(IndexMaintenance::new(&config.schema, &config.table)?)
        } else {
            None
        };

        if let Some(indexes) = &indexes {
            check_cancelled(cancel)?;
            indexes.disable(conn).await?;
            progress.advance(table, CommitState::IndexesDisabled);
        }

        self.load(conn, records, &resolved, &buffer, &schema, cancel, progress)
            .await?;

        if let Some(indexes) = &indexes {
            indexes.rebuild(conn).await?;
            progress.advance(table, CommitState::IndexesRebuilt);
        }

        info!(
            "Bulk inserted {} rows into {}{}",
            buffer.len(),
            table,
            if resolved.requires_staging { " (identities returned)" } else { "" }
        );
        Ok(buffer.len() as u64)
    }

    /// Transfer (direct or staged) and write identities back.
    #[allow(clippy::too_many_arguments)]
    async fn load<C: BulkConnection + ?Sized>(
        &self,
        conn: &mut C,
        records: &mut [T],
        resolved: &ResolvedColumns<T>,
        buffer: &TransferBuffer,
        schema: &TableSchema,
        cancel: &CancellationToken,
        progress: &CommitProgress,
    ) -> Result<()> {
        let executor = BulkCopyExecutor::new(self.config.settings.clone());
        let mappings = resolved.column_mappings();

        let identity = match &resolved.identity {
            Some(identity) if resolved.requires_staging => identity,
            _ => {
                check_cancelled(cancel)?;
                let target = TransferTarget::new(self.qualified.clone(), schema.columns.clone());
                executor
                    .write_to_server_async(conn, &target, buffer, &mappings)
                    .await?;
                progress.advance(&self.qualified, CommitState::DirectTransferred);
                return Ok(());
            }
        };

        let manager = StagingTableManager {
            target: &self.qualified,
            schema,
            mappings: &mappings,
            identity: &identity.destination,
        };
        let generated: GeneratedIdentityMap = manager
            .load(conn, &executor, buffer, cancel, progress)
            .await?;

        write_back_identities(&self.qualified, records, identity, buffer, generated)?;
        progress.advance(&self.qualified, CommitState::IdentitiesWritten);
        Ok(())
    }

    /// An identity column of the destination may only be loaded with
    /// `keep_identity`; otherwise it must be declared so it is left to the store.
    fn check_destination(&self, schema: &TableSchema, resolved: &ResolvedColumns<T>) -> Result<()> {
        if schema.columns.is_empty() {
            return Err(BulkError::schema_mismatch(
                &self.qualified,
                "table does not exist or has no columns",
            ));
        }

        if self.config.settings.keep_identity {
            return Ok(());
        }

        if let Some(identity) = schema.identity_column() {
            if resolved.columns.iter().any(|c| identity.matches(&c.destination)) {
                return Err(BulkError::Config(format!(
                    "{} has identity column {} in its column set; declare it with \
                     set_identity_column, remove it, or enable keep_identity",
                    self.qualified, identity.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Customer {
        id: i32,
        name: String,
    }

    impl BulkRecord for Customer {
        fn fields() -> Vec<Field<Self>> {
            vec![
                Field::new("Id", |c: &Customer| c.id.into()),
                Field::new("Name", |c: &Customer| c.name.clone().into()),
            ]
        }
    }

    fn id_field() -> IdentityField<Customer> {
        IdentityField::new(
            "Id",
            |c: &Customer| c.id.into(),
            |c: &mut Customer, v| {
                c.id = v.as_i64().unwrap_or_default() as i32;
                Ok(())
            },
        )
    }

    #[test]
    fn test_stages_are_immutable() {
        let base = BulkInsert::<Customer>::new("Customers").add_all_columns();
        let mapped = base.custom_column_mapping("Name", "FullName");
        let fewer = base.remove_column("Name").unwrap();

        assert_eq!(base.columns().names(), vec!["Id", "Name"]);
        assert_eq!(fewer.columns().names(), vec!["Id"]);
        assert_eq!(mapped.columns().names(), vec!["Id", "Name"]);
    }

    #[test]
    fn test_remove_missing_column_keeps_stage() {
        let stage = BulkInsert::<Customer>::new("Customers").add_all_columns();
        let err = stage.remove_column("Email").unwrap_err();
        assert!(matches!(err, BulkError::Config(_)));
        assert_eq!(stage.columns().len(), 2);
    }

    #[test]
    fn test_build_requires_columns() {
        let err = BulkInsert::<Customer>::new("Customers").build().unwrap_err();
        assert!(matches!(err, BulkError::Config(_)));
    }

    #[test]
    fn test_build_rejects_keep_identity_with_input_output() {
        let err = BulkInsert::<Customer>::new("Customers")
            .add_all_columns()
            .set_identity_column(id_field(), IdentityDirection::InputOutput)
            .with_bulk_copy_settings(BulkCopySettings {
                keep_identity: true,
                ..BulkCopySettings::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, BulkError::Config(_)));
    }

    #[test]
    fn test_build_rejects_invalid_mapping_target() {
        let err = BulkInsert::<Customer>::new("Customers")
            .add_all_columns()
            .custom_column_mapping("Name", "")
            .build()
            .unwrap_err();
        assert!(matches!(err, BulkError::Config(_)));
    }

    #[test]
    fn test_build_qualifies_table() {
        let op = BulkInsert::<Customer>::new("Customers")
            .with_schema("sales")
            .add_all_columns()
            .build()
            .unwrap();
        assert_eq!(op.table(), "[sales].[Customers]");
    }
}
