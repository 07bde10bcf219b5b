//! Column and schema resolution.
//!
//! Records expose their fields through explicit descriptor tables
//! ([`Field`], [`IdentityField`]); this module turns the configured column
//! set, custom name mappings and identity descriptor into the ordered
//! [`ResolvedColumns`] a commit works from.
//!
//! Column names are unique ignoring case: both [`ColumnSet`] and
//! [`ColumnMappings`] normalize keys on insertion and lookup.

use std::fmt;

use indexmap::IndexMap;

use crate::core::identifier::validate_identifier;
use crate::core::value::SqlValue;
use crate::error::{BulkError, Result};

/// Reads a field's value from a record.
pub type Getter<T> = fn(&T) -> SqlValue<'static>;

/// Writes a generated identity value back into a record.
pub type Setter<T> = fn(&mut T, SqlValue<'static>) -> Result<()>;

/// A named, readable field of record type `T`.
pub struct Field<T> {
    name: String,
    getter: Getter<T>,
}

impl<T> Field<T> {
    pub fn new(name: impl Into<String>, getter: Getter<T>) -> Self {
        Self {
            name: name.into(),
            getter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read this field from a record.
    pub fn read(&self, record: &T) -> SqlValue<'static> {
        (self.getter)(record)
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            getter: self.getter,
        }
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field").field("name", &self.name).finish()
    }
}

/// The identity field of record type `T`: readable, and writable so generated
/// keys can be returned to the caller.
pub struct IdentityField<T> {
    name: String,
    getter: Getter<T>,
    setter: Setter<T>,
}

impl<T> IdentityField<T> {
    pub fn new(name: impl Into<String>, getter: Getter<T>, setter: Setter<T>) -> Self {
        Self {
            name: name.into(),
            getter,
            setter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plain field view of the identity, used when identity values are sent.
    pub fn as_field(&self) -> Field<T> {
        Field::new(self.name.clone(), self.getter)
    }

    /// Store a generated value into a record.
    pub fn write(&self, record: &mut T, value: SqlValue<'static>) -> Result<()> {
        (self.setter)(record, value)
    }
}

impl<T> Clone for IdentityField<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            getter: self.getter,
            setter: self.setter,
        }
    }
}

impl<T> fmt::Debug for IdentityField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityField").field("name", &self.name).finish()
    }
}

/// How the identity column takes part in a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityDirection {
    /// Declared identity with no round-trip: the store generates the value,
    /// as with `Output`, and nothing is read back.
    #[default]
    None,
    /// The store generates the value; it is left out of the transfer and not read back.
    Output,
    /// The store generates the value and it is written back into each record.
    /// Forces the staging path.
    InputOutput,
}

/// Identity column declaration: field plus direction.
pub struct IdentityDescriptor<T> {
    pub field: IdentityField<T>,
    pub direction: IdentityDirection,
}

impl<T> Clone for IdentityDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            field: self.field.clone(),
            direction: self.direction,
        }
    }
}

impl<T> fmt::Debug for IdentityDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityDescriptor")
            .field("field", &self.field.name)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Whether a load needs the staging path (identity round-trip).
pub fn requires_staging<T>(identity: Option<&IdentityDescriptor<T>>) -> bool {
    matches!(
        identity.map(|i| i.direction),
        Some(IdentityDirection::InputOutput)
    )
}

/// Record types that can describe all of their loadable fields.
///
/// ```ignore
/// impl BulkRecord for Customer {
///     fn fields() -> Vec<Field<Self>> {
///         vec![
///             Field::new("Id", |c: &Customer| c.id.into()),
///             Field::new("FirstName", |c: &Customer| c.first_name.clone().into()),
///         ]
///     }
/// }
/// ```
pub trait BulkRecord: Sized {
    fn fields() -> Vec<Field<Self>>;
}

fn normalize(name: &str) -> String {
    name.to_lowercase()
}

/// Ordered set of fields to load, unique ignoring case.
pub struct ColumnSet<T> {
    fields: IndexMap<String, Field<T>>,
}

impl<T> ColumnSet<T> {
    pub fn new() -> Self {
        Self {
            fields: IndexMap::new(),
        }
    }

    /// Add a field. A field with the same name (ignoring case) is replaced in place.
    pub fn insert(&mut self, field: Field<T>) {
        self.fields.insert(normalize(field.name()), field);
    }

    /// Remove a field by name.
    ///
    /// Fails with a configuration error, leaving the set untouched, when the
    /// field is not part of the set.
    pub fn remove(&mut self, name: &str) -> Result<Field<T>> {
        self.fields.shift_remove(&normalize(name)).ok_or_else(|| {
            BulkError::Config(format!(
                "Could not remove the column with name {}: it is not part of the column set",
                name
            ))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(&normalize(name))
    }

    pub fn get(&self, name: &str) -> Option<&Field<T>> {
        self.fields.get(&normalize(name))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field<T>> {
        self.fields.values()
    }

    /// Field names in insertion order, with their original casing.
    pub fn names(&self) -> Vec<&str> {
        self.fields.values().map(|f| f.name()).collect()
    }
}

impl<T> Default for ColumnSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ColumnSet<T> {
    fn clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
        }
    }
}

impl<T> fmt::Debug for ColumnSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl<T> FromIterator<Field<T>> for ColumnSet<T> {
    fn from_iter<I: IntoIterator<Item = Field<T>>>(iter: I) -> Self {
        let mut set = ColumnSet::new();
        for field in iter {
            set.insert(field);
        }
        set
    }
}

/// Source field → destination column renames.
#[derive(Debug, Clone, Default)]
pub struct ColumnMappings {
    mappings: IndexMap<String, String>,
}

impl ColumnMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rename. A second mapping for the same field overwrites the first.
    ///
    /// Two fields mapped onto the same destination are not rejected here; the
    /// store refuses them when the rows are transferred.
    pub fn map(&mut self, field: &str, destination: impl Into<String>) {
        self.mappings.insert(normalize(field), destination.into());
    }

    /// Destination column for a field (the field name itself when unmapped).
    pub fn destination_for<'a>(&'a self, field: &'a str) -> &'a str {
        self.mappings
            .get(&normalize(field))
            .map(String::as_str)
            .unwrap_or(field)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// One column of the load: where its value comes from and where it goes.
pub struct ResolvedColumn<T> {
    pub field: Field<T>,
    pub destination: String,
}

impl<T> fmt::Debug for ResolvedColumn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedColumn")
            .field("field", &self.field.name())
            .field("destination", &self.destination)
            .finish()
    }
}

/// The identity column after mapping.
pub struct ResolvedIdentity<T> {
    pub field: IdentityField<T>,
    pub destination: String,
    pub direction: IdentityDirection,
}

/// Effective columns for one commit.
pub struct ResolvedColumns<T> {
    pub columns: Vec<ResolvedColumn<T>>,
    pub identity: Option<ResolvedIdentity<T>>,
    pub requires_staging: bool,
}

impl<T> ResolvedColumns<T> {
    /// Destination column names, in load order.
    pub fn destination_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.destination.as_str()).collect()
    }

    /// `(field, destination)` pairs for the transfer executor's column mapping.
    pub fn column_mappings(&self) -> Vec<(String, String)> {
        self.columns
            .iter()
            .map(|c| (c.field.name().to_string(), c.destination.clone()))
            .collect()
    }
}

impl<T> fmt::Debug for ResolvedColumns<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedColumns")
            .field("columns", &self.columns)
            .field(
                "identity",
                &self.identity.as_ref().map(|i| (&i.destination, i.direction)),
            )
            .field("requires_staging", &self.requires_staging)
            .finish()
    }
}

/// Resolve the configured columns into the ordered set a commit loads.
///
/// A declared identity column (any direction) is left to the store unless
/// `keep_identity` asks for the supplied values to be kept, in
/// which case it is transferred (and added if the set does not carry it).
pub fn resolve<T>(
    columns: &ColumnSet<T>,
    mappings: &ColumnMappings,
    identity: Option<&IdentityDescriptor<T>>,
    keep_identity: bool,
) -> Result<ResolvedColumns<T>> {
    if columns.is_empty() {
        return Err(BulkError::Config(
            "No columns configured; add at least one column before committing".into(),
        ));
    }

    let generated_identity = identity
        .filter(|_| !keep_identity)
        .map(|i| normalize(i.field.name()));

    let mut resolved = Vec::with_capacity(columns.len() + 1);
    for field in columns.iter() {
        if generated_identity.as_deref() == Some(normalize(field.name()).as_str()) {
            continue;
        }
        let destination = mappings.destination_for(field.name()).to_string();
        validate_identifier(&destination)?;
        resolved.push(ResolvedColumn {
            field: field.clone(),
            destination,
        });
    }

    if keep_identity {
        if let Some(id) = identity {
            if !columns.contains(id.field.name()) {
                let destination = mappings.destination_for(id.field.name()).to_string();
                validate_identifier(&destination)?;
                resolved.push(ResolvedColumn {
                    field: id.field.as_field(),
                    destination,
                });
            }
        }
    }

    if resolved.is_empty() {
        return Err(BulkError::Config(
            "No columns left to insert once the identity column is excluded".into(),
        ));
    }

    let resolved_identity = match identity {
        Some(id) => {
            let destination = mappings.destination_for(id.field.name()).to_string();
            validate_identifier(&destination)?;
            Some(ResolvedIdentity {
                field: id.field.clone(),
                destination,
                direction: id.direction,
            })
        }
        None => None,
    };

    Ok(ResolvedColumns {
        columns: resolved,
        identity: resolved_identity,
        requires_staging: requires_staging(identity),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Customer {
        id: i32,
        first_name: String,
        notes: Option<String>,
    }

    impl BulkRecord for Customer {
        fn fields() -> Vec<Field<Self>> {
            vec![
                Field::new("Id", |c: &Customer| c.id.into()),
                Field::new("FirstName", |c: &Customer| c.first_name.clone().into()),
                Field::new("Notes", |c: &Customer| c.notes.clone().into()),
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

    fn all_columns() -> ColumnSet<Customer> {
        Customer::fields().into_iter().collect()
    }

    #[test]
    fn test_column_set_is_case_insensitive() {
        let mut set = all_columns();
        assert!(set.contains("firstname"));
        set.insert(Field::new("FIRSTNAME", |c: &Customer| c.first_name.clone().into()));
        assert_eq!(set.len(), 3);
        assert_eq!(set.names(), vec!["Id", "FIRSTNAME", "Notes"]);
    }

    #[test]
    fn test_remove_column() {
        let mut set = all_columns();
        let removed = set.remove("notes").unwrap();
        assert_eq!(removed.name(), "Notes");
        assert_eq!(set.names(), vec!["Id", "FirstName"]);
    }

    #[test]
    fn test_remove_missing_column_leaves_set_unchanged() {
        let mut set = all_columns();
        let err = set.remove("Email").unwrap_err();
        assert!(matches!(err, BulkError::Config(_)));
        assert_eq!(set.names(), vec!["Id", "FirstName", "Notes"]);
    }

    #[test]
    fn test_mapping_overwrites_duplicate_source() {
        let mut mappings = ColumnMappings::new();
        mappings.map("FirstName", "first_name");
        mappings.map("firstname", "given_name");
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings.destination_for("FirstName"), "given_name");
        assert_eq!(mappings.destination_for("Notes"), "Notes");
    }

    #[test]
    fn test_resolve_applies_mappings_in_order() {
        let mut mappings = ColumnMappings::new();
        mappings.map("FirstName", "first_name");
        let resolved = resolve(&all_columns(), &mappings, None, false).unwrap();
        assert_eq!(resolved.destination_names(), vec!["Id", "first_name", "Notes"]);
        assert!(!resolved.requires_staging);
        assert_eq!(
            resolved.column_mappings()[1],
            ("FirstName".to_string(), "first_name".to_string())
        );
    }

    #[test]
    fn test_resolve_excludes_generated_identity() {
        let identity = IdentityDescriptor {
            field: id_field(),
            direction: IdentityDirection::InputOutput,
        };
        let resolved = resolve(&all_columns(), &ColumnMappings::new(), Some(&identity), false).unwrap();
        assert_eq!(resolved.destination_names(), vec!["FirstName", "Notes"]);
        assert!(resolved.requires_staging);
        assert_eq!(resolved.identity.as_ref().unwrap().destination, "Id");
    }

    #[test]
    fn test_resolve_output_identity_does_not_stage() {
        let identity = IdentityDescriptor {
            field: id_field(),
            direction: IdentityDirection::Output,
        };
        let resolved = resolve(&all_columns(), &ColumnMappings::new(), Some(&identity), false).unwrap();
        assert_eq!(resolved.destination_names(), vec!["FirstName", "Notes"]);
        assert!(!resolved.requires_staging);
    }

    #[test]
    fn test_resolve_declared_none_identity_is_left_to_store() {
        let identity = IdentityDescriptor {
            field: id_field(),
            direction: IdentityDirection::None,
        };
        let resolved = resolve(&all_columns(), &ColumnMappings::new(), Some(&identity), false).unwrap();
        assert_eq!(resolved.destination_names(), vec!["FirstName", "Notes"]);
        assert!(!resolved.requires_staging);

        let kept = resolve(&all_columns(), &ColumnMappings::new(), Some(&identity), true).unwrap();
        assert_eq!(kept.destination_names(), vec!["Id", "FirstName", "Notes"]);
    }

    #[test]
    fn test_resolve_keep_identity_adds_identity_column() {
        let identity = IdentityDescriptor {
            field: id_field(),
            direction: IdentityDirection::Output,
        };
        let mut set = all_columns();
        set.remove("Id").unwrap();
        let resolved = resolve(&set, &ColumnMappings::new(), Some(&identity), true).unwrap();
        assert_eq!(resolved.destination_names(), vec!["FirstName", "Notes", "Id"]);
    }

    #[test]
    fn test_resolve_rejects_empty_set() {
        let set: ColumnSet<Customer> = ColumnSet::new();
        let err = resolve(&set, &ColumnMappings::new(), None, false).unwrap_err();
        assert!(matches!(err, BulkError::Config(_)));
    }

    #[test]
    fn test_resolve_rejects_identity_only_set() {
        let identity = IdentityDescriptor {
            field: id_field(),
            direction: IdentityDirection::InputOutput,
        };
        let set: ColumnSet<Customer> = vec![id_field().as_field()].into_iter().collect();
        assert!(resolve(&set, &ColumnMappings::new(), Some(&identity), false).is_err());
    }

    #[test]
    fn test_requires_staging_only_for_input_output() {
        assert!(!requires_staging::<Customer>(None));
        for (direction, expected) in [
            (IdentityDirection::None, false),
            (IdentityDirection::Output, false),
            (IdentityDirection::InputOutput, true),
        ] {
            let identity = IdentityDescriptor {
                field: id_field(),
                direction,
            };
            assert_eq!(requires_staging(Some(&identity)), expected);
        }
    }
}
