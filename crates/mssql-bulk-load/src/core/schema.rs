//! Destination table metadata.
//!
//! Loaded from `sys.columns` before any rows move. It drives the column
//! mapping of the transfer executor and the DDL of the staging table.

/// A column of the destination table as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    /// Base type name (e.g. "nvarchar", "decimal").
    pub data_type: String,
    /// Length in bytes as reported by `sys.columns` (-1 = max).
    pub max_length: i32,
    pub precision: i32,
    pub scale: i32,
    pub is_nullable: bool,
    pub is_identity: bool,
    pub is_computed: bool,
}

impl ColumnDefinition {
    /// Create a plain nullable column of the given type (no length/precision).
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            max_length: 0,
            precision: 0,
            scale: 0,
            is_nullable: true,
            is_identity: false,
            is_computed: false,
        }
    }

    /// Builder-style setter for nullability.
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    /// Builder-style setter for the identity flag.
    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self.is_nullable = false;
        self
    }

    /// Builder-style setter for length (bytes, -1 = max).
    pub fn with_length(mut self, max_length: i32) -> Self {
        self.max_length = max_length;
        self
    }

    /// Builder-style setter for precision/scale.
    pub fn with_precision(mut self, precision: i32, scale: i32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    /// Whether the server stores a value for this column on its own.
    fn is_server_generated(&self) -> bool {
        self.is_computed || matches!(self.data_type.to_lowercase().as_str(), "timestamp" | "rowversion")
    }

    /// Whether a bulk load can write this column.
    ///
    /// Identity columns are only writable when the caller keeps identity values.
    pub fn is_insertable(&self, keep_identity: bool) -> bool {
        !self.is_server_generated() && (keep_identity || !self.is_identity)
    }

    /// Case-insensitive name comparison.
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Render the column type with length/precision for DDL.
    pub fn type_declaration(&self) -> String {
        format_mssql_type(&self.data_type, self.max_length, self.precision, self.scale)
    }
}

/// Column metadata for one destination table, in `column_id` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableSchema {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, columns: Vec<ColumnDefinition>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns,
        }
    }

    /// Look up a column by name, ignoring case.
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.matches(name))
    }

    /// The table's identity column, if it has one.
    pub fn identity_column(&self) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.is_identity)
    }

    /// Columns a bulk load writes, in table order.
    pub fn insertable_columns(&self, keep_identity: bool) -> Vec<ColumnDefinition> {
        self.columns
            .iter()
            .filter(|c| c.is_insertable(keep_identity))
            .cloned()
            .collect()
    }

    /// Display name used in errors and logs.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Format an MSSQL type with proper length/precision.
pub fn format_mssql_type(data_type: &str, max_length: i32, precision: i32, scale: i32) -> String {
    let lower = data_type.to_lowercase();
    match lower.as_str() {
        // Float can have optional precision
        "float" => {
            if precision > 0 {
                format!("float({})", precision)
            } else {
                "float".to_string()
            }
        }

        "decimal" | "numeric" => {
            if precision > 0 {
                format!("{}({}, {})", data_type, precision, scale)
            } else {
                format!("{}(18, 0)", data_type)
            }
        }

        "datetime2" | "time" | "datetimeoffset" => {
            if scale > 0 {
                format!("{}({})", data_type, scale)
            } else {
                data_type.to_string()
            }
        }

        "char" | "varchar" | "nchar" | "nvarchar" => {
            if max_length == -1 {
                format!("{}(max)", data_type)
            } else if max_length > 0 {
                // nvarchar/nchar store 2 bytes per character; sys.columns reports bytes.
                let len = if lower.starts_with('n') {
                    max_length / 2
                } else {
                    max_length
                };
                format!("{}({})", data_type, len)
            } else {
                format!("{}(255)", data_type)
            }
        }

        "binary" | "varbinary" => {
            if max_length == -1 {
                format!("{}(max)", data_type)
            } else if max_length > 0 {
                format!("{}({})", data_type, max_length)
            } else {
                format!("{}(255)", data_type)
            }
        }

        // Fixed-length and unknown types are used as-is
        _ => data_type.to_string(),
    }
}
