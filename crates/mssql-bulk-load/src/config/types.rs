//! Configuration type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Root configuration structure for a bulk load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Connection settings (SQL Server).
    pub connection: ConnectionConfig,

    /// Bulk copy behavior.
    #[serde(default)]
    pub bulk_copy: BulkCopySettings,
}

/// SQL Server connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode: "disable" turns encryption off, anything else requires it (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Trust the server certificate without validation (default: true).
    #[serde(default = "default_true")]
    pub trust_server_cert: bool,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Options controlling the bulk transfer protocol.
///
/// Tiberius sends TDS bulk loads without per-request hints, so each flag is
/// applied by the transfer executor around the load itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCopySettings {
    /// Rows per bulk-load request. `None` sends the whole buffer in one request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Upper bound on the transfer in seconds (0 = no limit, default: 600).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Preserve supplied identity values instead of letting the store generate them.
    #[serde(default)]
    pub keep_identity: bool,

    /// Enforce foreign key and CHECK constraints on each loaded row. Rows go
    /// through parameterized INSERT instead of the TDS bulk path; constraints
    /// the table owner disabled stay disabled.
    #[serde(default)]
    pub check_constraints: bool,

    /// Hold an exclusive table lock for the duration of the transfer.
    #[serde(default)]
    pub table_lock: bool,

    /// Run each batch in its own transaction, rolled back on failure.
    #[serde(default)]
    pub use_internal_transaction: bool,
}

impl Default for BulkCopySettings {
    fn default() -> Self {
        Self {
            batch_size: None,
            timeout_secs: default_timeout_secs(),
            keep_identity: false,
            check_constraints: false,
            table_lock: false,
            use_internal_transaction: false,
        }
    }
}

impl BulkCopySettings {
    /// Effective rows per request for a buffer of `total` rows.
    pub fn effective_batch_size(&self, total: usize) -> usize {
        match self.batch_size {
            Some(n) if n > 0 => n,
            _ => total.max(1),
        }
    }
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    600
}
