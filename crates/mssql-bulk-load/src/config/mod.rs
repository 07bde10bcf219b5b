//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate_connection, validate_settings};

use crate::error::Result;
use std::path::Path;

impl LoadConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LoadConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let yaml = r#"
connection:
  host: db.internal
  database: sales
  user: loader
  password: pw
"#;
        let config = LoadConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.connection.port, 1433);
        assert_eq!(config.connection.ssl_mode, "require");
        assert_eq!(config.bulk_copy, BulkCopySettings::default());
        assert_eq!(config.bulk_copy.timeout_secs, 600);
    }

    #[test]
    fn test_from_yaml_reads_bulk_copy_options() {
        let yaml = r#"
connection:
  host: db.internal
  database: sales
  user: loader
bulk_copy:
  batch_size: 5000
  timeout_secs: 30
  keep_identity: true
  check_constraints: true
  table_lock: true
  use_internal_transaction: true
"#;
        let config = LoadConfig::from_yaml(yaml).unwrap();
        let bulk = &config.bulk_copy;
        assert_eq!(bulk.batch_size, Some(5000));
        assert_eq!(bulk.timeout_secs, 30);
        assert!(bulk.keep_identity);
        assert!(bulk.check_constraints);
        assert!(bulk.table_lock);
        assert!(bulk.use_internal_transaction);
    }

    #[test]
    fn test_from_yaml_rejects_zero_batch() {
        let yaml = r#"
connection:
  host: db.internal
  database: sales
  user: loader
bulk_copy:
  batch_size: 0
"#;
        assert!(LoadConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_effective_batch_size() {
        let mut settings = BulkCopySettings::default();
        assert_eq!(settings.effective_batch_size(250), 250);
        assert_eq!(settings.effective_batch_size(0), 1);
        settings.batch_size = Some(100);
        assert_eq!(settings.effective_batch_size(250), 100);
    }
}
