// ABOUTME: TOML configuration describing the table schema, sync options and scope
// ABOUTME: Validated on load so the CLI can fail before touching storage

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::filter::Filter;
use crate::record::Value;
use crate::schema::Schema;
use crate::sync::SyncOptions;

/// Contents of a sync configuration file.
///
/// ```toml
/// [table]
/// name = "employees"
/// identity = "id"
/// fields = ["company_id", "name", "age"]
///
/// [sync]
/// key_fields = ["company_id", "name"]
/// ignore_fields = ["age"]
/// skip_deletes = true
///
/// [scope]
/// company_id = 1
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub table: Schema,
    pub sync: SyncOptions,
    /// Field equalities that select the persisted records under sync.
    #[serde(default)]
    pub scope: Option<BTreeMap<String, Value>>,
}

impl SyncConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(contents).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            SyncError::Config(msg) => SyncError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// The scope table as a conjunction of equalities.
    pub fn scope_filter(&self) -> Option<Filter> {
        self.scope
            .as_ref()
            .filter(|scope| !scope.is_empty())
            .map(|scope| Filter::all_eq(scope.iter().map(|(k, v)| (k.as_str(), v.clone()))))
    }

    fn validate(&self) -> Result<()> {
        self.table
            .resolve(
                &self.sync.compare.key_fields,
                &self.sync.compare.ignore_fields,
                self.sync.compare.fields.as_deref(),
            )
            .map_err(|e| SyncError::Config(format!("[sync] {}", e)))?;
        if self.sync.batch_size == Some(0) {
            return Err(SyncError::Config(
                "[sync] batch_size must be greater than zero".into(),
            ));
        }
        if let Some(filter) = self.scope_filter() {
            filter
                .validate(&self.table)
                .map_err(|e| SyncError::Config(format!("[scope] {}", e)))?;
        }
        Ok(())
    }
}
