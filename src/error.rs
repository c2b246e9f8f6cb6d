// ABOUTME: Error taxonomy for comparison and synchronization
// ABOUTME: Separates caller contract violations from storage-enforced constraint failures

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A key, ignore, restrict or scope field that the schema does not define.
    #[error("unknown field '{field}' on {table}")]
    UnknownField { field: String, table: String },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid sync options: {0}")]
    InvalidOptions(String),

    /// A persisted record came back from storage without an identity value.
    #[error("record loaded from {table} has no identity")]
    MissingIdentity { table: String },

    #[error("cannot bind value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Uniqueness or other constraint rejected by the storage layer.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn unknown_field(field: &str, table: &str) -> Self {
        SyncError::UnknownField {
            field: field.to_string(),
            table: table.to_string(),
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, SyncError::Constraint(_))
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Storage(err)
    }
}
