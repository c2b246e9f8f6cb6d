// ABOUTME: Storage collaborator interface used by the synchronizer
// ABOUTME: Scoped load plus bulk insert, bulk field-restricted update and bulk delete

pub mod memory;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::Filter;
use crate::record::{Record, RecordId};
use crate::schema::Schema;

pub use memory::{MemoryStorage, Operation, OperationKind};
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

/// Persistent storage for records of a [`Schema`].
///
/// Implementations enforce identity uniqueness and report violations as
/// [`SyncError::Constraint`](crate::error::SyncError::Constraint). Each call
/// receives one batch; implementations may split it further to stay within
/// their bind-parameter limits.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Every persisted record matching `scope` (all records when `None`).
    async fn load(&self, schema: &Schema, scope: Option<&Filter>) -> Result<Vec<Record>>;

    /// Insert `records`, keeping pre-assigned identities and assigning the
    /// rest. Returns the identities in input order.
    async fn insert(&self, schema: &Schema, records: &[Record]) -> Result<Vec<RecordId>>;

    /// Write `fields` of each record onto the persisted row with the paired
    /// identity. Returns the number of rows written.
    async fn update(
        &self,
        schema: &Schema,
        fields: &[String],
        rows: &[(RecordId, &Record)],
    ) -> Result<u64>;

    /// Delete the rows with the given identities. Returns the number deleted.
    async fn delete(&self, schema: &Schema, ids: &[RecordId]) -> Result<u64>;

    /// Convert the values of `records` in place to the form [`Storage::load`]
    /// would return them in once written, e.g. an integer sent to a
    /// floating-point column becomes a float.
    ///
    /// Backends that store values unchanged keep the default, which does
    /// nothing.
    async fn normalize(&self, _schema: &Schema, _records: &mut [Record]) -> Result<()> {
        Ok(())
    }
}
