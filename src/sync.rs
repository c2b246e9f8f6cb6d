// ABOUTME: Synchronizer - loads the scoped old collection, classifies it and applies bulk writes
// ABOUTME: Returns created/updated/deleted counts together with the full classification

use serde::{Deserialize, Serialize};

use crate::compare::{Classification, CompareOptions, Comparator};
use crate::error::{Result, SyncError};
use crate::filter::Filter;
use crate::record::{Record, RecordId};
use crate::schema::Schema;
use crate::storage::Storage;

/// Options for one synchronization run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SyncOptions {
    #[serde(flatten)]
    pub compare: CompareOptions,
    /// Leave added records unwritten.
    #[serde(default)]
    pub skip_creates: bool,
    /// Leave updated records unwritten.
    #[serde(default)]
    pub skip_updates: bool,
    /// Leave removed records in storage.
    #[serde(default)]
    pub skip_deletes: bool,
    /// Maximum records per storage write call. `None` writes each group in
    /// a single call.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl SyncOptions {
    pub fn new(compare: CompareOptions) -> Self {
        Self {
            compare,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == Some(0) {
            return Err(SyncError::InvalidOptions(
                "batch_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Counts of records actually written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl SyncStats {
    /// Writes of every kind. Zero for a rerun of the same snapshot.
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub stats: SyncStats,
    /// Computed in full regardless of skip flags. Added records carry the
    /// identities storage assigned when creates were applied.
    pub classification: Classification,
}

/// Applies a new snapshot of records to storage for one schema.
///
/// A run is load, compare, then inserts, updates and deletes, in that
/// order. The synchronizer does not open a transaction; a failure part way
/// leaves earlier writes in place.
pub struct Synchronizer<'a, S: Storage + ?Sized> {
    storage: &'a S,
    schema: &'a Schema,
}

impl<'a, S: Storage + ?Sized> Synchronizer<'a, S> {
    pub fn new(storage: &'a S, schema: &'a Schema) -> Self {
        Self { storage, schema }
    }

    /// Reconcile the persisted records in `scope` with `new_records`.
    ///
    /// # Arguments
    ///
    /// * `new_records` - The fresh snapshot, in the order groups should report it
    /// * `scope` - Selects the persisted records taking part (`None` for all)
    /// * `options` - Key and field selection, skip flags and batch size
    ///
    /// # Returns
    ///
    /// Counts of records created, updated and deleted, plus the full
    /// classification. Skip flags zero the matching count but never change
    /// the groups.
    ///
    /// # Errors
    ///
    /// Option and scope errors are returned before storage is touched.
    /// Storage errors, including [`SyncError::Constraint`], are returned as
    /// they occur; writes already applied stay in place.
    pub async fn sync(
        &self,
        mut new_records: Vec<Record>,
        scope: Option<&Filter>,
        options: &SyncOptions,
    ) -> Result<SyncOutcome> {
        options.validate()?;
        let comparator = Comparator::new(self.schema, &options.compare)?;
        if let Some(filter) = scope {
            filter.validate(self.schema)?;
        }

        let old_records = self.storage.load(self.schema, scope).await?;
        tracing::debug!(
            "{}: loaded {} records in scope",
            self.schema.table(),
            old_records.len()
        );

        // Values must compare in the form storage hands them back in.
        self.storage
            .normalize(self.schema, &mut new_records)
            .await?;
        let mut classification = comparator.classify(old_records, new_records);
        let mut stats = SyncStats::default();

        if options.skip_creates {
            tracing::debug!("{}: skipping creates", self.schema.table());
        } else {
            stats.created = self
                .create(&mut classification.added, options.batch_size)
                .await?;
        }

        if options.skip_updates {
            tracing::debug!("{}: skipping updates", self.schema.table());
        } else {
            stats.updated = self
                .update(
                    &classification,
                    comparator.field_set().compared(),
                    options.batch_size,
                )
                .await?;
        }

        if options.skip_deletes {
            tracing::debug!("{}: skipping deletes", self.schema.table());
        } else {
            stats.deleted = self
                .delete(&classification.removed, options.batch_size)
                .await?;
        }

        tracing::info!(
            "{}: {} created, {} updated, {} deleted",
            self.schema.table(),
            stats.created,
            stats.updated,
            stats.deleted
        );

        Ok(SyncOutcome {
            stats,
            classification,
        })
    }

    async fn create(&self, added: &mut [Record], batch_size: Option<usize>) -> Result<usize> {
        if added.is_empty() {
            return Ok(0);
        }
        let width = batch_size.unwrap_or(added.len());
        for chunk in added.chunks_mut(width) {
            let ids = self.storage.insert(self.schema, chunk).await?;
            if ids.len() != chunk.len() {
                return Err(SyncError::Storage(anyhow::anyhow!(
                    "insert into {} returned {} identities for {} records",
                    self.schema.table(),
                    ids.len(),
                    chunk.len()
                )));
            }
            for (record, id) in chunk.iter_mut().zip(ids) {
                record.id = Some(id);
            }
            tracing::debug!(
                "{}: inserted batch of {} records",
                self.schema.table(),
                chunk.len()
            );
        }
        Ok(added.len())
    }

    async fn update(
        &self,
        classification: &Classification,
        fields: &[String],
        batch_size: Option<usize>,
    ) -> Result<usize> {
        let updated = &classification.updated;
        if updated.is_empty() {
            return Ok(0);
        }
        let rows = updated
            .iter()
            .map(|m| self.identity_of(&m.old).map(|id| (id, &m.new)))
            .collect::<Result<Vec<(RecordId, &Record)>>>()?;

        let width = batch_size.unwrap_or(rows.len());
        for chunk in rows.chunks(width) {
            let written = self.storage.update(self.schema, fields, chunk).await?;
            if written < chunk.len() as u64 {
                tracing::warn!(
                    "{}: update matched {} of {} rows; the rest were removed since loading",
                    self.schema.table(),
                    written,
                    chunk.len()
                );
            }
            tracing::debug!(
                "{}: updated batch of {} records ({})",
                self.schema.table(),
                chunk.len(),
                fields.join(", ")
            );
        }
        Ok(rows.len())
    }

    async fn delete(&self, removed: &[Record], batch_size: Option<usize>) -> Result<usize> {
        if removed.is_empty() {
            return Ok(0);
        }
        let ids = removed
            .iter()
            .map(|r| self.identity_of(r))
            .collect::<Result<Vec<RecordId>>>()?;

        let width = batch_size.unwrap_or(ids.len());
        for chunk in ids.chunks(width) {
            let deleted = self.storage.delete(self.schema, chunk).await?;
            if deleted < chunk.len() as u64 {
                tracing::warn!(
                    "{}: delete removed {} of {} rows; the rest were already gone",
                    self.schema.table(),
                    deleted,
                    chunk.len()
                );
            }
            tracing::debug!(
                "{}: deleted batch of {} records",
                self.schema.table(),
                chunk.len()
            );
        }
        Ok(ids.len())
    }

    fn identity_of(&self, record: &Record) -> Result<RecordId> {
        record.id.ok_or_else(|| SyncError::MissingIdentity {
            table: self.schema.table().to_string(),
        })
    }
}

/// Synchronize `new_records` into `storage` in one call.
///
/// Shorthand for [`Synchronizer::new`] followed by [`Synchronizer::sync`].
///
/// # Examples
///
/// ```
/// # use record_sync::{sync, CompareOptions, MemoryStorage, Record, Schema, SyncOptions};
/// # tokio_test_block(async {
/// let schema = Schema::new("employees", "id", ["name", "age"]).unwrap();
/// let storage = MemoryStorage::new();
/// let options = SyncOptions::new(CompareOptions::new(["name"]));
///
/// let new = vec![Record::new().with("name", "Scott").with("age", 40)];
/// let outcome = sync(&storage, &schema, new, None, &options).await.unwrap();
/// assert_eq!(outcome.stats.created, 1);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub async fn sync<S: Storage + ?Sized>(
    storage: &S,
    schema: &Schema,
    new_records: Vec<Record>,
    scope: Option<&Filter>,
    options: &SyncOptions,
) -> Result<SyncOutcome> {
    Synchronizer::new(storage, schema)
        .sync(new_records, scope, options)
        .await
}
