// ABOUTME: In-process storage backend with identity uniqueness and a write log
// ABOUTME: Reference implementation of the Storage trait, used by tests and dry runs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;

use super::Storage;
use crate::error::{Result, SyncError};
use crate::filter::Filter;
use crate::record::{Record, RecordId};
use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Load,
    Insert,
    Update,
    Delete,
}

/// One storage call as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub table: String,
    pub rows: usize,
    /// Fields written, for updates.
    pub fields: Vec<String>,
}

#[derive(Debug)]
struct Table {
    rows: BTreeMap<RecordId, Record>,
    next_id: RecordId,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Table>,
    operations: Vec<Operation>,
}

impl Inner {
    fn log(&mut self, kind: OperationKind, table: &str, rows: usize, fields: &[String]) {
        self.operations.push(Operation {
            kind,
            table: table.to_string(),
            rows,
            fields: fields.to_vec(),
        });
    }
}

/// Records held in memory, keyed by table name and ordered by identity.
///
/// Inserts are checked as a whole batch before anything is written, so a
/// rejected batch leaves the table untouched.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SyncError::Storage(anyhow!("memory storage lock poisoned")))
    }

    /// Seed a row without recording an operation.
    pub fn insert_row(&self, schema: &Schema, record: Record) -> Result<RecordId> {
        let mut inner = self.lock()?;
        let table = inner.tables.entry(schema.table().to_string()).or_default();
        let ids = assign_ids(schema, table, std::slice::from_ref(&record))?;
        let id = ids[0];
        table.rows.insert(id, stored(schema, id, &record));
        Ok(id)
    }

    pub fn get(&self, table: &str, id: RecordId) -> Option<Record> {
        self.lock()
            .ok()?
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&id).cloned())
    }

    /// Rows of `schema`'s table matching `filter`, in identity order.
    pub fn rows(&self, schema: &Schema, filter: Option<&Filter>) -> Vec<Record> {
        match self.lock() {
            Ok(inner) => select(&inner, schema, filter),
            Err(_) => Vec::new(),
        }
    }

    pub fn count(&self, schema: &Schema, filter: Option<&Filter>) -> usize {
        self.rows(schema, filter).len()
    }

    /// Storage calls made through the [`Storage`] trait, oldest first.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock()
            .map(|inner| inner.operations.clone())
            .unwrap_or_default()
    }

    pub fn clear_operations(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.operations.clear();
        }
    }
}

fn select(inner: &Inner, schema: &Schema, filter: Option<&Filter>) -> Vec<Record> {
    inner
        .tables
        .get(schema.table())
        .map(|table| {
            table
                .rows
                .values()
                .filter(|r| filter.map_or(true, |f| f.matches(schema, r)))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Copy of `record` holding only schema fields, under identity `id`.
fn stored(schema: &Schema, id: RecordId, record: &Record) -> Record {
    let mut row = Record::with_id(id);
    for field in schema.fields() {
        row.set(field, record.value(field).clone());
    }
    row
}

/// Validate pre-assigned identities and allocate the missing ones.
fn assign_ids(schema: &Schema, table: &mut Table, records: &[Record]) -> Result<Vec<RecordId>> {
    let mut taken = HashSet::new();
    for id in records.iter().filter_map(|r| r.id) {
        if table.rows.contains_key(&id) || !taken.insert(id) {
            return Err(SyncError::Constraint(format!(
                "duplicate key value violates unique constraint on {}.{} ({})",
                schema.table(),
                schema.identity(),
                id
            )));
        }
    }

    let mut ids = Vec::with_capacity(records.len());
    for record in records {
        let id = match record.id {
            Some(id) => id,
            None => {
                while table.rows.contains_key(&table.next_id) || taken.contains(&table.next_id) {
                    table.next_id += 1;
                }
                let id = table.next_id;
                table.next_id += 1;
                id
            }
        };
        ids.push(id);
    }
    Ok(ids)
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, schema: &Schema, scope: Option<&Filter>) -> Result<Vec<Record>> {
        let mut inner = self.lock()?;
        let rows = select(&inner, schema, scope);
        inner.log(OperationKind::Load, schema.table(), rows.len(), &[]);
        Ok(rows)
    }

    async fn insert(&self, schema: &Schema, records: &[Record]) -> Result<Vec<RecordId>> {
        let mut inner = self.lock()?;
        let table = inner.tables.entry(schema.table().to_string()).or_default();
        let ids = assign_ids(schema, table, records)?;
        for (id, record) in ids.iter().zip(records) {
            table.rows.insert(*id, stored(schema, *id, record));
        }
        inner.log(OperationKind::Insert, schema.table(), records.len(), &[]);
        Ok(ids)
    }

    async fn update(
        &self,
        schema: &Schema,
        fields: &[String],
        rows: &[(RecordId, &Record)],
    ) -> Result<u64> {
        let mut inner = self.lock()?;
        let mut written = 0u64;
        if let Some(table) = inner.tables.get_mut(schema.table()) {
            for (id, record) in rows {
                if let Some(row) = table.rows.get_mut(id) {
                    for field in fields {
                        row.set(field, record.value(field).clone());
                    }
                    written += 1;
                }
            }
        }
        inner.log(OperationKind::Update, schema.table(), rows.len(), fields);
        Ok(written)
    }

    async fn delete(&self, schema: &Schema, ids: &[RecordId]) -> Result<u64> {
        let mut inner = self.lock()?;
        let mut deleted = 0u64;
        if let Some(table) = inner.tables.get_mut(schema.table()) {
            for id in ids {
                if table.rows.remove(id).is_some() {
                    deleted += 1;
                }
            }
        }
        inner.log(OperationKind::Delete, schema.table(), ids.len(), &[]);
        Ok(deleted)
    }
}
