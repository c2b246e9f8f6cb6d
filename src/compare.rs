// ABOUTME: Comparator - matches old and new records by business key and classifies them
// ABOUTME: Produces added/removed/updated/unchanged groups plus per-field change sets

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::Result;
use crate::record::{Record, Value};
use crate::schema::{FieldSet, Schema};

/// Field selection for one comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompareOptions {
    /// Fields whose values together identify a record across old and new.
    pub key_fields: Vec<String>,
    /// Fields never compared (and therefore never written on update).
    #[serde(default)]
    pub ignore_fields: Vec<String>,
    /// Restrict comparison to these fields. `None` means all regular fields.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

impl CompareOptions {
    /// Options matching records on `key_fields`, comparing every other
    /// regular field.
    pub fn new<I, S>(key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Fields left out of comparison. Wins over [`CompareOptions::restrict`].
    pub fn ignore<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn restrict<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// One changed field of an updated record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

/// Changed fields in compared-field order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet(Vec<FieldChange>);

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldChange> {
        self.0.iter()
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.0.iter().find(|c| c.field == field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|c| c.field.as_str())
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a FieldChange;
    type IntoIter = std::slice::Iter<'a, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// An old record and the new record that claimed it by key.
#[derive(Debug, Clone, PartialEq)]
pub struct Matched {
    pub old: Record,
    pub new: Record,
    pub changes: ChangeSet,
}

/// The four-way partition of old and new records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// New records with no key match, in input order.
    pub added: Vec<Record>,
    /// Old records no new record claimed, in old insertion order.
    pub removed: Vec<Record>,
    /// Matches with at least one changed field, in new input order.
    pub updated: Vec<Matched>,
    /// Matches with no changed field, in new input order.
    pub unchanged: Vec<Matched>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupCounts {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl Classification {
    /// Each updated new record with its per-field changes.
    pub fn updated_details(&self) -> impl Iterator<Item = (&Record, &ChangeSet)> {
        self.updated.iter().map(|m| (&m.new, &m.changes))
    }

    /// Group sizes, as reported by the compare command.
    pub fn counts(&self) -> GroupCounts {
        GroupCounts {
            added: self.added.len(),
            removed: self.removed.len(),
            updated: self.updated.len(),
            unchanged: self.unchanged.len(),
        }
    }

    /// True when nothing would be written.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

type Key = Vec<Value>;

/// Classifies records for one schema and field selection.
///
/// The field set is resolved once in [`Comparator::new`]; classification
/// itself cannot fail.
#[derive(Debug, Clone)]
pub struct Comparator<'a> {
    schema: &'a Schema,
    fields: FieldSet,
}

impl<'a> Comparator<'a> {
    /// Resolve `options` against `schema`. Fails when the key is empty or
    /// any listed field is not part of the schema.
    pub fn new(schema: &'a Schema, options: &CompareOptions) -> Result<Self> {
        let fields = schema.resolve(
            &options.key_fields,
            &options.ignore_fields,
            options.fields.as_deref(),
        )?;
        Ok(Self { schema, fields })
    }

    /// Key and compared fields in schema order.
    pub fn field_set(&self) -> &FieldSet {
        &self.fields
    }

    fn key_of(&self, record: &Record) -> Key {
        self.fields
            .key()
            .iter()
            .map(|f| record.value(f).clone())
            .collect()
    }

    fn diff(&self, old: &Record, new: &Record) -> ChangeSet {
        ChangeSet(
            self.fields
                .compared()
                .iter()
                .filter(|f| old.value(f) != new.value(f))
                .map(|f| FieldChange {
                    field: f.clone(),
                    old: old.value(f).clone(),
                    new: new.value(f).clone(),
                })
                .collect(),
        )
    }

    /// Partition `new_records` and `old_records` into the four groups.
    ///
    /// # Arguments
    ///
    /// * `old_records` - The persisted collection, each with an identity
    /// * `new_records` - The fresh snapshot; identities are optional
    ///
    /// # Returns
    ///
    /// A [`Classification`] in which every new record lands in exactly one of
    /// `added`, `updated` or `unchanged`, and every old record without a
    /// matching new record lands in `removed`. Groups keep input order.
    pub fn classify<I>(&self, old_records: I, new_records: Vec<Record>) -> Classification
    where
        I: IntoIterator<Item = Record>,
    {
        // Slots keep first-insertion order; a later duplicate key replaces
        // the record in its slot.
        let mut slots: Vec<Option<Record>> = Vec::new();
        let mut index: HashMap<Key, usize> = HashMap::new();
        for record in old_records {
            let key = self.key_of(&record);
            match index.get(&key) {
                Some(&slot) => {
                    tracing::debug!(
                        "{}: duplicate key {:?} among old records, keeping the later one",
                        self.schema.table(),
                        key
                    );
                    slots[slot] = Some(record);
                }
                None => {
                    index.insert(key, slots.len());
                    slots.push(Some(record));
                }
            }
        }

        let mut result = Classification::default();
        for new in new_records {
            let key = self.key_of(&new);
            match index.remove(&key).and_then(|slot| slots[slot].take()) {
                None => result.added.push(new),
                Some(old) => {
                    let changes = self.diff(&old, &new);
                    let matched = Matched { old, new, changes };
                    if matched.changes.is_empty() {
                        result.unchanged.push(matched);
                    } else {
                        result.updated.push(matched);
                    }
                }
            }
        }

        result.removed = slots.into_iter().flatten().collect();

        tracing::debug!(
            "{}: compared {} keys: {} added, {} updated, {} unchanged, {} removed",
            self.schema.table(),
            result.added.len() + result.updated.len() + result.unchanged.len(),
            result.added.len(),
            result.updated.len(),
            result.unchanged.len(),
            result.removed.len()
        );

        result
    }
}

/// Compare `old_records` against `new_records` in one call.
///
/// # Arguments
///
/// * `schema` - Describes the records on both sides
/// * `old_records` - The persisted collection
/// * `new_records` - The fresh snapshot
/// * `options` - Key fields plus optional ignore and restrict lists
///
/// # Returns
///
/// The [`Classification`], or an error when the options do not resolve
/// against the schema (see [`Comparator::new`]).
pub fn compare<I>(
    schema: &Schema,
    old_records: I,
    new_records: Vec<Record>,
    options: &CompareOptions,
) -> Result<Classification>
where
    I: IntoIterator<Item = Record>,
{
    Ok(Comparator::new(schema, options)?.classify(old_records, new_records))
}
