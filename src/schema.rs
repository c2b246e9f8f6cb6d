// ABOUTME: Explicit schema descriptor for a record type (table, identity, ordered fields)
// ABOUTME: Resolves key, ignore and restrict field lists into the compared/written field set

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Describes one record type: the table it lives in, its identity field and
/// its regular fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSchema")]
pub struct Schema {
    table: String,
    identity: String,
    fields: Vec<String>,
}

#[derive(Deserialize)]
struct RawSchema {
    name: String,
    #[serde(default = "default_identity")]
    identity: String,
    fields: Vec<String>,
}

fn default_identity() -> String {
    "id".to_string()
}

impl TryFrom<RawSchema> for Schema {
    type Error = SyncError;

    fn try_from(raw: RawSchema) -> Result<Self> {
        Schema::new(raw.name, raw.identity, raw.fields)
    }
}

impl Schema {
    /// Create a schema, rejecting empty names, duplicate fields and an
    /// identity field that is also listed as a regular field.
    pub fn new<I, S>(table: impl Into<String>, identity: impl Into<String>, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        let identity = identity.into();
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();

        if table.trim().is_empty() {
            return Err(SyncError::InvalidSchema("table name cannot be empty".into()));
        }
        if identity.trim().is_empty() {
            return Err(SyncError::InvalidSchema(format!(
                "identity field of {} cannot be empty",
                table
            )));
        }

        let mut seen = HashSet::new();
        for field in &fields {
            if field.trim().is_empty() {
                return Err(SyncError::InvalidSchema(format!(
                    "{} has an empty field name",
                    table
                )));
            }
            if *field == identity {
                return Err(SyncError::InvalidSchema(format!(
                    "identity field '{}' must not be listed among the fields of {}",
                    identity, table
                )));
            }
            if !seen.insert(field.as_str()) {
                return Err(SyncError::InvalidSchema(format!(
                    "duplicate field '{}' in {}",
                    field, table
                )));
            }
        }

        Ok(Self {
            table,
            identity,
            fields,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Regular (non-identity) fields in declaration order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }

    /// True for regular fields and the identity field.
    pub fn knows(&self, name: &str) -> bool {
        name == self.identity || self.has_field(name)
    }

    /// Resolve the field selection for one comparison.
    ///
    /// The compared set is `(restrict or all fields) - key - identity - ignore`
    /// in schema order. It is also the set written when applying updates.
    pub fn resolve(
        &self,
        key_fields: &[String],
        ignore_fields: &[String],
        restrict_fields: Option<&[String]>,
    ) -> Result<FieldSet> {
        if key_fields.is_empty() {
            return Err(SyncError::InvalidOptions(
                "key_fields must name at least one field".into(),
            ));
        }
        for field in key_fields {
            if *field == self.identity {
                return Err(SyncError::InvalidOptions(format!(
                    "identity field '{}' cannot be used as a key field",
                    field
                )));
            }
            self.require(field)?;
        }
        for field in ignore_fields {
            self.require_known(field)?;
        }
        if let Some(restrict) = restrict_fields {
            for field in restrict {
                self.require_known(field)?;
            }
        }

        let compared = self
            .fields
            .iter()
            .filter(|f| restrict_fields.map_or(true, |r| r.contains(f)))
            .filter(|f| !key_fields.contains(f))
            .filter(|f| !ignore_fields.contains(f))
            .cloned()
            .collect();

        Ok(FieldSet {
            key: key_fields.to_vec(),
            compared,
        })
    }

    fn require(&self, field: &str) -> Result<()> {
        if self.has_field(field) {
            Ok(())
        } else {
            Err(SyncError::unknown_field(field, &self.table))
        }
    }

    fn require_known(&self, field: &str) -> Result<()> {
        if self.knows(field) {
            Ok(())
        } else {
            Err(SyncError::unknown_field(field, &self.table))
        }
    }
}

/// Result of [`Schema::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet {
    key: Vec<String>,
    compared: Vec<String>,
}

impl FieldSet {
    pub fn key(&self) -> &[String] {
        &self.key
    }

    /// Fields compared for equality and written on update.
    pub fn compared(&self) -> &[String] {
        &self.compared
    }
}
