// ABOUTME: Command implementations behind the record-sync CLI
// ABOUTME: Shared helpers for opening storage, reading input snapshots and rendering reports

pub mod compare;
pub mod sync;

pub use compare::compare;
pub use sync::sync;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value as JsonValue};

use crate::compare::{Classification, Matched};
use crate::record::Record;
use crate::schema::Schema;
use crate::storage::{PostgresStorage, SqliteStorage, Storage};

/// Where persisted records live.
#[derive(Debug, Clone)]
pub enum StorageTarget {
    Sqlite(PathBuf),
    Postgres { url: String, schema: String },
}

impl StorageTarget {
    /// Pick the backend from the mutually exclusive CLI flags.
    pub fn from_args(
        sqlite: Option<PathBuf>,
        postgres: Option<String>,
        pg_schema: String,
    ) -> Result<Self> {
        match (sqlite, postgres) {
            (Some(path), None) => Ok(StorageTarget::Sqlite(path)),
            (None, Some(url)) => Ok(StorageTarget::Postgres {
                url,
                schema: pg_schema,
            }),
            (Some(_), Some(_)) => bail!("Use either --sqlite or --postgres, not both"),
            (None, None) => bail!("A storage target is required: pass --sqlite PATH or --postgres URL"),
        }
    }

    pub async fn open(&self) -> Result<Box<dyn Storage>> {
        match self {
            StorageTarget::Sqlite(path) => {
                tracing::info!("Opening SQLite database {}", path.display());
                let storage = SqliteStorage::open(path)
                    .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
                Ok(Box::new(storage))
            }
            StorageTarget::Postgres { url, schema } => {
                tracing::info!("Connecting to PostgreSQL (schema {})", schema);
                let client = crate::storage::postgres::connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                Ok(Box::new(PostgresStorage::with_schema(client, schema)))
            }
        }
    }
}

/// Read a JSON array of objects as records of `schema`.
pub fn load_input(schema: &Schema, path: &Path) -> Result<Vec<Record>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input from {}", path.display()))?;
    parse_input(schema, &contents).with_context(|| format!("Invalid input in {}", path.display()))
}

pub fn parse_input(schema: &Schema, contents: &str) -> Result<Vec<Record>> {
    let parsed: JsonValue = serde_json::from_str(contents).context("Input is not valid JSON")?;
    let items = match parsed {
        JsonValue::Array(items) => items,
        _ => bail!("Input must be a JSON array of objects"),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let object = item
                .as_object()
                .with_context(|| format!("Element {} is not a JSON object", i))?;
            Record::from_json(schema, object).with_context(|| format!("Element {} is invalid", i))
        })
        .collect()
}

fn matched_json(schema: &Schema, matched: &Matched) -> JsonValue {
    let changes: serde_json::Map<String, JsonValue> = matched
        .changes
        .iter()
        .map(|c| {
            (
                c.field.clone(),
                json!({ "old": c.old.to_json(), "new": c.new.to_json() }),
            )
        })
        .collect();
    json!({
        "old": matched.old.to_json(schema),
        "new": matched.new.to_json(schema),
        "changes": changes,
    })
}

/// The four groups as JSON, updated entries carrying their field changes.
pub fn classification_json(schema: &Schema, classification: &Classification) -> JsonValue {
    let records = |records: &[Record]| -> Vec<JsonValue> {
        records.iter().map(|r| r.to_json(schema)).collect()
    };
    let matches = |matches: &[Matched]| -> Vec<JsonValue> {
        matches.iter().map(|m| matched_json(schema, m)).collect()
    };
    json!({
        "added": records(&classification.added),
        "removed": records(&classification.removed),
        "updated": matches(&classification.updated),
        "unchanged": matches(&classification.unchanged),
    })
}
