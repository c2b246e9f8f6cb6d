// ABOUTME: compare command - classifies an input snapshot against persisted records
// ABOUTME: Read-only: loads the scoped records and prints the four groups as JSON

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;

use super::{classification_json, load_input, StorageTarget};
use crate::compare::Comparator;
use crate::config::SyncConfig;

pub struct CompareOptions {
    pub config: PathBuf,
    pub input: PathBuf,
    pub target: StorageTarget,
}

pub async fn compare(opts: CompareOptions) -> Result<()> {
    let config = SyncConfig::load(&opts.config)?;
    let schema = &config.table;
    let mut new_records = load_input(schema, &opts.input)?;
    let comparator = Comparator::new(schema, &config.sync.compare)?;

    let storage = opts.target.open().await?;
    let scope = config.scope_filter();
    let old_records = storage
        .load(schema, scope.as_ref())
        .await
        .with_context(|| format!("Failed to load records from {}", schema.table()))?;
    storage
        .normalize(schema, &mut new_records)
        .await
        .context("Failed to normalize input records")?;

    let classification = comparator.classify(old_records, new_records);
    let counts = classification.counts();
    tracing::info!(
        "{}: {} added, {} removed, {} updated, {} unchanged",
        schema.table(),
        counts.added,
        counts.removed,
        counts.updated,
        counts.unchanged
    );

    let report = json!({
        "table": schema.table(),
        "groups": classification_json(schema, &classification),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );
    Ok(())
}
