// ABOUTME: sync command - applies an input snapshot to persisted records
// ABOUTME: CLI flags override the skip flags and batch size from the config file

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;

use super::{classification_json, load_input, StorageTarget};
use crate::config::SyncConfig;
use crate::sync::Synchronizer;

pub struct SyncOptions {
    pub config: PathBuf,
    pub input: PathBuf,
    pub target: StorageTarget,
    pub skip_creates: bool,
    pub skip_updates: bool,
    pub skip_deletes: bool,
    pub batch_size: Option<usize>,
}

pub async fn sync(opts: SyncOptions) -> Result<()> {
    let config = SyncConfig::load(&opts.config)?;
    let schema = &config.table;
    let new_records = load_input(schema, &opts.input)?;

    let mut options = config.sync.clone();
    options.skip_creates |= opts.skip_creates;
    options.skip_updates |= opts.skip_updates;
    options.skip_deletes |= opts.skip_deletes;
    if opts.batch_size.is_some() {
        options.batch_size = opts.batch_size;
    }

    let storage = opts.target.open().await?;
    let scope = config.scope_filter();
    let outcome = Synchronizer::new(storage.as_ref(), schema)
        .sync(new_records, scope.as_ref(), &options)
        .await
        .with_context(|| format!("Failed to sync {}", schema.table()))?;

    let report = json!({
        "table": schema.table(),
        "stats": outcome.stats,
        "groups": classification_json(schema, &outcome.classification),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );
    Ok(())
}
