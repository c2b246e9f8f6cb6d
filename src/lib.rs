// ABOUTME: Library root for record-sync
// ABOUTME: Exports the comparator, synchronizer, storage backends and configuration

pub mod commands;
pub mod compare;
pub mod config;
pub mod error;
pub mod filter;
pub mod record;
pub mod schema;
pub mod storage;
pub mod sync;
pub mod utils;

pub use compare::{
    compare, ChangeSet, Classification, CompareOptions, Comparator, FieldChange, GroupCounts,
    Matched,
};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use filter::Filter;
pub use record::{Record, RecordId, Value};
pub use schema::{FieldSet, Schema};
pub use storage::{MemoryStorage, PostgresStorage, SqliteStorage, Storage};
pub use sync::{sync, SyncOptions, SyncOutcome, SyncStats, Synchronizer};
