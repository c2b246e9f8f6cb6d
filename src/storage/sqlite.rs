// ABOUTME: SQLite storage backend built on rusqlite
// ABOUTME: Multi-row INSERT ... RETURNING, CTE-driven bulk UPDATE and IN-list DELETE

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, ToSql};

use super::Storage;
use crate::error::{Result, SyncError};
use crate::filter::Filter;
use crate::record::{Record, RecordId, Value};
use crate::schema::Schema;
use crate::utils::{quote_ident, rows_per_statement, validate_schema_identifiers};

/// Stay below SQLITE_MAX_VARIABLE_NUMBER (32766 in the bundled build).
const MAX_PARAMS: usize = 32_000;

const VALUES_CTE: &str = "_sync_values";

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// How a column stores what is bound to it, from its declared type.
///
/// Follows SQLite's affinity rules, except that columns declared with
/// `BOOL` are tracked separately so their 0/1 integers load as booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
    Boolean,
}

impl Affinity {
    fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        let has = |names: &[&str]| names.iter().any(|n| upper.contains(n));
        if has(&["INT"]) {
            Affinity::Integer
        } else if has(&["CHAR", "CLOB", "TEXT"]) {
            Affinity::Text
        } else if has(&["BLOB"]) || upper.trim().is_empty() {
            Affinity::Blob
        } else if has(&["REAL", "FLOA", "DOUB"]) {
            Affinity::Real
        } else if has(&["BOOL"]) {
            Affinity::Boolean
        } else {
            Affinity::Numeric
        }
    }

    /// The value as it reads back after being stored in this column.
    fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (Affinity::Boolean, Value::Int(i)) if i == 0 || i == 1 => Value::Bool(i == 1),
            (Affinity::Boolean, Value::Float(f)) if is_integral(f) => {
                Affinity::Boolean.coerce(Value::Int(f as i64))
            }
            (Affinity::Boolean, Value::Text(s)) => match canonical_int(&s) {
                Some(i) => Affinity::Boolean.coerce(Value::Int(i)),
                None => Value::Text(s),
            },
            (Affinity::Integer | Affinity::Numeric, Value::Bool(b)) => Value::Int(i64::from(b)),
            (Affinity::Integer | Affinity::Numeric, Value::Float(f)) if is_integral(f) => {
                Value::Int(f as i64)
            }
            (Affinity::Integer | Affinity::Numeric, Value::Text(s)) => match canonical_int(&s) {
                Some(i) => Value::Int(i),
                None => Value::Text(s),
            },
            (Affinity::Real, Value::Int(i)) => Value::Float(i as f64),
            (Affinity::Real, Value::Bool(b)) => Value::Float(if b { 1.0 } else { 0.0 }),
            (Affinity::Real, Value::Text(s)) => match canonical_int(&s) {
                Some(i) => Value::Float(i as f64),
                None => Value::Text(s),
            },
            (Affinity::Text, Value::Int(i)) => Value::Text(i.to_string()),
            (Affinity::Text, Value::Bool(b)) => Value::Text(if b { "1" } else { "0" }.to_string()),
            (_, value) => value,
        }
    }
}

/// SQLite keeps a REAL as INTEGER only when the conversion is lossless.
fn is_integral(f: f64) -> bool {
    f.fract() == 0.0 && f >= -9.0e18 && f <= 9.0e18
}

/// Text SQLite converts to an integer: a plain decimal with no padding.
fn canonical_int(s: &str) -> Option<i64> {
    s.parse::<i64>().ok().filter(|i| i.to_string() == s)
}

/// Declared column affinities of a table, keyed by column name.
fn column_affinities(conn: &Connection, table: &str) -> Result<HashMap<String, Affinity>> {
    let query = format!("PRAGMA table_info({})", quote_ident(table));
    let context = || format!("Failed to get table info for '{}'", table);
    let mut stmt = conn
        .prepare(&query)
        .map_err(|e| map_sqlite_error(e, context()))?;
    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let declared: String = row.get(2)?;
            Ok((name, Affinity::from_declared(&declared)))
        })
        .map_err(|e| map_sqlite_error(e, context()))?
        .collect::<rusqlite::Result<HashMap<_, _>>>()
        .map_err(|e| map_sqlite_error(e, context()))?;
    Ok(rows)
}

fn placeholder(i: usize) -> String {
    format!("?{}", i)
}

/// Records stored in SQLite tables.
///
/// The identity column must be an `INTEGER PRIMARY KEY` so that inserting
/// `NULL` assigns a rowid. Values are coerced by column affinity on load and
/// in [`Storage::normalize`], so a `BOOLEAN` column loads as [`Value::Bool`]
/// and an integer sent to a `REAL` column compares as the float it becomes.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Ok(Self::from_connection(conn))
    }

    /// A private database that lives as long as the returned storage.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Run raw SQL, e.g. to create tables.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock()?
            .execute_batch(sql)
            .map_err(|e| map_sqlite_error(e, "Failed to execute SQL batch".to_string()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Storage(anyhow!("SQLite connection lock poisoned")))
    }
}

/// Uniqueness and other constraint failures become `SyncError::Constraint`.
fn map_sqlite_error(err: rusqlite::Error, context: String) -> SyncError {
    if let rusqlite::Error::SqliteFailure(code, message) = &err {
        if code.code == ErrorCode::ConstraintViolation {
            let detail = message.clone().unwrap_or_else(|| code.to_string());
            return SyncError::Constraint(format!("{}: {}", context, detail));
        }
    }
    SyncError::Storage(anyhow::Error::new(err).context(context))
}

fn column_list(schema: &Schema) -> Vec<String> {
    std::iter::once(schema.identity())
        .chain(schema.fields().iter().map(String::as_str))
        .map(quote_ident)
        .collect()
}

fn build_select_query(schema: &Schema, where_clause: Option<&str>) -> String {
    let mut query = format!(
        "SELECT {} FROM {}",
        column_list(schema).join(", "),
        quote_ident(schema.table())
    );
    if let Some(clause) = where_clause {
        query.push_str(" WHERE ");
        query.push_str(clause);
    }
    query.push_str(&format!(" ORDER BY {}", quote_ident(schema.identity())));
    query
}

/// ```sql
/// INSERT INTO "t" ("id", "a", "b") VALUES (?1, ?2, ?3), (?4, ?5, ?6) RETURNING "id"
/// ```
fn build_insert_query(schema: &Schema, num_rows: usize) -> String {
    let num_cols = schema.fields().len() + 1;
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| placeholder(row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {} RETURNING {}",
        quote_ident(schema.table()),
        column_list(schema).join(", "),
        value_rows.join(", "),
        quote_ident(schema.identity())
    )
}

/// ```sql
/// WITH "_sync_values"("id", "age") AS (VALUES (?1, ?2), (?3, ?4))
/// UPDATE "t" SET "age" = (SELECT "_sync_values"."age" FROM "_sync_values"
///                         WHERE "_sync_values"."id" = "t"."id")
/// WHERE "id" IN (SELECT "_sync_values"."id" FROM "_sync_values")
/// ```
fn build_update_query(schema: &Schema, fields: &[String], num_rows: usize) -> String {
    let table = quote_ident(schema.table());
    let identity = quote_ident(schema.identity());
    let cte = quote_ident(VALUES_CTE);
    let num_cols = fields.len() + 1;

    let cte_columns: Vec<String> = std::iter::once(identity.clone())
        .chain(fields.iter().map(|f| quote_ident(f)))
        .collect();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| placeholder(row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();
    let assignments: Vec<String> = fields
        .iter()
        .map(|f| {
            let col = quote_ident(f);
            format!(
                "{col} = (SELECT {cte}.{col} FROM {cte} WHERE {cte}.{identity} = {table}.{identity})"
            )
        })
        .collect();

    format!(
        "WITH {cte}({}) AS (VALUES {}) UPDATE {table} SET {} WHERE {identity} IN (SELECT {cte}.{identity} FROM {cte})",
        cte_columns.join(", "),
        value_rows.join(", "),
        assignments.join(", "),
    )
}

fn build_delete_query(schema: &Schema, num_rows: usize) -> String {
    let placeholders: Vec<String> = (1..=num_rows).map(placeholder).collect();
    format!(
        "DELETE FROM {} WHERE {} IN ({})",
        quote_ident(schema.table()),
        quote_ident(schema.identity()),
        placeholders.join(", ")
    )
}

fn row_to_record(
    schema: &Schema,
    affinities: &HashMap<String, Affinity>,
    raw: Vec<SqlValue>,
) -> Result<Record> {
    let mut values = raw.into_iter();
    let mut record = match values.next() {
        Some(SqlValue::Integer(id)) => Record::with_id(id),
        _ => {
            return Err(SyncError::MissingIdentity {
                table: schema.table().to_string(),
            })
        }
    };
    for (field, value) in schema.fields().iter().zip(values) {
        let value = match value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::Int(i),
            SqlValue::Real(f) => Value::Float(f),
            SqlValue::Text(s) => Value::Text(s),
            SqlValue::Blob(_) => {
                return Err(SyncError::InvalidValue {
                    field: field.clone(),
                    reason: "BLOB columns are not supported".to_string(),
                })
            }
        };
        let value = match affinities.get(field) {
            Some(affinity) => affinity.coerce(value),
            None => value,
        };
        record.set(field, value);
    }
    Ok(record)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn load(&self, schema: &Schema, scope: Option<&Filter>) -> Result<Vec<Record>> {
        validate_schema_identifiers(schema)?;
        let mut params = Vec::new();
        let where_clause = scope.map(|f| f.to_sql(&mut params, &placeholder));
        let query = build_select_query(schema, where_clause.as_deref());
        let values: Vec<&Value> = params.iter().map(|p| &p.value).collect();

        let conn = self.lock()?;
        let affinities = column_affinities(&conn, schema.table())?;
        let context = || format!("Failed to load records from '{}'", schema.table());
        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| map_sqlite_error(e, context()))?;
        let width = schema.fields().len() + 1;
        let raw_rows = stmt
            .query_map(params_from_iter(values), |row| {
                (0..width)
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<SqlValue>>>()
            })
            .map_err(|e| map_sqlite_error(e, context()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_sqlite_error(e, context()))?;

        tracing::debug!(
            "Loaded {} rows from SQLite table '{}'",
            raw_rows.len(),
            schema.table()
        );

        raw_rows
            .into_iter()
            .map(|raw| row_to_record(schema, &affinities, raw))
            .collect()
    }

    async fn insert(&self, schema: &Schema, records: &[Record]) -> Result<Vec<RecordId>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        validate_schema_identifiers(schema)?;
        let context = || format!("Failed to insert records into '{}'", schema.table());
        let per_statement = rows_per_statement(schema.fields().len() + 1, MAX_PARAMS);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_sqlite_error(e, context()))?;
        let mut ids = Vec::with_capacity(records.len());
        for chunk in records.chunks(per_statement) {
            let query = build_insert_query(schema, chunk.len());
            let params: Vec<Value> = chunk
                .iter()
                .flat_map(|r| {
                    std::iter::once(r.id.map(Value::Int).unwrap_or(Value::Null))
                        .chain(schema.fields().iter().map(|f| r.value(f).clone()))
                })
                .collect();
            let mut stmt = tx
                .prepare(&query)
                .map_err(|e| map_sqlite_error(e, context()))?;
            let returned = stmt
                .query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))
                .map_err(|e| map_sqlite_error(e, context()))?
                .collect::<rusqlite::Result<Vec<i64>>>()
                .map_err(|e| map_sqlite_error(e, context()))?;
            ids.extend(returned);
        }
        tx.commit().map_err(|e| map_sqlite_error(e, context()))?;
        Ok(ids)
    }

    async fn update(
        &self,
        schema: &Schema,
        fields: &[String],
        rows: &[(RecordId, &Record)],
    ) -> Result<u64> {
        if rows.is_empty() || fields.is_empty() {
            return Ok(0);
        }
        validate_schema_identifiers(schema)?;
        let context = || format!("Failed to update records in '{}'", schema.table());
        let per_statement = rows_per_statement(fields.len() + 1, MAX_PARAMS);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_sqlite_error(e, context()))?;
        let mut written = 0u64;
        for chunk in rows.chunks(per_statement) {
            let query = build_update_query(schema, fields, chunk.len());
            let params: Vec<Value> = chunk
                .iter()
                .flat_map(|(id, r)| {
                    std::iter::once(Value::Int(*id))
                        .chain(fields.iter().map(|f| r.value(f).clone()))
                })
                .collect();
            let affected = tx
                .execute(&query, params_from_iter(params.iter()))
                .map_err(|e| map_sqlite_error(e, context()))?;
            written += affected as u64;
        }
        tx.commit().map_err(|e| map_sqlite_error(e, context()))?;
        Ok(written)
    }

    async fn delete(&self, schema: &Schema, ids: &[RecordId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        validate_schema_identifiers(schema)?;
        let context = || format!("Failed to delete records from '{}'", schema.table());

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_sqlite_error(e, context()))?;
        let mut deleted = 0u64;
        for chunk in ids.chunks(MAX_PARAMS) {
            let query = build_delete_query(schema, chunk.len());
            let affected = tx
                .execute(&query, params_from_iter(chunk.iter()))
                .map_err(|e| map_sqlite_error(e, context()))?;
            deleted += affected as u64;
        }
        tx.commit().map_err(|e| map_sqlite_error(e, context()))?;
        Ok(deleted)
    }

    async fn normalize(&self, schema: &Schema, records: &mut [Record]) -> Result<()> {
        validate_schema_identifiers(schema)?;
        let affinities = column_affinities(&*self.lock()?, schema.table())?;
        for record in records.iter_mut() {
            for field in schema.fields() {
                let Some(affinity) = affinities.get(field) else {
                    continue;
                };
                if let Some(value) = record.get(field) {
                    let coerced = affinity.coerce(value.clone());
                    record.set(field, coerced);
                }
            }
        }
        Ok(())
    }
}
