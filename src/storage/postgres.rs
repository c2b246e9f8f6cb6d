// ABOUTME: PostgreSQL storage backend built on tokio-postgres
// ABOUTME: Binds values by column type and batches writes within the bind-parameter limit

use std::collections::HashMap;
use std::fmt;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use super::Storage;
use crate::error::{Result, SyncError};
use crate::filter::Filter;
use crate::record::{Record, RecordId, Value};
use crate::schema::Schema;
use crate::utils::{quote_ident, rows_per_statement, validate_identifier, validate_schema_identifiers};

/// PostgreSQL allows 65535 parameters per statement; leave some margin.
const MAX_PARAMS: usize = 65_000;

const VALUES_ALIAS: &str = "_sync_values";
const TARGET_ALIAS: &str = "_sync_target";

type Param = Box<dyn ToSql + Sync + Send>;

/// Column types the backend can bind and read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Bool,
    Text,
}

impl ColumnType {
    fn parse(data_type: &str) -> Option<Self> {
        match data_type {
            "smallint" | "int2" => Some(ColumnType::Int2),
            "integer" | "int4" => Some(ColumnType::Int4),
            "bigint" | "int8" => Some(ColumnType::Int8),
            "real" | "float4" => Some(ColumnType::Float4),
            "double precision" | "float8" => Some(ColumnType::Float8),
            "boolean" | "bool" => Some(ColumnType::Bool),
            "text" | "varchar" | "character varying" | "char" | "character" | "name" => {
                Some(ColumnType::Text)
            }
            _ => None,
        }
    }

    /// Type name used in explicit `$n::type` casts.
    fn cast(&self) -> &'static str {
        match self {
            ColumnType::Int2 => "int2",
            ColumnType::Int4 => "int4",
            ColumnType::Int8 => "int8",
            ColumnType::Float4 => "float4",
            ColumnType::Float8 => "float8",
            ColumnType::Bool => "bool",
            ColumnType::Text => "text",
        }
    }
}

impl ColumnType {
    /// The value as it reads back after being bound to this column.
    fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (ColumnType::Float4, Value::Float(f)) => Value::Float(f64::from(f as f32)),
            (ColumnType::Float4, Value::Int(i)) => Value::Float(f64::from(i as f32)),
            (ColumnType::Float8, Value::Int(i)) => Value::Float(i as f64),
            (_, value) => value,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cast())
    }
}

/// Column name to type for one table.
struct ColumnTypes {
    table: String,
    types: HashMap<String, ColumnType>,
}

impl ColumnTypes {
    fn get(&self, field: &str) -> Result<ColumnType> {
        self.types
            .get(field)
            .copied()
            .ok_or_else(|| SyncError::unknown_field(field, &self.table))
    }
}

/// Bind `value` as the Rust type `column` expects.
fn to_param(field: &str, column: ColumnType, value: &Value) -> Result<Param> {
    let mismatch = || SyncError::InvalidValue {
        field: field.to_string(),
        reason: format!("cannot bind {} value to {} column", value.kind(), column),
    };
    let out_of_range = || SyncError::InvalidValue {
        field: field.to_string(),
        reason: format!("{} is out of range for {} column", value, column),
    };

    let param: Param = match (column, value) {
        (ColumnType::Int2, Value::Null) => Box::new(None::<i16>),
        (ColumnType::Int4, Value::Null) => Box::new(None::<i32>),
        (ColumnType::Int8, Value::Null) => Box::new(None::<i64>),
        (ColumnType::Float4, Value::Null) => Box::new(None::<f32>),
        (ColumnType::Float8, Value::Null) => Box::new(None::<f64>),
        (ColumnType::Bool, Value::Null) => Box::new(None::<bool>),
        (ColumnType::Text, Value::Null) => Box::new(None::<String>),
        (ColumnType::Int2, Value::Int(i)) => Box::new(i16::try_from(*i).map_err(|_| out_of_range())?),
        (ColumnType::Int4, Value::Int(i)) => Box::new(i32::try_from(*i).map_err(|_| out_of_range())?),
        (ColumnType::Int8, Value::Int(i)) => Box::new(*i),
        (ColumnType::Float4, Value::Float(f)) => Box::new(*f as f32),
        (ColumnType::Float4, Value::Int(i)) => Box::new(*i as f32),
        (ColumnType::Float8, Value::Float(f)) => Box::new(*f),
        (ColumnType::Float8, Value::Int(i)) => Box::new(*i as f64),
        (ColumnType::Bool, Value::Bool(b)) => Box::new(*b),
        (ColumnType::Text, Value::Text(s)) => Box::new(s.clone()),
        _ => return Err(mismatch()),
    };
    Ok(param)
}

fn read_value(row: &Row, idx: usize, field: &str, column: ColumnType) -> Result<Value> {
    let context = || format!("Failed to read column '{}'", field);
    let value: Value = match column {
        ColumnType::Int2 => row
            .try_get::<_, Option<i16>>(idx)
            .with_context(context)?
            .map(i64::from)
            .into(),
        ColumnType::Int4 => row
            .try_get::<_, Option<i32>>(idx)
            .with_context(context)?
            .map(i64::from)
            .into(),
        ColumnType::Int8 => row.try_get::<_, Option<i64>>(idx).with_context(context)?.into(),
        ColumnType::Float4 => row
            .try_get::<_, Option<f32>>(idx)
            .with_context(context)?
            .map(f64::from)
            .into(),
        ColumnType::Float8 => row.try_get::<_, Option<f64>>(idx).with_context(context)?.into(),
        ColumnType::Bool => row.try_get::<_, Option<bool>>(idx).with_context(context)?.into(),
        ColumnType::Text => row
            .try_get::<_, Option<String>>(idx)
            .with_context(context)?
            .into(),
    };
    Ok(value)
}

fn read_identity(row: &Row, idx: usize, schema: &Schema, column: ColumnType) -> Result<RecordId> {
    match read_value(row, idx, schema.identity(), column)? {
        Value::Int(id) => Ok(id),
        _ => Err(SyncError::MissingIdentity {
            table: schema.table().to_string(),
        }),
    }
}

/// Integrity-constraint errors (SQLSTATE class 23) become `SyncError::Constraint`.
fn map_pg_error(err: tokio_postgres::Error, context: String) -> SyncError {
    if let Some(state) = err.code() {
        if state.code().starts_with("23") {
            let detail = err
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| err.to_string());
            return SyncError::Constraint(format!("{}: {}", context, detail));
        }
    }
    SyncError::Storage(anyhow::Error::new(err).context(context))
}

fn as_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|v| v.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Records stored in PostgreSQL tables of one schema (default `public`).
pub struct PostgresStorage {
    client: Mutex<Client>,
    schema_name: String,
}

impl PostgresStorage {
    pub fn new(client: Client) -> Self {
        Self::with_schema(client, "public")
    }

    pub fn with_schema(client: Client, schema_name: &str) -> Self {
        Self {
            client: Mutex::new(client),
            schema_name: schema_name.to_string(),
        }
    }

    /// Connect to `url` and use the `public` schema.
    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(connect(url).await?))
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    /// Exclusive access to the underlying client, e.g. for setup queries.
    pub async fn client(&self) -> MutexGuard<'_, Client> {
        self.client.lock().await
    }

    fn qualified_table(&self, schema: &Schema) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.schema_name),
            quote_ident(schema.table())
        )
    }

    fn validate(&self, schema: &Schema) -> Result<()> {
        validate_identifier(&self.schema_name).context("Invalid PostgreSQL schema name")?;
        validate_schema_identifiers(schema)?;
        Ok(())
    }

    async fn column_types(&self, client: &Client, schema: &Schema) -> Result<ColumnTypes> {
        let columns = get_table_columns(client, &self.schema_name, schema.table()).await?;
        if columns.is_empty() {
            return Err(SyncError::Storage(anyhow::anyhow!(
                "Table {}.{} does not exist",
                self.schema_name,
                schema.table()
            )));
        }
        let mut types = HashMap::new();
        for (name, data_type) in columns {
            if !schema.knows(&name) {
                continue;
            }
            let column = ColumnType::parse(&data_type).ok_or_else(|| SyncError::InvalidValue {
                field: name.clone(),
                reason: format!("unsupported column type '{}'", data_type),
            })?;
            types.insert(name, column);
        }
        Ok(ColumnTypes {
            table: schema.table().to_string(),
            types,
        })
    }
}

/// Open a TLS-capable connection and drive it on a background task.
pub async fn connect(url: &str) -> Result<Client> {
    let connector = native_tls::TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let tls = postgres_native_tls::MakeTlsConnector::new(connector);
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .context("Failed to connect to PostgreSQL")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Column names and data types of a table in ordinal order.
pub async fn get_table_columns(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<(String, String)>> {
    let rows = client
        .query(
            "SELECT column_name, data_type
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
            &[&schema, &table],
        )
        .await
        .map_err(|e| map_pg_error(e, format!("Failed to get columns for {}.{}", schema, table)))?;

    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let dtype: String = row.get(1);
            (name, dtype)
        })
        .collect())
}

fn column_list(schema: &Schema) -> Vec<String> {
    std::iter::once(schema.identity())
        .chain(schema.fields().iter().map(String::as_str))
        .map(quote_ident)
        .collect()
}

fn build_select_query(table: &str, schema: &Schema, where_clause: Option<&str>) -> String {
    let mut query = format!("SELECT {} FROM {}", column_list(schema).join(", "), table);
    if let Some(clause) = where_clause {
        query.push_str(" WHERE ");
        query.push_str(clause);
    }
    query.push_str(&format!(" ORDER BY {}", quote_ident(schema.identity())));
    query
}

/// Build a multi-row insert. Rows whose `has_identity` flag is false get
/// `DEFAULT` in the identity position and bind one parameter fewer.
///
/// ```sql
/// INSERT INTO "public"."t" ("id", "a") VALUES (DEFAULT, $1), ($2, $3) RETURNING "id"
/// ```
fn build_insert_query(table: &str, schema: &Schema, has_identity: &[bool]) -> String {
    let mut next = 0usize;
    let mut placeholder = || {
        next += 1;
        format!("${}", next)
    };
    let value_rows: Vec<String> = has_identity
        .iter()
        .map(|&with_id| {
            let mut cells = Vec::with_capacity(schema.fields().len() + 1);
            cells.push(if with_id {
                placeholder()
            } else {
                "DEFAULT".to_string()
            });
            for _ in schema.fields() {
                cells.push(placeholder());
            }
            format!("({})", cells.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {} RETURNING {}",
        table,
        column_list(schema).join(", "),
        value_rows.join(", "),
        quote_ident(schema.identity())
    )
}

/// ```sql
/// UPDATE "public"."t" AS "_sync_target" SET "age" = "_sync_values"."age"
/// FROM (VALUES ($1::int8, $2::int4), ($3::int8, $4::int4)) AS "_sync_values"("id", "age")
/// WHERE "_sync_target"."id" = "_sync_values"."id"
/// ```
fn build_update_query(
    table: &str,
    schema: &Schema,
    fields: &[String],
    casts: &[&str],
    num_rows: usize,
) -> String {
    let identity = quote_ident(schema.identity());
    let values = quote_ident(VALUES_ALIAS);
    let target = quote_ident(TARGET_ALIAS);
    let num_cols = casts.len();

    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let cells: Vec<String> = casts
                .iter()
                .enumerate()
                .map(|(col_idx, cast)| format!("${}::{}", row_idx * num_cols + col_idx + 1, cast))
                .collect();
            format!("({})", cells.join(", "))
        })
        .collect();
    let alias_columns: Vec<String> = std::iter::once(identity.clone())
        .chain(fields.iter().map(|f| quote_ident(f)))
        .collect();
    let assignments: Vec<String> = fields
        .iter()
        .map(|f| format!("{} = {}.{}", quote_ident(f), values, quote_ident(f)))
        .collect();

    format!(
        "UPDATE {} AS {} SET {} FROM (VALUES {}) AS {}({}) WHERE {}.{} = {}.{}",
        table,
        target,
        assignments.join(", "),
        value_rows.join(", "),
        values,
        alias_columns.join(", "),
        target,
        identity,
        values,
        identity
    )
}

fn build_delete_query(table: &str, schema: &Schema, num_rows: usize) -> String {
    let placeholders: Vec<String> = (1..=num_rows).map(|i| format!("${}", i)).collect();
    format!(
        "DELETE FROM {} WHERE {} IN ({})",
        table,
        quote_ident(schema.identity()),
        placeholders.join(", ")
    )
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn load(&self, schema: &Schema, scope: Option<&Filter>) -> Result<Vec<Record>> {
        self.validate(schema)?;
        let client = self.client.lock().await;
        let types = self.column_types(&client, schema).await?;

        let mut bound = Vec::new();
        let where_clause = scope.map(|f| f.to_sql(&mut bound, &|i| format!("${}", i)));
        let params = bound
            .iter()
            .map(|p| to_param(&p.field, types.get(&p.field)?, &p.value))
            .collect::<Result<Vec<Param>>>()?;
        let query = build_select_query(&self.qualified_table(schema), schema, where_clause.as_deref());

        let rows = client
            .query(query.as_str(), &as_refs(&params))
            .await
            .map_err(|e| map_pg_error(e, format!("Failed to load records from {}", schema.table())))?;

        let identity_type = types.get(schema.identity())?;
        let field_types = schema
            .fields()
            .iter()
            .map(|f| types.get(f))
            .collect::<Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = Record::with_id(read_identity(row, 0, schema, identity_type)?);
            for (idx, (field, column)) in schema.fields().iter().zip(&field_types).enumerate() {
                record.set(field, read_value(row, idx + 1, field, *column)?);
            }
            records.push(record);
        }

        tracing::debug!(
            "Loaded {} rows from {}.{}",
            records.len(),
            self.schema_name,
            schema.table()
        );
        Ok(records)
    }

    async fn insert(&self, schema: &Schema, records: &[Record]) -> Result<Vec<RecordId>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.validate(schema)?;
        let mut client = self.client.lock().await;
        let types = self.column_types(&client, schema).await?;
        let identity_type = types.get(schema.identity())?;
        let field_types = schema
            .fields()
            .iter()
            .map(|f| types.get(f))
            .collect::<Result<Vec<_>>>()?;
        let table = self.qualified_table(schema);
        let context = || format!("Failed to insert records into {}", schema.table());

        let per_statement = rows_per_statement(schema.fields().len() + 1, MAX_PARAMS);
        let tx = client
            .transaction()
            .await
            .map_err(|e| map_pg_error(e, context()))?;
        let mut ids = Vec::with_capacity(records.len());
        for chunk in records.chunks(per_statement) {
            let has_identity: Vec<bool> = chunk.iter().map(|r| r.id.is_some()).collect();
            let mut params: Vec<Param> = Vec::new();
            for record in chunk {
                if let Some(id) = record.id {
                    params.push(to_param(schema.identity(), identity_type, &Value::Int(id))?);
                }
                for (field, column) in schema.fields().iter().zip(&field_types) {
                    params.push(to_param(field, *column, record.value(field))?);
                }
            }
            let query = build_insert_query(&table, schema, &has_identity);
            let rows = tx
                .query(query.as_str(), &as_refs(&params))
                .await
                .map_err(|e| map_pg_error(e, context()))?;
            for row in &rows {
                ids.push(read_identity(row, 0, schema, identity_type)?);
            }
        }
        tx.commit().await.map_err(|e| map_pg_error(e, context()))?;
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
        self.validate(schema)?;
        let mut client = self.client.lock().await;
        let types = self.column_types(&client, schema).await?;
        let identity_type = types.get(schema.identity())?;
        let field_types = fields
            .iter()
            .map(|f| types.get(f))
            .collect::<Result<Vec<_>>>()?;
        let casts: Vec<&str> = std::iter::once(identity_type.cast())
            .chain(field_types.iter().map(|t| t.cast()))
            .collect();
        let table = self.qualified_table(schema);
        let context = || format!("Failed to update records in {}", schema.table());

        let per_statement = rows_per_statement(fields.len() + 1, MAX_PARAMS);
        let tx = client
            .transaction()
            .await
            .map_err(|e| map_pg_error(e, context()))?;
        let mut written = 0u64;
        for chunk in rows.chunks(per_statement) {
            let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * casts.len());
            for (id, record) in chunk {
                params.push(to_param(schema.identity(), identity_type, &Value::Int(*id))?);
                for (field, column) in fields.iter().zip(&field_types) {
                    params.push(to_param(field, *column, record.value(field))?);
                }
            }
            let query = build_update_query(&table, schema, fields, &casts, chunk.len());
            written += tx
                .execute(query.as_str(), &as_refs(&params))
                .await
                .map_err(|e| map_pg_error(e, context()))?;
        }
        tx.commit().await.map_err(|e| map_pg_error(e, context()))?;
        Ok(written)
    }

    async fn delete(&self, schema: &Schema, ids: &[RecordId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.validate(schema)?;
        let mut client = self.client.lock().await;
        let types = self.column_types(&client, schema).await?;
        let identity_type = types.get(schema.identity())?;
        let table = self.qualified_table(schema);
        let context = || format!("Failed to delete records from {}", schema.table());

        let tx = client
            .transaction()
            .await
            .map_err(|e| map_pg_error(e, context()))?;
        let mut deleted = 0u64;
        for chunk in ids.chunks(MAX_PARAMS) {
            let params = chunk
                .iter()
                .map(|id| to_param(schema.identity(), identity_type, &Value::Int(*id)))
                .collect::<Result<Vec<Param>>>()?;
            let query = build_delete_query(&table, schema, chunk.len());
            deleted += tx
                .execute(query.as_str(), &as_refs(&params))
                .await
                .map_err(|e| map_pg_error(e, context()))?;
        }
        tx.commit().await.map_err(|e| map_pg_error(e, context()))?;
        Ok(deleted)
    }

    async fn normalize(&self, schema: &Schema, records: &mut [Record]) -> Result<()> {
        self.validate(schema)?;
        let client = self.client.lock().await;
        let types = self.column_types(&client, schema).await?;
        let field_types = schema
            .fields()
            .iter()
            .map(|f| types.get(f))
            .collect::<Result<Vec<_>>>()?;

        for record in records.iter_mut() {
            for (field, column) in schema.fields().iter().zip(&field_types) {
                if let Some(value) = record.get(field) {
                    let coerced = column.coerce(value.clone());
                    record.set(field, coerced);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employees() -> Schema {
        Schema::new("employees", "id", ["name", "age"]).unwrap()
    }

    const TABLE: &str = "\"public\".\"employees\"";

    #[test]
    fn test_column_type_parse() {
        assert_eq!(ColumnType::parse("integer"), Some(ColumnType::Int4));
        assert_eq!(ColumnType::parse("character varying"), Some(ColumnType::Text));
        assert_eq!(ColumnType::parse("double precision"), Some(ColumnType::Float8));
        assert_eq!(ColumnType::parse("jsonb"), None);
    }

    #[test]
    fn test_to_param_checks_kind_and_range() {
        assert!(to_param("age", ColumnType::Int4, &Value::Int(41)).is_ok());
        assert!(to_param("age", ColumnType::Int4, &Value::Null).is_ok());
        assert!(to_param("age", ColumnType::Float8, &Value::Int(3)).is_ok());
        assert!(matches!(
            to_param("age", ColumnType::Int2, &Value::Int(70_000)),
            Err(SyncError::InvalidValue { .. })
        ));
        assert!(matches!(
            to_param("age", ColumnType::Int4, &Value::from("forty")),
            Err(SyncError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_coerce_matches_column_precision() {
        assert_eq!(
            ColumnType::Float4.coerce(Value::Float(1.1)),
            Value::Float(f64::from(1.1f32))
        );
        assert_eq!(ColumnType::Float4.coerce(Value::Int(3)), Value::Float(3.0));
        assert_eq!(ColumnType::Float8.coerce(Value::Int(3)), Value::Float(3.0));
        assert_eq!(ColumnType::Float8.coerce(Value::Float(1.1)), Value::Float(1.1));
        assert_eq!(ColumnType::Int4.coerce(Value::Int(3)), Value::Int(3));
        assert_eq!(ColumnType::Bool.coerce(Value::Null), Value::Null);
    }

    #[test]
    fn test_build_select_query() {
        assert_eq!(
            build_select_query(TABLE, &employees(), Some("\"age\" = $1")),
            "SELECT \"id\", \"name\", \"age\" FROM \"public\".\"employees\" WHERE \"age\" = $1 ORDER BY \"id\""
        );
    }

    #[test]
    fn test_build_insert_query_mixes_default_and_preassigned() {
        let query = build_insert_query(TABLE, &employees(), &[false, true]);
        assert_eq!(
            query,
            "INSERT INTO \"public\".\"employees\" (\"id\", \"name\", \"age\") VALUES (DEFAULT, $1, $2), ($3, $4, $5) RETURNING \"id\""
        );
    }

    #[test]
    fn test_build_update_query() {
        let query = build_update_query(
            TABLE,
            &employees(),
            &["age".to_string()],
            &["int4", "int4"],
            2,
        );
        assert_eq!(
            query,
            "UPDATE \"public\".\"employees\" AS \"_sync_target\" SET \"age\" = \"_sync_values\".\"age\" \
             FROM (VALUES ($1::int4, $2::int4), ($3::int4, $4::int4)) AS \"_sync_values\"(\"id\", \"age\") \
             WHERE \"_sync_target\".\"id\" = \"_sync_values\".\"id\""
        );
    }

    #[test]
    fn test_build_delete_query() {
        assert_eq!(
            build_delete_query(TABLE, &employees(), 2),
            "DELETE FROM \"public\".\"employees\" WHERE \"id\" IN ($1, $2)"
        );
    }
}
