// ABOUTME: Record and Value types shared by the comparator, synchronizer and backends
// ABOUTME: Values have total equality so they can take part in business keys

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Result, SyncError};
use crate::schema::Schema;

/// Storage-assigned identity of a persisted record.
pub type RecordId = i64;

/// A scalar field value.
///
/// Floats compare and hash by bit pattern so that every value is equal to
/// itself; `NaN` therefore matches `NaN` and `0.0` differs from `-0.0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

static NULL: Value = Value::Null;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
        }
    }

    /// Convert a JSON scalar. Arrays and objects are not record values.
    pub fn from_json(value: &JsonValue) -> Option<Value> {
        match value {
            JsonValue::Null => Some(Value::Null),
            JsonValue::Bool(b) => Some(Value::Bool(*b)),
            JsonValue::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .or_else(|| n.as_f64().map(Value::Float)),
            JsonValue::String(s) => Some(Value::Text(s.clone())),
            JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(f.to_string())),
            Value::Text(s) => JsonValue::String(s.clone()),
        }
    }

    /// SQL-style ordering: `None` when either side is null or the kinds
    /// cannot be compared. Ints and floats compare numerically.
    pub fn sql_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A record: an optional identity plus named field values.
///
/// Fields the schema defines but the record never set read as `Null`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub id: Option<RecordId>,
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: RecordId) -> Self {
        Self {
            id: Some(id),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.values.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Value of `field`, or `Null` when the record never set it.
    pub fn value(&self, field: &str) -> &Value {
        self.values.get(field).unwrap_or(&NULL)
    }

    /// Read a field by name, resolving the schema's identity field to `id`.
    pub fn lookup(&self, schema: &Schema, field: &str) -> Value {
        if field == schema.identity() {
            self.id.map(Value::Int).unwrap_or(Value::Null)
        } else {
            self.value(field).clone()
        }
    }

    /// Build a record from a JSON object checked against `schema`.
    ///
    /// The identity field, when present and non-null, must be an integer.
    pub fn from_json(schema: &Schema, object: &serde_json::Map<String, JsonValue>) -> Result<Self> {
        let mut record = Record::new();
        for (name, raw) in object {
            if name == schema.identity() {
                record.id = match raw {
                    JsonValue::Null => None,
                    other => Some(other.as_i64().ok_or_else(|| SyncError::InvalidValue {
                        field: name.clone(),
                        reason: format!("identity must be an integer, got {}", other),
                    })?),
                };
                continue;
            }
            if !schema.has_field(name) {
                return Err(SyncError::unknown_field(name, schema.table()));
            }
            let value = Value::from_json(raw).ok_or_else(|| SyncError::InvalidValue {
                field: name.clone(),
                reason: "nested arrays and objects are not supported".to_string(),
            })?;
            record.values.insert(name.clone(), value);
        }
        Ok(record)
    }

    /// Render as a JSON object with every schema field, identity first.
    pub fn to_json(&self, schema: &Schema) -> JsonValue {
        let mut object = serde_json::Map::new();
        object.insert(
            schema.identity().to_string(),
            self.id.map(JsonValue::from).unwrap_or(JsonValue::Null),
        );
        for field in schema.fields() {
            object.insert(field.clone(), self.value(field).to_json());
        }
        JsonValue::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employees() -> Schema {
        Schema::new("employees", "id", ["name", "age", "company_id"]).unwrap()
    }

    #[test]
    fn test_unset_field_reads_as_null() {
        let record = Record::new().with("name", "Scott");
        assert_eq!(record.value("age"), &Value::Null);
        assert!(record.get("age").is_none());
    }

    #[test]
    fn test_float_equality_is_total() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn test_sql_cmp_with_null_is_unknown() {
        assert_eq!(Value::Null.sql_cmp(&Value::Int(1)), None);
        assert_eq!(
            Value::Int(2).sql_cmp(&Value::Float(1.5)),
            Some(std::cmp::Ordering::Greater)
        );
    }

    #[test]
    fn test_from_json_object() {
        let schema = employees();
        let json = serde_json::json!({"id": 7, "name": "Isaac", "age": 9, "company_id": null});
        let record = Record::from_json(&schema, json.as_object().unwrap()).unwrap();
        assert_eq!(record.id, Some(7));
        assert_eq!(record.value("name"), &Value::from("Isaac"));
        assert_eq!(record.value("company_id"), &Value::Null);
    }

    #[test]
    fn test_from_json_rejects_unknown_field() {
        let schema = employees();
        let json = serde_json::json!({"name": "Isaac", "salary": 10});
        let err = Record::from_json(&schema, json.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, SyncError::UnknownField { ref field, .. } if field == "salary"));
    }

    #[test]
    fn test_from_json_rejects_non_integer_identity() {
        let schema = employees();
        let json = serde_json::json!({"id": "abc", "name": "Isaac"});
        assert!(Record::from_json(&schema, json.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_to_json_includes_identity_and_all_fields() {
        let schema = employees();
        let record = Record::with_id(3).with("name", "Zoe");
        let json = record.to_json(&schema);
        assert_eq!(json["id"], 3);
        assert_eq!(json["name"], "Zoe");
        assert!(json["age"].is_null());
    }

    #[test]
    fn test_lookup_resolves_identity() {
        let schema = employees();
        let record = Record::with_id(11).with("age", 40);
        assert_eq!(record.lookup(&schema, "id"), Value::Int(11));
        assert_eq!(record.lookup(&schema, "age"), Value::Int(40));
    }
}
