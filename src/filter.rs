// ABOUTME: Scope predicate selecting which persisted records take part in a sync
// ABOUTME: Evaluates in memory and renders parameterized SQL WHERE fragments for backends

use std::cmp::Ordering;

use crate::error::{Result, SyncError};
use crate::record::{Record, Value};
use crate::schema::Schema;

/// A predicate over the fields of one record type.
///
/// Comparisons follow SQL semantics: any comparison with `Null` is false,
/// use [`Filter::IsNull`] to match missing values.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

/// A bind parameter collected while rendering SQL, tagged with the field it
/// is compared against so backends can pick the column's type.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    /// Conjunction of equalities.
    pub fn all_eq<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Filter::And(
            pairs
                .into_iter()
                .map(|(k, v)| Filter::Eq(k.into(), v.into()))
                .collect(),
        )
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    /// Check that every referenced field exists on `schema`.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        match self {
            Filter::Eq(f, _)
            | Filter::Ne(f, _)
            | Filter::Lt(f, _)
            | Filter::Le(f, _)
            | Filter::Gt(f, _)
            | Filter::Ge(f, _)
            | Filter::In(f, _)
            | Filter::IsNull(f) => {
                if schema.knows(f) {
                    Ok(())
                } else {
                    Err(SyncError::unknown_field(f, schema.table()))
                }
            }
            Filter::And(parts) | Filter::Or(parts) => {
                parts.iter().try_for_each(|p| p.validate(schema))
            }
            Filter::Not(inner) => inner.validate(schema),
        }
    }

    pub fn matches(&self, schema: &Schema, record: &Record) -> bool {
        let cmp = |field: &str, value: &Value| record.lookup(schema, field).sql_cmp(value);
        match self {
            Filter::Eq(f, v) => cmp(f, v) == Some(Ordering::Equal),
            Filter::Ne(f, v) => matches!(cmp(f, v), Some(o) if o != Ordering::Equal),
            Filter::Lt(f, v) => cmp(f, v) == Some(Ordering::Less),
            Filter::Le(f, v) => matches!(cmp(f, v), Some(Ordering::Less | Ordering::Equal)),
            Filter::Gt(f, v) => cmp(f, v) == Some(Ordering::Greater),
            Filter::Ge(f, v) => matches!(cmp(f, v), Some(Ordering::Greater | Ordering::Equal)),
            Filter::In(f, values) => values.iter().any(|v| cmp(f, v) == Some(Ordering::Equal)),
            Filter::IsNull(f) => record.lookup(schema, f).is_null(),
            Filter::And(parts) => parts.iter().all(|p| p.matches(schema, record)),
            Filter::Or(parts) => parts.iter().any(|p| p.matches(schema, record)),
            Filter::Not(inner) => !inner.matches(schema, record),
        }
    }

    /// Render a WHERE fragment. `placeholder` receives the 1-based position
    /// of each bind parameter and returns its SQL spelling (`?1`, `$1`).
    pub fn to_sql(
        &self,
        params: &mut Vec<BoundParam>,
        placeholder: &dyn Fn(usize) -> String,
    ) -> String {
        let bind = |field: &str, value: &Value, params: &mut Vec<BoundParam>| {
            params.push(BoundParam {
                field: field.to_string(),
                value: value.clone(),
            });
            placeholder(params.len())
        };
        let binary = |op: &str, field: &str, value: &Value, params: &mut Vec<BoundParam>| {
            let ph = bind(field, value, params);
            format!("{} {} {}", crate::utils::quote_ident(field), op, ph)
        };

        match self {
            Filter::Eq(f, v) => binary("=", f, v, params),
            Filter::Ne(f, v) => binary("<>", f, v, params),
            Filter::Lt(f, v) => binary("<", f, v, params),
            Filter::Le(f, v) => binary("<=", f, v, params),
            Filter::Gt(f, v) => binary(">", f, v, params),
            Filter::Ge(f, v) => binary(">=", f, v, params),
            Filter::In(_, values) if values.is_empty() => "1=0".to_string(),
            Filter::In(f, values) => {
                let placeholders: Vec<String> =
                    values.iter().map(|v| bind(f, v, params)).collect();
                format!(
                    "{} IN ({})",
                    crate::utils::quote_ident(f),
                    placeholders.join(", ")
                )
            }
            Filter::IsNull(f) => format!("{} IS NULL", crate::utils::quote_ident(f)),
            Filter::And(parts) if parts.is_empty() => "1=1".to_string(),
            Filter::Or(parts) if parts.is_empty() => "1=0".to_string(),
            Filter::And(parts) => join_parts(parts, " AND ", params, placeholder),
            Filter::Or(parts) => join_parts(parts, " OR ", params, placeholder),
            Filter::Not(inner) => format!("NOT ({})", inner.to_sql(params, placeholder)),
        }
    }
}

fn join_parts(
    parts: &[Filter],
    separator: &str,
    params: &mut Vec<BoundParam>,
    placeholder: &dyn Fn(usize) -> String,
) -> String {
    let rendered: Vec<String> = parts
        .iter()
        .map(|p| format!("({})", p.to_sql(params, placeholder)))
        .collect();
    rendered.join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employees() -> Schema {
        Schema::new("employees", "id", ["name", "age", "company_id"]).unwrap()
    }

    fn sqlite_placeholder(i: usize) -> String {
        format!("?{}", i)
    }

    #[test]
    fn test_matches_equality_and_identity() {
        let schema = employees();
        let record = Record::with_id(4).with("name", "Bob").with("company_id", 2);
        assert!(Filter::eq("company_id", 2).matches(&schema, &record));
        assert!(!Filter::eq("company_id", 1).matches(&schema, &record));
        assert!(Filter::eq("id", 4).matches(&schema, &record));
    }

    #[test]
    fn test_null_comparisons_are_false() {
        let schema = employees();
        let record = Record::with_id(1).with("name", "Zoe");
        assert!(!Filter::eq("age", Value::Null).matches(&schema, &record));
        assert!(!Filter::Ne("age".into(), Value::Int(3)).matches(&schema, &record));
        assert!(Filter::IsNull("age".into()).matches(&schema, &record));
    }

    #[test]
    fn test_composite_filters() {
        let schema = employees();
        let record = Record::with_id(1).with("age", 9).with("company_id", 1);
        let filter = Filter::eq("company_id", 1).and(Filter::Ge("age".into(), Value::Int(9)));
        assert!(filter.matches(&schema, &record));
        assert!(!Filter::Not(Box::new(filter)).matches(&schema, &record));
        assert!(Filter::In("age".into(), vec![Value::Int(1), Value::Int(9)]).matches(&schema, &record));
        assert!(Filter::And(vec![]).matches(&schema, &record));
        assert!(!Filter::Or(vec![]).matches(&schema, &record));
    }

    #[test]
    fn test_validate_rejects_unknown_field() {
        let schema = employees();
        let filter = Filter::eq("company_id", 1).and(Filter::eq("salary", 3));
        assert!(matches!(
            filter.validate(&schema),
            Err(SyncError::UnknownField { ref field, .. }) if field == "salary"
        ));
        assert!(Filter::eq("id", 1).validate(&schema).is_ok());
    }

    #[test]
    fn test_to_sql_numbers_placeholders_in_order() {
        let filter = Filter::all_eq([("company_id", Value::Int(1)), ("name", Value::from("Bob"))])
            .and(Filter::In("age".into(), vec![Value::Int(9), Value::Int(10)]));
        let mut params = Vec::new();
        let sql = filter.to_sql(&mut params, &sqlite_placeholder);
        assert_eq!(
            sql,
            "(\"company_id\" = ?1) AND (\"name\" = ?2) AND (\"age\" IN (?3, ?4))"
        );
        assert_eq!(params.len(), 4);
        assert_eq!(params[2].field, "age");
        assert_eq!(params[3].value, Value::Int(10));
    }

    #[test]
    fn test_to_sql_empty_groups() {
        let mut params = Vec::new();
        assert_eq!(Filter::And(vec![]).to_sql(&mut params, &sqlite_placeholder), "1=1");
        assert_eq!(Filter::Or(vec![]).to_sql(&mut params, &sqlite_placeholder), "1=0");
        assert_eq!(
            Filter::In("age".into(), vec![]).to_sql(&mut params, &sqlite_placeholder),
            "1=0"
        );
        assert!(params.is_empty());
    }
}
