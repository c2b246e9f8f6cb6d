// ABOUTME: Identifier validation and quoting shared by the SQL storage backends
// ABOUTME: Table and column names are validated before they are spliced into SQL

use anyhow::{bail, Context, Result};

use crate::schema::Schema;

/// Validate a table, schema or column name for use in SQL statements.
///
/// Identifiers must be 1-63 characters, start with a letter or underscore
/// and contain only letters, digits and underscores.
///
/// # Examples
///
/// ```
/// # use record_sync::utils::validate_identifier;
/// assert!(validate_identifier("employees").is_ok());
/// assert!(validate_identifier("_company_id").is_ok());
/// assert!(validate_identifier("123abc").is_err());
/// assert!(validate_identifier("name\"; DROP TABLE users; --").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if trimmed.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    let mut chars = trimmed.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            bail!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first
            );
        }
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Validate the table, identity and field names of a schema.
pub fn validate_schema_identifiers(schema: &Schema) -> Result<()> {
    validate_identifier(schema.table())
        .with_context(|| format!("Invalid table name '{}'", sanitize_identifier(schema.table())))?;
    validate_identifier(schema.identity()).with_context(|| {
        format!(
            "Invalid identity column for table '{}'",
            sanitize_identifier(schema.table())
        )
    })?;
    for field in schema.fields() {
        validate_identifier(field).with_context(|| {
            format!(
                "Invalid column name in table '{}'",
                sanitize_identifier(schema.table())
            )
        })?;
    }
    Ok(())
}

/// Strip control characters and cap length for display in errors and logs.
///
/// ```
/// # use record_sync::utils::sanitize_identifier;
/// assert_eq!(sanitize_identifier("table\nname"), "tablename");
/// assert_eq!(sanitize_identifier(&"a".repeat(200)).len(), 100);
/// ```
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote an identifier, escaping embedded double quotes.
///
/// ```
/// # use record_sync::utils::quote_ident;
/// assert_eq!(quote_ident("employees"), "\"employees\"");
/// assert_eq!(quote_ident("my\"table"), "\"my\"\"table\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Rows per statement so that `params_per_row * rows` stays under `max_params`.
pub fn rows_per_statement(params_per_row: usize, max_params: usize) -> usize {
    std::cmp::max(1, max_params / std::cmp::max(1, params_per_row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_accepts_plain_names() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("User_Table_2").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_bad_names() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("   ").is_err());
        assert!(validate_identifier("my-table").is_err());
        assert!(validate_identifier("9lives").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_validate_schema_identifiers() {
        let good = Schema::new("employees", "id", ["name", "age"]).unwrap();
        assert!(validate_schema_identifiers(&good).is_ok());

        let bad = Schema::new("employees", "id", ["name", "age; --"]).unwrap();
        let err = validate_schema_identifiers(&bad).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid column name"));
    }

    #[test]
    fn test_rows_per_statement() {
        assert_eq!(rows_per_statement(3, 65000), 21666);
        assert_eq!(rows_per_statement(100_000, 65000), 1);
        assert_eq!(rows_per_statement(0, 10), 10);
    }
}
