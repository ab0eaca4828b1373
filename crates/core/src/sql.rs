use thiserror::Error;

use crate::query_spec::{QuerySpec, SortOrder};
use crate::value::Value;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlRenderError {
    #[error("database name cannot be empty")]
    EmptyDatabaseName,
    #[error("table name cannot be empty")]
    EmptyTableName,
    #[error("column name cannot be empty")]
    EmptyColumnName,
    #[error("a key-targeted statement requires at least one key column")]
    EmptyKey,
    #[error("an insert requires at least one column")]
    NoInsertColumns,
}

/// A validated database/table pair used by every rendered statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef<'a> {
    pub database: Option<&'a str>,
    pub table: &'a str,
}

impl<'a> TableRef<'a> {
    pub fn new(database: Option<&'a str>, table: &'a str) -> Result<Self, SqlRenderError> {
        if table.trim().is_empty() {
            return Err(SqlRenderError::EmptyTableName);
        }
        if let Some(database_name) = database {
            if database_name.trim().is_empty() {
                return Err(SqlRenderError::EmptyDatabaseName);
            }
        }
        Ok(Self { database, table })
    }

    pub fn from_spec(spec: &'a QuerySpec) -> Result<Self, SqlRenderError> {
        Self::new(spec.database.as_deref(), &spec.table)
    }
}

#[must_use]
pub fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

fn quote_sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a cell value as a SQL literal for the text protocol.
#[must_use]
pub fn value_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(value) => value.to_string(),
        Value::Float(value) => value.to_string(),
        Value::Text(value) => quote_sql_string(value),
        Value::Bytes(bytes) => {
            let mut rendered = String::with_capacity(2 + bytes.len() * 2);
            rendered.push_str("X'");
            for byte in bytes {
                rendered.push_str(&format!("{byte:02X}"));
            }
            rendered.push('\'');
            rendered
        }
    }
}

fn qualified_table_sql(target: TableRef<'_>) -> String {
    match target.database {
        Some(database) => format!(
            "{}.{}",
            quote_identifier(database),
            quote_identifier(target.table)
        ),
        None => quote_identifier(target.table),
    }
}

fn where_clause(filter: Option<&str>) -> String {
    match filter {
        Some(predicate) => format!(" WHERE {predicate}"),
        None => String::new(),
    }
}

fn order_clause(spec: &QuerySpec) -> String {
    if spec.sort.is_empty() {
        return String::new();
    }
    let keys = spec
        .sort
        .iter()
        .map(|key| {
            let direction = match key.order {
                SortOrder::Ascending => "ASC",
                SortOrder::Descending => "DESC",
            };
            format!("{} {direction}", quote_identifier(&key.column))
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ORDER BY {keys}")
}

/// One window of a filtered, sorted result at an absolute offset.
pub fn page_select_sql(
    spec: &QuerySpec,
    offset: u64,
    limit: usize,
) -> Result<String, SqlRenderError> {
    let target = TableRef::from_spec(spec)?;
    Ok(format!(
        "SELECT * FROM {}{}{} LIMIT {limit} OFFSET {offset}",
        qualified_table_sql(target),
        where_clause(spec.filter.as_deref()),
        order_clause(spec),
    ))
}

/// A row-budgeted count: the inner select stops at `budget + 1` rows, so
/// the statement never scans an arbitrarily large filtered result. A
/// returned count of `budget + 1` means the budget was exhausted and the
/// true total is at least that much.
pub fn bounded_count_sql(spec: &QuerySpec, budget: u64) -> Result<String, SqlRenderError> {
    let target = TableRef::from_spec(spec)?;
    let probe = budget.saturating_add(1);
    Ok(format!(
        "SELECT COUNT(*) FROM (SELECT 1 FROM {}{} LIMIT {probe}) AS bounded_rows",
        qualified_table_sql(target),
        where_clause(spec.filter.as_deref()),
    ))
}

fn key_predicate(key: &[(String, Value)]) -> Result<String, SqlRenderError> {
    if key.is_empty() {
        return Err(SqlRenderError::EmptyKey);
    }
    let clauses = key
        .iter()
        .map(|(column, value)| {
            if column.trim().is_empty() {
                return Err(SqlRenderError::EmptyColumnName);
            }
            let quoted = quote_identifier(column);
            Ok(if value.is_null() {
                format!("{quoted} IS NULL")
            } else {
                format!("{quoted} = {}", value_literal(value))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(clauses.join(" AND "))
}

pub fn update_cell_sql(
    target: TableRef<'_>,
    key: &[(String, Value)],
    column: &str,
    value: &Value,
) -> Result<String, SqlRenderError> {
    if column.trim().is_empty() {
        return Err(SqlRenderError::EmptyColumnName);
    }
    Ok(format!(
        "UPDATE {} SET {} = {} WHERE {} LIMIT 1",
        qualified_table_sql(target),
        quote_identifier(column),
        value_literal(value),
        key_predicate(key)?,
    ))
}

pub fn delete_row_sql(
    target: TableRef<'_>,
    key: &[(String, Value)],
) -> Result<String, SqlRenderError> {
    Ok(format!(
        "DELETE FROM {} WHERE {} LIMIT 1",
        qualified_table_sql(target),
        key_predicate(key)?,
    ))
}

pub fn insert_row_sql(
    target: TableRef<'_>,
    values: &[(String, Value)],
) -> Result<String, SqlRenderError> {
    if values.is_empty() {
        return Err(SqlRenderError::NoInsertColumns);
    }
    let mut columns = Vec::with_capacity(values.len());
    let mut literals = Vec::with_capacity(values.len());
    for (column, value) in values {
        if column.trim().is_empty() {
            return Err(SqlRenderError::EmptyColumnName);
        }
        columns.push(quote_identifier(column));
        literals.push(value_literal(value));
    }
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified_table_sql(target),
        columns.join(", "),
        literals.join(", "),
    ))
}
