//! SQL text assembly for conditions tables.
//!
//! Every function here is pure: table and column names are validated as plain identifiers and
//! values are rendered as escaped literals, so the output can be executed directly.

use itertools::Itertools;

use crate::{
    data::{FieldValue, FieldValueMap},
    models::TableMetaData,
    ConditionsError, ConditionsResult, Id,
};

fn check_identifier(name: &str) -> ConditionsResult<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(ConditionsError::InvalidIdentifier(name.to_string()))
    }
}

fn check_identifiers<'a>(names: &[&'a str]) -> ConditionsResult<Vec<&'a str>> {
    names.iter().copied().map(check_identifier).collect()
}

/// `SELECT <fields> FROM <table>`, with an optional `WHERE collection_id = <id>` and ordering.
pub fn build_select(
    table: &str,
    collection_id: Option<Id>,
    fields: &[&str],
    order_by: Option<&str>,
) -> ConditionsResult<String> {
    let table = check_identifier(table)?;
    let columns = if fields.is_empty() {
        "*".to_string()
    } else {
        check_identifiers(fields)?.join(", ")
    };
    let mut sql = format!("SELECT {columns} FROM {table}");
    if let Some(id) = collection_id {
        sql.push_str(&format!(" WHERE collection_id = {id}"));
    }
    if let Some(order_by) = order_by {
        sql.push_str(&format!(" ORDER BY {}", check_identifier(order_by)?));
    }
    Ok(sql)
}

/// One `INSERT` statement with literal values.
pub fn build_insert(table: &str, fields: &[&str], values: &[FieldValue]) -> ConditionsResult<String> {
    let table = check_identifier(table)?;
    if fields.is_empty() {
        return Err(ConditionsError::EmptyFieldList(table.to_string()));
    }
    if fields.len() != values.len() {
        return Err(ConditionsError::FieldCountMismatch {
            fields: fields.len(),
            values: values.len(),
        });
    }
    Ok(format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        check_identifiers(fields)?.join(", "),
        values.iter().map(FieldValue::to_sql_literal).join(", ")
    ))
}

/// `UPDATE <table> SET ... WHERE id = <id>`.
pub fn build_update(
    table: &str,
    row_id: Id,
    fields: &[&str],
    values: &[FieldValue],
) -> ConditionsResult<String> {
    let table = check_identifier(table)?;
    if fields.is_empty() {
        return Err(ConditionsError::EmptyFieldList(table.to_string()));
    }
    if fields.len() != values.len() {
        return Err(ConditionsError::FieldCountMismatch {
            fields: fields.len(),
            values: values.len(),
        });
    }
    let assignments = check_identifiers(fields)?
        .into_iter()
        .zip(values)
        .map(|(field, value)| format!("{field} = {}", value.to_sql_literal()))
        .join(", ");
    Ok(format!("UPDATE {table} SET {assignments} WHERE id = {row_id}"))
}

/// `DELETE` of one row by id.
pub fn build_delete(table: &str, row_id: Id) -> ConditionsResult<String> {
    Ok(format!(
        "DELETE FROM {} WHERE id = {row_id}",
        check_identifier(table)?
    ))
}

/// A parameterized `INSERT` for one row, with `?N` placeholders in field order.
///
/// Grouped tables get a leading `collection_id` placeholder, so the values bound must be the
/// collection id followed by the row's values.
pub fn build_prepared_insert(
    table: &str,
    grouped: bool,
    values: &FieldValueMap,
) -> ConditionsResult<String> {
    let table = check_identifier(table)?;
    if values.is_empty() {
        return Err(ConditionsError::EmptyFieldList(table.to_string()));
    }
    let mut columns = Vec::with_capacity(values.len() + 1);
    if grouped {
        columns.push("collection_id");
    }
    for name in values.names() {
        columns.push(check_identifier(name)?);
    }
    let placeholders = (1..=columns.len()).map(|i| format!("?{i}")).join(", ");
    Ok(format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    ))
}

/// Selects the rows of one or more collections, id first, in ascending id order.
///
/// A single id binds as `?1`; several ids are inlined into an `IN` list.
pub fn build_collection_select(
    meta: &TableMetaData,
    collection_ids: &[Id],
) -> ConditionsResult<String> {
    let table = check_identifier(meta.table_name())?;
    let mut columns = vec!["id"];
    for name in meta.field_names() {
        columns.push(check_identifier(name)?);
    }
    let filter = match collection_ids {
        [] => return Err(ConditionsError::EmptyFieldList(table.to_string())),
        [_] => "collection_id = ?1".to_string(),
        ids => format!("collection_id IN ({})", ids.iter().join(", ")),
    };
    Ok(format!(
        "SELECT {} FROM {table} WHERE {filter} ORDER BY id ASC",
        columns.join(", ")
    ))
}

/// Next free collection id of a table: one more than the largest in use, or 1 when empty.
pub fn build_next_collection_id(table: &str) -> ConditionsResult<String> {
    Ok(format!(
        "SELECT COALESCE(MAX(collection_id), 0) + 1 FROM {}",
        check_identifier(table)?
    ))
}

/// Existence check for a collection id, bound as `?1`.
pub fn build_collection_exists(table: &str) -> ConditionsResult<String> {
    Ok(format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE collection_id = ?1)",
        check_identifier(table)?
    ))
}

/// `CREATE TABLE IF NOT EXISTS` for the table described by `meta`.
pub fn build_create_table(meta: &TableMetaData) -> ConditionsResult<String> {
    let table = check_identifier(meta.table_name())?;
    let mut columns = vec!["id INTEGER PRIMARY KEY".to_string()];
    if meta.is_grouped() {
        columns.push("collection_id INTEGER NOT NULL".to_string());
    }
    for field in meta.fields() {
        columns.push(format!(
            "{} {}",
            check_identifier(field.name())?,
            field.field_type().sql_type()
        ));
    }
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {table} ({})",
        columns.join(", ")
    ))
}
