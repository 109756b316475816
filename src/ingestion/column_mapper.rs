//! Sheet row → typed record mapping
//!
//! Columns are resolved by exact header text. Coercion never fails: a value
//! that does not parse as its declared type is kept as the original string.

use crate::query::value::date_value;
use crate::store::{ColumnMapping, DataType};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Date formats tried in order when coercing `date` columns
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y", "%m-%d-%Y"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("Required column '{column}' for field '{system_field}' not found in sheet")]
    MissingRequiredColumn { column: String, system_field: String },

    #[error("Duplicate system_field '{0}' in column mappings")]
    DuplicateSystemField(String),
}

fn column_index(sheet_column: &str, headers: &[String]) -> Option<usize> {
    headers.iter().position(|header| header == sheet_column)
}

/// Map one row to `{system_field: typed value}`
pub fn map_row(
    row: &[String],
    headers: &[String],
    mappings: &[ColumnMapping],
) -> Result<Map<String, Value>, MappingError> {
    let mut result = Map::new();

    for mapping in mappings {
        let Some(index) = column_index(&mapping.sheet_column, headers) else {
            if mapping.required {
                return Err(MappingError::MissingRequiredColumn {
                    column: mapping.sheet_column.clone(),
                    system_field: mapping.system_field.clone(),
                });
            }
            continue;
        };

        let cell = row.get(index).map(String::as_str).unwrap_or("");
        result.insert(mapping.system_field.clone(), coerce_value(cell, mapping.data_type));
    }

    Ok(result)
}

/// Convert a cell to `data_type`, falling back to the original text
pub fn coerce_value(value: &str, data_type: DataType) -> Value {
    if value.is_empty() {
        return Value::String(String::new());
    }

    let coerced = match data_type {
        DataType::String => None,
        DataType::Number => parse_decimal(value)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        DataType::Integer => parse_decimal(value)
            .filter(|n| n.is_finite())
            .map(|n| Value::from(n.trunc() as i64)),
        DataType::Date => parse_date(value)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| date_value(&dt)),
    };

    coerced.unwrap_or_else(|| Value::String(value.to_string()))
}

/// Comma is accepted as the decimal separator
fn parse_decimal(value: &str) -> Option<f64> {
    value.trim().replace(',', ".").parse::<f64>().ok()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

/// Untransformed `{header: cell}` record; cells past the row's end are empty
pub fn get_raw_data(row: &[String], headers: &[String]) -> Map<String, Value> {
    headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let cell = row.get(i).cloned().unwrap_or_default();
            (header.clone(), Value::String(cell))
        })
        .collect()
}

/// Fail fast before any rows are fetched
pub fn validate_required_columns(headers: &[String], mappings: &[ColumnMapping]) -> Result<(), MappingError> {
    for mapping in mappings.iter().filter(|m| m.required) {
        if column_index(&mapping.sheet_column, headers).is_none() {
            return Err(MappingError::MissingRequiredColumn {
                column: mapping.sheet_column.clone(),
                system_field: mapping.system_field.clone(),
            });
        }
    }
    Ok(())
}

pub fn validate_mappings(mappings: &[ColumnMapping]) -> Result<(), MappingError> {
    let mut seen = HashSet::new();
    for mapping in mappings {
        if !seen.insert(mapping.system_field.as_str()) {
            return Err(MappingError::DuplicateSystemField(mapping.system_field.clone()));
        }
    }
    Ok(())
}

pub fn is_column_letter(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphabetic())
}

/// `A` → 0, `Z` → 25, `AA` → 26
pub fn column_letter_to_index(letter: &str) -> Option<usize> {
    if !is_column_letter(letter) {
        return None;
    }
    let number = letter
        .to_ascii_uppercase()
        .bytes()
        .try_fold(0usize, |acc, b| acc.checked_mul(26)?.checked_add(usize::from(b - b'A' + 1)))?;
    Some(number - 1)
}

/// 0 → `A`, 25 → `Z`, 26 → `AA`
pub fn index_to_column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}
