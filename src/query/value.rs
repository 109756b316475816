//! Document value helpers: BSON-style ordering, dates, dotted paths
//!
//! Documents are plain `serde_json::Value`s. Dates use the extended-JSON
//! shape `{"$date": "2024-01-15T00:00:00.000Z"}` so they keep their own
//! type bracket when compared.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

pub const DATE_KEY: &str = "$date";
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Comparison order between values of different types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Bracket {
    Null,
    Number,
    String,
    Object,
    Array,
    Bool,
    Date,
}

pub fn date_value(dt: &NaiveDateTime) -> Value {
    json!({ DATE_KEY: dt.format(DATE_FORMAT).to_string() })
}

pub fn as_date(value: &Value) -> Option<NaiveDateTime> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let raw = obj.get(DATE_KEY)?.as_str()?;
    NaiveDateTime::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc).naive_utc()))
}

pub fn is_date_literal(value: &Value) -> bool {
    as_date(value).is_some()
}

pub fn bracket(value: &Value) -> Bracket {
    match value {
        Value::Null => Bracket::Null,
        Value::Number(_) => Bracket::Number,
        Value::String(_) => Bracket::String,
        Value::Array(_) => Bracket::Array,
        Value::Bool(_) => Bracket::Bool,
        Value::Object(_) if is_date_literal(value) => Bracket::Date,
        Value::Object(_) => Bracket::Object,
    }
}

/// Total order over document values (type bracket first, then value)
pub fn compare(a: &Value, b: &Value) -> Ordering {
    let (ba, bb) = (bracket(a), bracket(b));
    if ba != bb {
        return ba.cmp(&bb);
    }

    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            let (x, y) = (as_f64(a).unwrap_or(0.0), as_f64(b).unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            if ba == Bracket::Date {
                return as_date(a).cmp(&as_date(b));
            }
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let ord = kx.cmp(ky).then_with(|| compare(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare(a, b) == Ordering::Equal
}

pub fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Integral results stay integers so counts deserialize as integers
pub fn number_value(n: f64, integral: bool) -> Value {
    if integral && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub fn is_integral(value: &Value) -> bool {
    matches!(value, Value::Number(n) if n.is_i64() || n.is_u64())
}

/// Aggregation truthiness: false, null, 0 and missing are false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => as_f64(value).map(|n| n != 0.0).unwrap_or(false),
        _ => true,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Dotted-path lookup through nested objects (numeric segments index arrays)
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Every value reachable by `path`, descending into arrays along the way
pub fn resolve_all<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect_path(doc, &segments, &mut out);
    out
}

fn collect_path<'a>(current: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(current);
        return;
    };

    match current {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                collect_path(next, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    collect_path(next, rest, out);
                }
            } else {
                for item in items {
                    collect_path(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// Set a dotted path, creating intermediate objects
pub fn set_path(doc: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

pub fn remove_path(doc: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_bracket_order() {
        let date = date_value(
            &NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        );
        let mut values = vec![
            date.clone(),
            json!(true),
            json!([1]),
            json!({"a": 1}),
            json!("abc"),
            json!(3),
            Value::Null,
        ];
        values.sort_by(compare);
        assert_eq!(
            values,
            vec![Value::Null, json!(3), json!("abc"), json!({"a": 1}), json!([1]), json!(true), date]
        );
    }

    #[test]
    fn test_numbers_compare_across_int_and_float() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert_eq!(compare(&json!(2), &json!(10.5)), Ordering::Less);
    }

    #[test]
    fn test_dates_compare_chronologically() {
        let early = json!({"$date": "2024-01-02T00:00:00.000Z"});
        let late = json!({"$date": "2024-01-10T00:00:00Z"});
        assert_eq!(compare(&early, &late), Ordering::Less);
        assert!(as_date(&json!({"$date": "nope"})).is_none());
    }

    #[test]
    fn test_paths() {
        let doc = json!({"data": {"items": [{"v": 1}, {"v": 2}], "name": "x"}});
        assert_eq!(get_path(&doc, "data.name"), Some(&json!("x")));
        assert_eq!(get_path(&doc, "data.items.1.v"), Some(&json!(2)));
        assert_eq!(resolve_all(&doc, "data.items.v"), vec![&json!(1), &json!(2)]);
        assert!(get_path(&doc, "data.missing").is_none());

        let mut map = Map::new();
        set_path(&mut map, "a.b.c", json!(5));
        assert_eq!(Value::Object(map.clone()), json!({"a": {"b": {"c": 5}}}));
        remove_path(&mut map, "a.b.c");
        assert_eq!(Value::Object(map), json!({"a": {"b": {}}}));
    }

    #[test]
    fn test_number_value_keeps_integers() {
        assert_eq!(number_value(4.0, true), json!(4));
        assert_eq!(number_value(4.0, false), json!(4.0));
        assert_eq!(number_value(4.5, true), json!(4.5));
    }
}
