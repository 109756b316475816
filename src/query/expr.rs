//! Aggregation expression evaluator
//!
//! Field references (`"$data.amount"`), variables (`"$$ROOT"`, `"$$conn"`),
//! operator objects (`{"$multiply": [...]}`) and literals.

use super::value::{
    as_date, as_f64, compare, get_path, is_date_literal, is_integral, number_value, truthy,
    type_name, values_equal,
};
use super::PipelineError;
use chrono::format::{Item, StrftimeItems};
use serde_json::{Map, Value};
use std::cmp::Ordering;

pub type Vars = Map<String, Value>;

pub fn eval(expr: &Value, doc: &Value, vars: &Vars) -> Result<Value, PipelineError> {
    match expr {
        Value::String(s) if s.starts_with("$$") => resolve_var(&s[2..], doc, vars),
        Value::String(s) if s.starts_with('$') => {
            Ok(get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| eval(item, doc, vars))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) if is_date_literal(expr) => Ok(Value::Object(map.clone())),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((op, args)) = map.iter().next() {
                    if op.starts_with('$') {
                        return apply(op, args, doc, vars);
                    }
                }
            }
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), eval(value, doc, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// True when `expr` is a plain field reference whose path is absent
pub fn is_missing_field(expr: &Value, doc: &Value) -> bool {
    match expr {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
            get_path(doc, &s[1..]).is_none()
        }
        _ => false,
    }
}

fn resolve_var(reference: &str, doc: &Value, vars: &Vars) -> Result<Value, PipelineError> {
    let (name, path) = match reference.split_once('.') {
        Some((name, path)) => (name, Some(path)),
        None => (reference, None),
    };

    let base = match name {
        "ROOT" | "CURRENT" => doc,
        other => vars
            .get(other)
            .ok_or_else(|| PipelineError::Expression(format!("undefined variable '$${}'", other)))?,
    };

    Ok(match path {
        Some(path) => get_path(base, path).cloned().unwrap_or(Value::Null),
        None => base.clone(),
    })
}

fn args_list(args: &Value, doc: &Value, vars: &Vars) -> Result<Vec<Value>, PipelineError> {
    match args {
        Value::Array(items) => items.iter().map(|item| eval(item, doc, vars)).collect(),
        single => Ok(vec![eval(single, doc, vars)?]),
    }
}

fn exactly<const N: usize>(op: &str, values: Vec<Value>) -> Result<[Value; N], PipelineError> {
    let len = values.len();
    values
        .try_into()
        .map_err(|_| PipelineError::Expression(format!("{} expects {} arguments, got {}", op, N, len)))
}

fn apply(op: &str, args: &Value, doc: &Value, vars: &Vars) -> Result<Value, PipelineError> {
    match op {
        "$literal" => Ok(args.clone()),
        "$cond" => cond(args, doc, vars),
        "$dateToString" => date_to_string(args, doc, vars),
        "$and" => {
            for value in args_list(args, doc, vars)? {
                if !truthy(&value) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "$or" => {
            for value in args_list(args, doc, vars)? {
                if truthy(&value) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "$not" => {
            let [value] = exactly::<1>(op, args_list(args, doc, vars)?)?;
            Ok(Value::Bool(!truthy(&value)))
        }
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let [a, b] = exactly::<2>(op, args_list(args, doc, vars)?)?;
            let ord = compare(&a, &b);
            Ok(Value::Bool(match op {
                "$eq" => ord == Ordering::Equal,
                "$ne" => ord != Ordering::Equal,
                "$gt" => ord == Ordering::Greater,
                "$gte" => ord != Ordering::Less,
                "$lt" => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }))
        }
        "$in" => {
            let [needle, haystack] = exactly::<2>(op, args_list(args, doc, vars)?)?;
            let items = haystack.as_array().ok_or_else(|| {
                PipelineError::Expression(format!("$in requires an array, got {}", type_name(&haystack)))
            })?;
            Ok(Value::Bool(items.iter().any(|item| values_equal(item, &needle))))
        }
        "$ifNull" => {
            let values = args_list(args, doc, vars)?;
            let len = values.len();
            let mut iter = values.into_iter();
            let fallback = iter.next_back().unwrap_or(Value::Null);
            if len < 2 {
                return Err(PipelineError::Expression("$ifNull expects at least 2 arguments".into()));
            }
            Ok(iter.find(|v| !v.is_null()).unwrap_or(fallback))
        }
        "$add" | "$multiply" => {
            let values = args_list(args, doc, vars)?;
            let identity = if op == "$add" { 0.0 } else { 1.0 };
            let mut acc = identity;
            let mut integral = true;
            for value in &values {
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let n = numeric(op, value)?;
                integral &= is_integral(value);
                acc = if op == "$add" { acc + n } else { acc * n };
            }
            Ok(number_value(acc, integral))
        }
        "$subtract" => {
            let [a, b] = exactly::<2>(op, args_list(args, doc, vars)?)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let integral = is_integral(&a) && is_integral(&b);
            Ok(number_value(numeric(op, &a)? - numeric(op, &b)?, integral))
        }
        "$divide" => {
            let [a, b] = exactly::<2>(op, args_list(args, doc, vars)?)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let divisor = numeric(op, &b)?;
            if divisor == 0.0 {
                return Err(PipelineError::Expression("can't $divide by zero".into()));
            }
            Ok(number_value(numeric(op, &a)? / divisor, false))
        }
        "$round" => {
            let values = args_list(args, doc, vars)?;
            let (value, places) = match values.as_slice() {
                [value] => (value, 0),
                [value, places] => (value, places.as_i64().unwrap_or(0)),
                _ => return Err(PipelineError::Expression("$round expects 1 or 2 arguments".into())),
            };
            if value.is_null() {
                return Ok(Value::Null);
            }
            if is_integral(value) && places >= 0 {
                return Ok(value.clone());
            }
            let factor = 10f64.powi(places as i32);
            Ok(number_value((numeric(op, value)? * factor).round_ties_even() / factor, false))
        }
        "$sum" | "$avg" | "$min" | "$max" => {
            let values = args_list(args, doc, vars)?;
            let flattened: Vec<Value> = match values.as_slice() {
                [Value::Array(items)] => items.clone(),
                _ => values,
            };
            Ok(reduce(op, &flattened))
        }
        "$size" => {
            let [value] = exactly::<1>(op, args_list(args, doc, vars)?)?;
            value
                .as_array()
                .map(|items| Value::from(items.len() as u64))
                .ok_or_else(|| PipelineError::Expression(format!("$size requires an array, got {}", type_name(&value))))
        }
        "$concat" => {
            let mut out = String::new();
            for value in args_list(args, doc, vars)? {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(&s),
                    other => {
                        return Err(PipelineError::Expression(format!(
                            "$concat only supports strings, got {}",
                            type_name(&other)
                        )))
                    }
                }
            }
            Ok(Value::String(out))
        }
        "$toDouble" | "$toInt" => {
            let [value] = exactly::<1>(op, args_list(args, doc, vars)?)?;
            let n = match &value {
                Value::Null => return Ok(Value::Null),
                Value::Bool(b) => f64::from(u8::from(*b)),
                Value::Number(_) => numeric(op, &value)?,
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
                    PipelineError::Expression(format!("{} failed to parse '{}'", op, s))
                })?,
                other => match as_date(other) {
                    Some(dt) => dt.and_utc().timestamp_millis() as f64,
                    None => {
                        return Err(PipelineError::Expression(format!(
                            "{} unsupported for {}",
                            op,
                            type_name(other)
                        )))
                    }
                },
            };
            Ok(if op == "$toInt" {
                Value::from(n.trunc() as i64)
            } else {
                number_value(n, false)
            })
        }
        "$toString" => {
            let [value] = exactly::<1>(op, args_list(args, doc, vars)?)?;
            Ok(match value {
                Value::Null => Value::Null,
                Value::String(s) => Value::String(s),
                Value::Number(n) => Value::String(n.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                other => match as_date(&other) {
                    Some(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
                    None => {
                        return Err(PipelineError::Expression(format!(
                            "$toString unsupported for {}",
                            type_name(&other)
                        )))
                    }
                },
            })
        }
        other => Err(PipelineError::UnsupportedOperator(other.to_string())),
    }
}

fn numeric(op: &str, value: &Value) -> Result<f64, PipelineError> {
    as_f64(value).ok_or_else(|| {
        PipelineError::Expression(format!("{} only supports numeric types, got {}", op, type_name(value)))
    })
}

fn cond(args: &Value, doc: &Value, vars: &Vars) -> Result<Value, PipelineError> {
    let (test, then, otherwise) = match args {
        Value::Object(map) => {
            let part = |key: &str| {
                map.get(key)
                    .ok_or_else(|| PipelineError::Expression(format!("$cond is missing '{}'", key)))
            };
            (part("if")?, part("then")?, part("else")?)
        }
        Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
        _ => return Err(PipelineError::Expression("$cond expects {if, then, else} or 3 arguments".into())),
    };

    if truthy(&eval(test, doc, vars)?) {
        eval(then, doc, vars)
    } else {
        eval(otherwise, doc, vars)
    }
}

fn date_to_string(args: &Value, doc: &Value, vars: &Vars) -> Result<Value, PipelineError> {
    let spec = args
        .as_object()
        .ok_or_else(|| PipelineError::Expression("$dateToString expects an object".into()))?;
    let format = spec
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or("%Y-%m-%dT%H:%M:%S.%LZ")
        .replace("%L", "%3f");
    let date = eval(
        spec.get("date")
            .ok_or_else(|| PipelineError::Expression("$dateToString is missing 'date'".into()))?,
        doc,
        vars,
    )?;

    if date.is_null() {
        return Ok(Value::Null);
    }
    let dt = as_date(&date).ok_or_else(|| {
        PipelineError::Expression(format!("$dateToString requires a date, got {}", type_name(&date)))
    })?;

    let items: Vec<Item> = StrftimeItems::new(&format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(PipelineError::Expression(format!("invalid date format '{}'", format)));
    }
    Ok(Value::String(dt.format_with_items(items.into_iter()).to_string()))
}

/// `$sum`/`$avg`/`$min`/`$max` over already-evaluated values
pub fn reduce(op: &str, values: &[Value]) -> Value {
    match op {
        "$sum" => {
            let mut total = 0.0;
            let mut integral = true;
            for value in values.iter().filter(|v| v.is_number()) {
                total += as_f64(value).unwrap_or(0.0);
                integral &= is_integral(value);
            }
            number_value(total, integral)
        }
        "$avg" => {
            let numbers: Vec<f64> = values.iter().filter_map(as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                number_value(numbers.iter().sum::<f64>() / numbers.len() as f64, false)
            }
        }
        _ => {
            let wanted = if op == "$min" { Ordering::Less } else { Ordering::Greater };
            values
                .iter()
                .filter(|v| !v.is_null())
                .fold(None::<&Value>, |best, v| match best {
                    Some(b) if compare(v, b) != wanted => Some(b),
                    _ => Some(v),
                })
                .cloned()
                .unwrap_or(Value::Null)
        }
    }
}
