//! `$match` query evaluation
//!
//! Field conditions follow document query semantics: a condition on a path
//! that crosses an array matches if any element matches, range operators only
//! match values of the same type bracket, and `null` matches missing fields.

use super::expr::{eval, Vars};
use super::value::{bracket, compare, is_date_literal, resolve_all, truthy, type_name, values_equal};
use super::PipelineError;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::cmp::Ordering;

pub fn matches(filter: &Map<String, Value>, doc: &Value, vars: &Vars) -> Result<bool, PipelineError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in sub_filters(key, condition)? {
                    if !matches(sub, doc, vars)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" | "$nor" => {
                let mut any = false;
                for sub in sub_filters(key, condition)? {
                    if matches(sub, doc, vars)? {
                        any = true;
                        break;
                    }
                }
                if key == "$or" {
                    any
                } else {
                    !any
                }
            }
            "$expr" => truthy(&eval(condition, doc, vars)?),
            op if op.starts_with('$') => return Err(PipelineError::UnsupportedOperator(op.to_string())),
            path => field_matches(doc, path, condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(op: &str, condition: &'a Value) -> Result<Vec<&'a Map<String, Value>>, PipelineError> {
    let items = condition
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| PipelineError::invalid("$match", format!("{} requires a non-empty array", op)))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| PipelineError::invalid("$match", format!("{} entries must be objects", op)))
        })
        .collect()
}

fn is_operator_object(condition: &Value) -> bool {
    match condition {
        Value::Object(map) => {
            !map.is_empty() && !is_date_literal(condition) && map.keys().all(|k| k.starts_with('$'))
        }
        _ => false,
    }
}

fn field_matches(doc: &Value, path: &str, condition: &Value) -> Result<bool, PipelineError> {
    let candidates = resolve_all(doc, path);

    if !is_operator_object(condition) {
        return Ok(equals_any(&candidates, condition));
    }

    let Value::Object(ops) = condition else {
        return Ok(false);
    };
    operators_match(&candidates, ops)
}

fn operators_match(candidates: &[&Value], ops: &Map<String, Value>) -> Result<bool, PipelineError> {
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_any(candidates, arg),
            "$ne" => !equals_any(candidates, arg),
            "$gt" | "$gte" | "$lt" | "$lte" => range_any(candidates, op, arg),
            "$in" => in_list(candidates, op, arg)?,
            "$nin" => !in_list(candidates, op, arg)?,
            "$exists" => truthy(arg) == !candidates.is_empty(),
            "$regex" => {
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                let re = build_regex(arg, options)?;
                expand(candidates)
                    .iter()
                    .any(|c| c.as_str().map(|s| re.is_match(s)).unwrap_or(false))
            }
            "$options" => true,
            "$size" => {
                let wanted = arg
                    .as_u64()
                    .ok_or_else(|| PipelineError::invalid("$match", "$size requires a non-negative integer"))?;
                candidates
                    .iter()
                    .any(|c| c.as_array().map(|a| a.len() as u64 == wanted).unwrap_or(false))
            }
            "$not" => {
                let inner = arg
                    .as_object()
                    .ok_or_else(|| PipelineError::invalid("$match", "$not requires an operator object"))?;
                !operators_match(candidates, inner)?
            }
            other => return Err(PipelineError::UnsupportedOperator(other.to_string())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Candidates plus the elements of any array candidates
fn expand<'a>(candidates: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        out.push(*candidate);
        if let Value::Array(items) = candidate {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(candidates: &[&Value], target: &Value) -> bool {
    if candidates.is_empty() {
        return target.is_null();
    }
    expand(candidates).iter().any(|c| values_equal(c, target))
}

fn range_any(candidates: &[&Value], op: &str, target: &Value) -> bool {
    let wanted = bracket(target);
    expand(candidates).iter().any(|c| {
        if bracket(c) != wanted {
            return false;
        }
        let ord = compare(c, target);
        match op {
            "$gt" => ord == Ordering::Greater,
            "$gte" => ord != Ordering::Less,
            "$lt" => ord == Ordering::Less,
            _ => ord != Ordering::Greater,
        }
    })
}

fn in_list(candidates: &[&Value], op: &str, arg: &Value) -> Result<bool, PipelineError> {
    let items = arg.as_array().ok_or_else(|| {
        PipelineError::invalid("$match", format!("{} requires an array, got {}", op, type_name(arg)))
    })?;
    Ok(items.iter().any(|item| equals_any(candidates, item)))
}

fn build_regex(pattern: &Value, options: &str) -> Result<Regex, PipelineError> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| PipelineError::invalid("$match", "$regex requires a string pattern"))?;
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .build()
        .map_err(|e| PipelineError::invalid("$match", format!("invalid regex: {}", e)))
}
