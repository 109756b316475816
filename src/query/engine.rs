//! In-process pipeline executor
//!
//! Documents are loaded per connection id from a [`DocumentSource`]. The
//! leading `$match` decides the scope; `$lookup` sub-pipelines load only the
//! connection ids their own `connection_id` filter names.

use super::expr::{eval, is_missing_field, reduce, Vars};
use super::filter::matches;
use super::stage::{
    AccumulatorOp, GroupSpec, LookupSpec, Pipeline, Projection, SortDirection, Stage, UnwindSpec,
};
use super::value::{compare, get_path, remove_path, set_path, values_equal};
use super::PipelineError;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

pub trait DocumentSource {
    /// All documents belonging to any of `connection_ids`, in row order
    fn documents(&self, connection_ids: &[String]) -> Result<Vec<Value>, PipelineError>;
}

pub fn execute(pipeline: &Pipeline, source: &dyn DocumentSource) -> Result<Vec<Value>, PipelineError> {
    run_pipeline(pipeline, source, None)
}

/// Like [`execute`], but any load outside `allowed` fails the whole pipeline
///
/// Used for caller-submitted pipelines: `$lookup` variables are evaluated
/// against documents the pipeline itself may have rewritten.
pub fn execute_within(
    pipeline: &Pipeline,
    source: &dyn DocumentSource,
    allowed: &[String],
) -> Result<Vec<Value>, PipelineError> {
    run_pipeline(pipeline, source, Some(allowed))
}

fn run_pipeline(
    pipeline: &Pipeline,
    source: &dyn DocumentSource,
    ceiling: Option<&[String]>,
) -> Result<Vec<Value>, PipelineError> {
    let scope = match pipeline.stages().first() {
        Some(Stage::Match(filter)) => connection_scope(filter, &Vars::new()),
        _ => None,
    }
    .ok_or_else(|| PipelineError::Unscoped("first stage must $match on connection_id".into()))?;

    let mut executor = Executor {
        source,
        ceiling,
        loaded: HashMap::new(),
    };
    let docs = executor.load(&scope)?;
    executor.run(pipeline.stages(), docs, &Vars::new())
}

/// Connection ids a `$match` filter restricts `connection_id` to
///
/// Accepts a plain id, `{"$eq": id}`, `{"$in": [ids]}` or the correlated form
/// `{"$expr": {"$eq": ["$connection_id", "$$var"]}}` resolved against `vars`.
pub fn connection_scope(filter: &Map<String, Value>, vars: &Vars) -> Option<Vec<String>> {
    if let Some(condition) = filter.get("connection_id") {
        return match condition {
            Value::String(id) => Some(vec![id.clone()]),
            Value::Object(ops) if ops.len() == 1 => match (ops.get("$eq"), ops.get("$in")) {
                (Some(Value::String(id)), _) => Some(vec![id.clone()]),
                (_, Some(Value::Array(ids))) => ids
                    .iter()
                    .map(|id| id.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>(),
                _ => None,
            },
            _ => None,
        };
    }

    let expr = filter.get("$expr")?;
    let var = correlated_variable(expr)?;
    vars.get(var)
        .and_then(Value::as_str)
        .map(|id| vec![id.to_string()])
}

/// Variable name in `{"$eq": ["$connection_id", "$$name"]}` (either order)
pub fn correlated_variable(expr: &Value) -> Option<&str> {
    let args = expr.as_object()?.get("$eq")?.as_array()?;
    let [a, b] = args.as_slice() else {
        return None;
    };
    let (a, b) = (a.as_str()?, b.as_str()?);
    match (a, b) {
        ("$connection_id", var) | (var, "$connection_id") => var.strip_prefix("$$"),
        _ => None,
    }
}

struct Executor<'a> {
    source: &'a dyn DocumentSource,
    ceiling: Option<&'a [String]>,
    loaded: HashMap<String, Vec<Value>>,
}

impl Executor<'_> {
    fn load(&mut self, connection_ids: &[String]) -> Result<Vec<Value>, PipelineError> {
        if let Some(allowed) = self.ceiling {
            if let Some(outside) = connection_ids.iter().find(|id| !allowed.contains(id)) {
                return Err(PipelineError::Unscoped(format!(
                    "connection {} is outside the caller's connections",
                    outside
                )));
            }
        }

        let missing: Vec<String> = connection_ids
            .iter()
            .filter(|id| !self.loaded.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let mut by_connection: HashMap<String, Vec<Value>> =
                missing.iter().map(|id| (id.clone(), Vec::new())).collect();
            for doc in self.source.documents(&missing)? {
                let owner = doc
                    .get("connection_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(bucket) = by_connection.get_mut(&owner) {
                    bucket.push(doc);
                }
            }
            self.loaded.extend(by_connection);
        }

        let mut docs = Vec::new();
        let mut seen = Vec::with_capacity(connection_ids.len());
        for id in connection_ids {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if let Some(bucket) = self.loaded.get(id) {
                docs.extend(bucket.iter().cloned());
            }
        }
        Ok(docs)
    }

    fn run(&mut self, stages: &[Stage], mut docs: Vec<Value>, vars: &Vars) -> Result<Vec<Value>, PipelineError> {
        for stage in stages {
            docs = match stage {
                Stage::Match(filter) => {
                    let mut kept = Vec::with_capacity(docs.len());
                    for doc in docs {
                        if matches(filter, &doc, vars)? {
                            kept.push(doc);
                        }
                    }
                    kept
                }
                Stage::Group(group) => group_docs(group, &docs, vars)?,
                Stage::Sort(keys) => {
                    sort_docs(&mut docs, keys);
                    docs
                }
                Stage::Limit(n) => {
                    docs.truncate(usize::try_from(*n).unwrap_or(usize::MAX));
                    docs
                }
                Stage::Skip(n) => docs
                    .into_iter()
                    .skip(usize::try_from(*n).unwrap_or(usize::MAX))
                    .collect(),
                Stage::Project(fields) => docs
                    .iter()
                    .map(|doc| project(doc, fields, vars))
                    .collect::<Result<Vec<_>, _>>()?,
                Stage::Lookup(lookup) => {
                    let mut joined = Vec::with_capacity(docs.len());
                    for doc in docs {
                        joined.push(self.lookup(lookup, doc, vars)?);
                    }
                    joined
                }
                Stage::Unwind(unwind) => docs.into_iter().flat_map(|doc| unwind_doc(unwind, doc)).collect(),
                Stage::Count(field) => {
                    if docs.is_empty() {
                        Vec::new()
                    } else {
                        let mut out = Map::new();
                        out.insert(field.clone(), Value::from(docs.len() as u64));
                        vec![Value::Object(out)]
                    }
                }
                Stage::AddFields(fields) => {
                    let mut out = Vec::with_capacity(docs.len());
                    for doc in docs {
                        let mut computed = Vec::with_capacity(fields.len());
                        for (path, expr) in fields {
                            computed.push((path, eval(expr, &doc, vars)?));
                        }
                        let mut map = into_object(doc);
                        for (path, value) in computed {
                            set_path(&mut map, path, value);
                        }
                        out.push(Value::Object(map));
                    }
                    out
                }
            };
        }
        Ok(docs)
    }

    fn lookup(&mut self, lookup: &LookupSpec, doc: Value, vars: &Vars) -> Result<Value, PipelineError> {
        let mut scoped_vars = vars.clone();
        for (name, expr) in &lookup.let_vars {
            scoped_vars.insert(name.clone(), eval(expr, &doc, vars)?);
        }

        let scope = match &lookup.pipeline {
            Some(stages) => stages
                .iter()
                .find_map(|stage| match stage {
                    Stage::Match(filter) => connection_scope(filter, &scoped_vars),
                    _ => None,
                })
                .ok_or_else(|| PipelineError::Unscoped("$lookup pipeline must $match on connection_id".into()))?,
            None => doc
                .get("connection_id")
                .and_then(Value::as_str)
                .map(|id| vec![id.to_string()])
                .ok_or_else(|| PipelineError::Unscoped("$lookup source document has no connection_id".into()))?,
        };

        let mut candidates = self.load(&scope)?;
        if let (Some(local), Some(foreign)) = (&lookup.local_field, &lookup.foreign_field) {
            let local_value = get_path(&doc, local).cloned().unwrap_or(Value::Null);
            candidates.retain(|candidate| {
                let foreign_value = get_path(candidate, foreign).unwrap_or(&Value::Null);
                values_equal(foreign_value, &local_value)
            });
        }

        let joined = match &lookup.pipeline {
            Some(stages) => self.run(stages, candidates, &scoped_vars)?,
            None => candidates,
        };

        let mut map = into_object(doc);
        set_path(&mut map, &lookup.as_field, Value::Array(joined));
        Ok(Value::Object(map))
    }
}

fn into_object(doc: Value) -> Map<String, Value> {
    match doc {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

enum AccState {
    Values(Vec<Value>),
    Avg { total: f64, count: u64 },
    Extreme(Option<Value>),
    Push(Vec<Value>),
    First(Option<Value>),
    Last(Value),
    Count(u64),
}

impl AccState {
    fn new(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::Sum => AccState::Values(Vec::new()),
            AccumulatorOp::Avg => AccState::Avg { total: 0.0, count: 0 },
            AccumulatorOp::Min | AccumulatorOp::Max => AccState::Extreme(None),
            AccumulatorOp::Push | AccumulatorOp::AddToSet => AccState::Push(Vec::new()),
            AccumulatorOp::First => AccState::First(None),
            AccumulatorOp::Last => AccState::Last(Value::Null),
            AccumulatorOp::Count => AccState::Count(0),
        }
    }

    fn add(&mut self, op: AccumulatorOp, value: Value) {
        match self {
            AccState::Values(values) => values.push(value),
            AccState::Avg { total, count } => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *count += 1;
                }
            }
            AccState::Extreme(best) => {
                if value.is_null() {
                    return;
                }
                let wanted = if op == AccumulatorOp::Min { Ordering::Less } else { Ordering::Greater };
                let replace = best.as_ref().map(|b| compare(&value, b) == wanted).unwrap_or(true);
                if replace {
                    *best = Some(value);
                }
            }
            AccState::Push(items) => {
                if op == AccumulatorOp::AddToSet && items.iter().any(|i| values_equal(i, &value)) {
                    return;
                }
                items.push(value);
            }
            AccState::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            AccState::Last(last) => *last = value,
            AccState::Count(n) => *n += 1,
        }
    }

    fn finish(self) -> Value {
        match self {
            AccState::Values(values) => reduce("$sum", &values),
            AccState::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    serde_json::Number::from_f64(total / count as f64)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            AccState::Extreme(best) => best.unwrap_or(Value::Null),
            AccState::Push(items) => Value::Array(items),
            AccState::First(first) => first.unwrap_or(Value::Null),
            AccState::Last(last) => last,
            AccState::Count(n) => Value::from(n),
        }
    }
}

fn group_docs(group: &GroupSpec, docs: &[Value], vars: &Vars) -> Result<Vec<Value>, PipelineError> {
    let mut keys: Vec<Value> = Vec::new();
    let mut states: Vec<Vec<AccState>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for doc in docs {
        let key = eval(&group.id, doc, vars)?;
        let slot = match index.get(&key.to_string()) {
            Some(slot) => *slot,
            None => {
                index.insert(key.to_string(), keys.len());
                keys.push(key);
                states.push(group.accumulators.iter().map(|(_, acc)| AccState::new(acc.op)).collect());
                keys.len() - 1
            }
        };

        for ((_, acc), state) in group.accumulators.iter().zip(states[slot].iter_mut()) {
            if acc.op == AccumulatorOp::Count {
                state.add(acc.op, Value::Null);
                continue;
            }
            // $push skips missing fields but keeps explicit nulls
            if matches!(acc.op, AccumulatorOp::Push | AccumulatorOp::AddToSet) && is_missing_field(&acc.expr, doc) {
                continue;
            }
            state.add(acc.op, eval(&acc.expr, doc, vars)?);
        }
    }

    Ok(keys
        .into_iter()
        .zip(states)
        .map(|(key, accs)| {
            let mut out = Map::new();
            out.insert("_id".into(), key);
            for ((name, _), state) in group.accumulators.iter().zip(accs) {
                out.insert(name.clone(), state.finish());
            }
            Value::Object(out)
        })
        .collect())
}

fn sort_docs(docs: &mut [Value], keys: &[(String, SortDirection)]) {
    docs.sort_by(|a, b| {
        for (path, direction) in keys {
            let va = get_path(a, path).unwrap_or(&Value::Null);
            let vb = get_path(b, path).unwrap_or(&Value::Null);
            let ord = match direction {
                SortDirection::Ascending => compare(va, vb),
                SortDirection::Descending => compare(vb, va),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn project(doc: &Value, fields: &[(String, Projection)], vars: &Vars) -> Result<Value, PipelineError> {
    let inclusion = fields
        .iter()
        .any(|(k, p)| k != "_id" && !matches!(p, Projection::Exclude))
        || fields
            .iter()
            .all(|(k, p)| k == "_id" && !matches!(p, Projection::Exclude));

    if !inclusion {
        let mut map = into_object(doc.clone());
        for (path, _) in fields {
            remove_path(&mut map, path);
        }
        return Ok(Value::Object(map));
    }

    let mut out = Map::new();
    let id_excluded = fields
        .iter()
        .any(|(k, p)| k == "_id" && matches!(p, Projection::Exclude));
    if !id_excluded {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".into(), id.clone());
        }
    }

    for (path, projection) in fields {
        match projection {
            Projection::Exclude => {}
            Projection::Include => {
                if let Some(value) = get_path(doc, path) {
                    set_path(&mut out, path, value.clone());
                }
            }
            Projection::Computed(expr) => {
                if !is_missing_field(expr, doc) {
                    set_path(&mut out, path, eval(expr, doc, vars)?);
                }
            }
        }
    }
    Ok(Value::Object(out))
}

fn unwind_doc(unwind: &UnwindSpec, doc: Value) -> Vec<Value> {
    let value = get_path(&doc, &unwind.path).cloned();
    let was_array = matches!(value, Some(Value::Array(_)));
    match value {
        Some(Value::Array(items)) if !items.is_empty() => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let mut map = into_object(doc.clone());
                set_path(&mut map, &unwind.path, item);
                if let Some(index_field) = &unwind.include_array_index {
                    set_path(&mut map, index_field, Value::from(i as u64));
                }
                Value::Object(map)
            })
            .collect(),
        Some(Value::Array(_)) | Some(Value::Null) | None => {
            if !unwind.preserve_null_and_empty_arrays {
                return Vec::new();
            }
            let mut map = into_object(doc);
            if was_array {
                remove_path(&mut map, &unwind.path);
            }
            if let Some(index_field) = &unwind.include_array_index {
                set_path(&mut map, index_field, Value::Null);
            }
            vec![Value::Object(map)]
        }
        Some(_) => vec![doc],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct VecSource(Vec<Value>);

    impl DocumentSource for VecSource {
        fn documents(&self, connection_ids: &[String]) -> Result<Vec<Value>, PipelineError> {
            Ok(self
                .0
                .iter()
                .filter(|d| {
                    d["connection_id"]
                        .as_str()
                        .map(|c| connection_ids.iter().any(|id| id == c))
                        .unwrap_or(false)
                })
                .cloned()
                .collect())
        }
    }

    fn source() -> VecSource {
        VecSource(vec![
            json!({"connection_id": "c-1", "row_number": 2, "data": {"status": "paid", "amount": 10}}),
            json!({"connection_id": "c-1", "row_number": 3, "data": {"status": "paid", "amount": 5.5}}),
            json!({"connection_id": "c-1", "row_number": 4, "data": {"status": "open", "amount": 7}}),
            json!({"connection_id": "c-2", "row_number": 2, "data": {"status": "paid", "amount": 1000}}),
        ])
    }

    fn run(raw: Value) -> Result<Vec<Value>, PipelineError> {
        execute(&Pipeline::parse(&raw).unwrap(), &source())
    }

    #[test]
    fn test_requires_connection_scope() {
        let err = run(json!([{"$match": {"data.status": "paid"}}])).unwrap_err();
        assert!(matches!(err, PipelineError::Unscoped(_)));
        assert!(run(json!([{"$limit": 1}])).is_err());
    }

    #[test]
    fn test_group_sort_limit() {
        let out = run(json!([
            {"$match": {"connection_id": "c-1"}},
            {"$group": {"_id": "$data.status", "count": {"$sum": 1}, "total": {"$sum": "$data.amount"}}},
            {"$sort": {"count": -1}},
            {"$limit": 1}
        ]))
        .unwrap();
        assert_eq!(out, vec![json!({"_id": "paid", "count": 2, "total": 15.5})]);
    }

    #[test]
    fn test_scope_never_leaks_other_connections() {
        let out = run(json!([
            {"$match": {"connection_id": "c-1"}},
            {"$match": {"connection_id": "c-2"}}
        ]))
        .unwrap();
        assert!(out.is_empty());

        let out = run(json!([
            {"$match": {"connection_id": {"$in": ["c-1", "c-2"]}}},
            {"$count": "n"}
        ]))
        .unwrap();
        assert_eq!(out, vec![json!({"n": 4})]);
    }

    #[test]
    fn test_count_of_nothing_is_empty() {
        let out = run(json!([
            {"$match": {"connection_id": "missing"}},
            {"$count": "n"}
        ]))
        .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_project_and_add_fields() {
        let out = run(json!([
            {"$match": {"connection_id": "c-1", "row_number": 2}},
            {"$addFields": {"data.double": {"$multiply": ["$data.amount", 2]}}},
            {"$project": {"_id": 0, "amount": "$data.amount", "double": "$data.double", "gone": "$nope"}}
        ]))
        .unwrap();
        assert_eq!(out, vec![json!({"amount": 10, "double": 20})]);

        let out = run(json!([
            {"$match": {"connection_id": "c-1", "row_number": 2}},
            {"$project": {"data": 0, "row_number": 0}}
        ]))
        .unwrap();
        assert_eq!(out, vec![json!({"connection_id": "c-1"})]);
    }

    #[test]
    fn test_unwind() {
        let source = VecSource(vec![
            json!({"connection_id": "c-1", "items": [{"sku": "a"}, {"sku": "b"}]}),
            json!({"connection_id": "c-1", "items": []}),
        ]);
        let pipeline = Pipeline::parse(&json!([
            {"$match": {"connection_id": "c-1"}},
            {"$unwind": "$items"}
        ]))
        .unwrap();
        let out = execute(&pipeline, &source).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["items"]["sku"], "b");

        let pipeline = Pipeline::parse(&json!([
            {"$match": {"connection_id": "c-1"}},
            {"$unwind": {"path": "$items", "preserveNullAndEmptyArrays": true}}
        ]))
        .unwrap();
        assert_eq!(execute(&pipeline, &source).unwrap().len(), 3);
    }

    #[test]
    fn test_correlated_lookup_stays_in_scope() {
        let out = run(json!([
            {"$match": {"connection_id": "c-1", "row_number": 2}},
            {"$lookup": {
                "from": "sheet_raw_data",
                "let": {"conn": "$connection_id"},
                "pipeline": [
                    {"$match": {"$expr": {"$eq": ["$connection_id", "$$conn"]}}},
                    {"$match": {"data.status": "paid"}}
                ],
                "as": "siblings"
            }}
        ]))
        .unwrap();
        let siblings = out[0]["siblings"].as_array().unwrap();
        assert_eq!(siblings.len(), 2);
        assert!(siblings.iter().all(|s| s["connection_id"] == "c-1"));
    }

    #[test]
    fn test_ceiling_blocks_rewritten_correlation() {
        let pipeline = Pipeline::parse(&json!([
            {"$match": {"connection_id": "c-1"}},
            {"$addFields": {"connection_id": "c-2"}},
            {"$lookup": {
                "from": "sheet_raw_data",
                "let": {"conn": "$connection_id"},
                "pipeline": [{"$match": {"$expr": {"$eq": ["$connection_id", "$$conn"]}}}],
                "as": "stolen"
            }}
        ]))
        .unwrap();

        let allowed = vec!["c-1".to_string()];
        let err = execute_within(&pipeline, &source(), &allowed).unwrap_err();
        assert!(matches!(err, PipelineError::Unscoped(_)));
    }

    #[test]
    fn test_correlated_variable() {
        assert_eq!(correlated_variable(&json!({"$eq": ["$connection_id", "$$c"]})), Some("c"));
        assert_eq!(correlated_variable(&json!({"$eq": ["$$c", "$connection_id"]})), Some("c"));
        assert_eq!(correlated_variable(&json!({"$eq": ["$other", "$$c"]})), None);
    }
}
