//! Typed pipeline stages
//!
//! JSON stages are parsed once at the boundary; the executor only ever sees
//! this closed set.

use super::PipelineError;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    Push,
    AddToSet,
    First,
    Last,
    Count,
}

impl AccumulatorOp {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$count" => AccumulatorOp::Count,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccumulatorOp::Sum => "$sum",
            AccumulatorOp::Avg => "$avg",
            AccumulatorOp::Min => "$min",
            AccumulatorOp::Max => "$max",
            AccumulatorOp::Push => "$push",
            AccumulatorOp::AddToSet => "$addToSet",
            AccumulatorOp::First => "$first",
            AccumulatorOp::Last => "$last",
            AccumulatorOp::Count => "$count",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub op: AccumulatorOp,
    pub expr: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub id: Value,
    pub accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Include,
    Exclude,
    Computed(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: Option<String>,
    pub foreign_field: Option<String>,
    pub let_vars: Map<String, Value>,
    pub pipeline: Option<Vec<Stage>>,
    pub as_field: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnwindSpec {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty_arrays: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Map<String, Value>),
    Group(GroupSpec),
    Sort(Vec<(String, SortDirection)>),
    Limit(u64),
    Skip(u64),
    Project(Vec<(String, Projection)>),
    Lookup(LookupSpec),
    Unwind(UnwindSpec),
    Count(String),
    AddFields(Vec<(String, Value)>),
}

impl Stage {
    pub fn operator(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Project(_) => "$project",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind(_) => "$unwind",
            Stage::Count(_) => "$count",
            Stage::AddFields(_) => "$addFields",
        }
    }

    /// Parse a single `{"$op": spec}` stage object
    pub fn parse(raw: &Value) -> Result<Stage, PipelineError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| PipelineError::invalid("pipeline", "stage must be an object"))?;
        if obj.len() != 1 {
            return Err(PipelineError::invalid("pipeline", "each stage must have exactly one operator"));
        }
        let Some((name, spec)) = obj.iter().next() else {
            return Err(PipelineError::invalid("pipeline", "empty stage"));
        };

        match name.as_str() {
            "$match" => spec
                .as_object()
                .cloned()
                .map(Stage::Match)
                .ok_or_else(|| PipelineError::invalid(name, "must be an object")),
            "$group" => parse_group(spec),
            "$sort" => parse_sort(spec),
            "$limit" => spec
                .as_u64()
                .filter(|n| *n > 0)
                .map(Stage::Limit)
                .ok_or_else(|| PipelineError::invalid(name, "must be a positive integer")),
            "$skip" => spec
                .as_u64()
                .map(Stage::Skip)
                .ok_or_else(|| PipelineError::invalid(name, "must be a non-negative integer")),
            "$project" => parse_project(spec),
            "$lookup" => parse_lookup(spec),
            "$unwind" => parse_unwind(spec),
            "$count" => match spec.as_str() {
                Some(field) if !field.is_empty() && !field.starts_with('$') && !field.contains('.') => {
                    Ok(Stage::Count(field.to_string()))
                }
                _ => Err(PipelineError::invalid(name, "must be a non-empty field name")),
            },
            "$addFields" => match spec.as_object() {
                Some(fields) if !fields.is_empty() => Ok(Stage::AddFields(
                    fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )),
                _ => Err(PipelineError::invalid(name, "must be a non-empty object")),
            },
            other => Err(PipelineError::UnknownStage(other.to_string())),
        }
    }

    pub fn to_value(&self) -> Value {
        let spec = match self {
            Stage::Match(filter) => Value::Object(filter.clone()),
            Stage::Group(group) => {
                let mut map = Map::new();
                map.insert("_id".into(), group.id.clone());
                for (name, acc) in &group.accumulators {
                    map.insert(name.clone(), json!({ acc.op.name(): acc.expr.clone() }));
                }
                Value::Object(map)
            }
            Stage::Sort(keys) => Value::Object(
                keys.iter()
                    .map(|(k, dir)| {
                        let n = if *dir == SortDirection::Ascending { 1 } else { -1 };
                        (k.clone(), json!(n))
                    })
                    .collect(),
            ),
            Stage::Limit(n) | Stage::Skip(n) => json!(n),
            Stage::Project(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, p)| {
                        let v = match p {
                            Projection::Include => json!(1),
                            Projection::Exclude => json!(0),
                            Projection::Computed(expr) => expr.clone(),
                        };
                        (k.clone(), v)
                    })
                    .collect(),
            ),
            Stage::Lookup(lookup) => {
                let mut map = Map::new();
                map.insert("from".into(), json!(lookup.from));
                if let Some(local) = &lookup.local_field {
                    map.insert("localField".into(), json!(local));
                }
                if let Some(foreign) = &lookup.foreign_field {
                    map.insert("foreignField".into(), json!(foreign));
                }
                if !lookup.let_vars.is_empty() {
                    map.insert("let".into(), Value::Object(lookup.let_vars.clone()));
                }
                if let Some(stages) = &lookup.pipeline {
                    map.insert("pipeline".into(), Value::Array(stages.iter().map(Stage::to_value).collect()));
                }
                map.insert("as".into(), json!(lookup.as_field));
                Value::Object(map)
            }
            Stage::Unwind(unwind) => {
                let mut map = Map::new();
                map.insert("path".into(), json!(format!("${}", unwind.path)));
                if let Some(index) = &unwind.include_array_index {
                    map.insert("includeArrayIndex".into(), json!(index));
                }
                if unwind.preserve_null_and_empty_arrays {
                    map.insert("preserveNullAndEmptyArrays".into(), json!(true));
                }
                Value::Object(map)
            }
            Stage::Count(field) => json!(field),
            Stage::AddFields(fields) => {
                Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
        };
        json!({ self.operator(): spec })
    }
}

fn parse_group(spec: &Value) -> Result<Stage, PipelineError> {
    let obj = spec
        .as_object()
        .ok_or_else(|| PipelineError::invalid("$group", "must be an object"))?;
    let id = obj
        .get("_id")
        .cloned()
        .ok_or_else(|| PipelineError::invalid("$group", "a group specification must include an _id"))?;

    let mut accumulators = Vec::new();
    for (name, acc) in obj.iter().filter(|(k, _)| k.as_str() != "_id") {
        let acc_obj = acc
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| PipelineError::invalid("$group", format!("field '{}' must be an accumulator object", name)))?;
        let Some((op_name, expr)) = acc_obj.iter().next() else {
            continue;
        };
        let op = AccumulatorOp::parse(op_name).ok_or_else(|| {
            PipelineError::invalid("$group", format!("unknown accumulator '{}'", op_name))
        })?;
        accumulators.push((
            name.clone(),
            Accumulator {
                op,
                expr: expr.clone(),
            },
        ));
    }

    Ok(Stage::Group(GroupSpec { id, accumulators }))
}

fn parse_sort(spec: &Value) -> Result<Stage, PipelineError> {
    let obj = spec
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| PipelineError::invalid("$sort", "must be a non-empty object"))?;
    obj.iter()
        .map(|(key, dir)| match dir.as_f64() {
            Some(n) if n == 1.0 => Ok((key.clone(), SortDirection::Ascending)),
            Some(n) if n == -1.0 => Ok((key.clone(), SortDirection::Descending)),
            _ => Err(PipelineError::invalid("$sort", format!("direction for '{}' must be 1 or -1", key))),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Stage::Sort)
}

fn parse_project(spec: &Value) -> Result<Stage, PipelineError> {
    let obj = spec
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| PipelineError::invalid("$project", "must be a non-empty object"))?;

    let fields: Vec<(String, Projection)> = obj
        .iter()
        .map(|(key, value)| {
            let projection = match value {
                Value::Bool(b) if *b => Projection::Include,
                Value::Bool(_) => Projection::Exclude,
                Value::Number(n) if n.as_f64() == Some(0.0) => Projection::Exclude,
                Value::Number(_) => Projection::Include,
                other => Projection::Computed(other.clone()),
            };
            (key.clone(), projection)
        })
        .collect();

    let includes = fields
        .iter()
        .any(|(k, p)| k != "_id" && !matches!(p, Projection::Exclude));
    let excludes = fields
        .iter()
        .any(|(k, p)| k != "_id" && matches!(p, Projection::Exclude));
    if includes && excludes {
        return Err(PipelineError::invalid("$project", "cannot mix inclusion and exclusion"));
    }

    Ok(Stage::Project(fields))
}

fn parse_lookup(spec: &Value) -> Result<Stage, PipelineError> {
    let obj = spec
        .as_object()
        .ok_or_else(|| PipelineError::invalid("$lookup", "must be an object"))?;
    let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);

    let from = text("from").ok_or_else(|| PipelineError::invalid("$lookup", "'from' must be a string"))?;
    let as_field = text("as").ok_or_else(|| PipelineError::invalid("$lookup", "'as' must be a string"))?;
    let local_field = text("localField");
    let foreign_field = text("foreignField");
    if local_field.is_some() != foreign_field.is_some() {
        return Err(PipelineError::invalid(
            "$lookup",
            "'localField' and 'foreignField' must be given together",
        ));
    }

    let let_vars = match obj.get("let") {
        None => Map::new(),
        Some(Value::Object(vars)) => vars.clone(),
        Some(_) => return Err(PipelineError::invalid("$lookup", "'let' must be an object")),
    };

    let pipeline = match obj.get("pipeline") {
        None => None,
        Some(Value::Array(stages)) => Some(stages.iter().map(Stage::parse).collect::<Result<Vec<_>, _>>()?),
        Some(_) => return Err(PipelineError::invalid("$lookup", "'pipeline' must be an array")),
    };

    if pipeline.is_none() && local_field.is_none() {
        return Err(PipelineError::invalid(
            "$lookup",
            "requires either 'pipeline' or 'localField'/'foreignField'",
        ));
    }

    Ok(Stage::Lookup(LookupSpec {
        from,
        local_field,
        foreign_field,
        let_vars,
        pipeline,
        as_field,
    }))
}

fn parse_unwind(spec: &Value) -> Result<Stage, PipelineError> {
    let (path, index, preserve) = match spec {
        Value::String(path) => (path.as_str(), None, false),
        Value::Object(obj) => (
            obj.get("path").and_then(Value::as_str).unwrap_or(""),
            obj.get("includeArrayIndex").and_then(Value::as_str).map(str::to_string),
            obj.get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => return Err(PipelineError::invalid("$unwind", "must be a path string or an object")),
    };

    let path = path
        .strip_prefix('$')
        .filter(|p| !p.is_empty() && !p.starts_with('$'))
        .ok_or_else(|| PipelineError::invalid("$unwind", "path must be a '$'-prefixed field path"))?;

    Ok(Stage::Unwind(UnwindSpec {
        path: path.to_string(),
        include_array_index: index,
        preserve_null_and_empty_arrays: preserve,
    }))
}

/// An ordered list of typed stages
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn parse(raw: &Value) -> Result<Self, PipelineError> {
        let stages = raw
            .as_array()
            .ok_or_else(|| PipelineError::invalid("pipeline", "must be an array of stages"))?;
        Ok(Self::new(stages.iter().map(Stage::parse).collect::<Result<Vec<_>, _>>()?))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn prepend(&mut self, stage: Stage) {
        self.stages.insert(0, stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_value).collect())
    }
}

impl From<Vec<Stage>> for Pipeline {
    fn from(stages: Vec<Stage>) -> Self {
        Self::new(stages)
    }
}
