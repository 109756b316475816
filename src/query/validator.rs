//! Validation of caller-submitted aggregation pipelines
//!
//! Callers (including agent tool calls) can send arbitrary stage lists. Before
//! anything runs:
//! - only allow-listed, single-operator stages survive
//! - `$lookup` must join `sheet_raw_data` through a sub-pipeline scoped to the
//!   caller's connections
//! - `$limit` is capped (and appended when missing)
//! - the target connection must be owned, and its `$match` is prepended

use super::engine::correlated_variable;
use super::stage::{LookupSpec, Pipeline, Stage};
use super::value::type_name;
use super::RAW_DATA_COLLECTION;
use serde_json::{json, Map, Value};

pub const ALLOWED_STAGES: &[&str] = &[
    "$match",
    "$group",
    "$sort",
    "$limit",
    "$project",
    "$lookup",
    "$unwind",
    "$count",
    "$skip",
    "$addFields",
];

pub const BLOCKED_STAGES: &[&str] = &[
    "$out",
    "$merge",
    "$delete",
    "$createIndex",
    "$dropIndex",
    "$collStats",
    "$indexStats",
    "$planCacheStats",
];

pub const MAX_RESULT_ROWS: u64 = 1000;

/// Rejected pipeline; the message names only the violated rule
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineValidator {
    max_limit: u64,
}

impl Default for PipelineValidator {
    fn default() -> Self {
        Self {
            max_limit: MAX_RESULT_ROWS,
        }
    }
}

impl PipelineValidator {
    pub fn new(max_limit: u64) -> Self {
        Self {
            max_limit: max_limit.max(1),
        }
    }

    /// Validate a raw stage list and return the typed, limit-capped pipeline
    pub fn validate(&self, raw: &Value, owned_connection_ids: &[String]) -> Result<Pipeline, ValidationError> {
        let stages = raw
            .as_array()
            .ok_or_else(|| ValidationError::new("Pipeline must be a list of stages"))?;
        if stages.is_empty() {
            return Err(ValidationError::new("Pipeline cannot be empty"));
        }

        let mut typed = Vec::with_capacity(stages.len() + 1);
        for (index, raw_stage) in stages.iter().enumerate() {
            check_operator(raw_stage, index)?;
            let stage = Stage::parse(raw_stage).map_err(|e| ValidationError::new(e.to_string()))?;
            if let Stage::Lookup(lookup) = &stage {
                validate_lookup(lookup, raw_stage, owned_connection_ids)?;
            }
            typed.push(stage);
        }

        for stage in typed.iter_mut() {
            if let Stage::Limit(n) = stage {
                if *n > self.max_limit {
                    log::debug!("✂️  Capping $limit {} to {}", n, self.max_limit);
                    *n = self.max_limit;
                }
            }
        }
        // `$unwind` after a `$limit` can still multiply rows, so the cap must be last
        if !matches!(typed.last(), Some(Stage::Limit(_))) {
            typed.push(Stage::Limit(self.max_limit));
        }

        Ok(Pipeline::new(typed))
    }

    /// Ownership check, validation, then the mandatory outer `$match`
    pub fn scoped_pipeline(
        &self,
        connection_id: &str,
        raw: &Value,
        owned_connection_ids: &[String],
    ) -> Result<Pipeline, ValidationError> {
        validate_connection_ownership(connection_id, owned_connection_ids)?;
        let mut pipeline = self.validate(raw, owned_connection_ids)?;

        let mut filter = Map::new();
        filter.insert("connection_id".into(), json!(connection_id));
        pipeline.prepend(Stage::Match(filter));
        Ok(pipeline)
    }
}

pub fn validate_connection_ownership(
    connection_id: &str,
    owned_connection_ids: &[String],
) -> Result<(), ValidationError> {
    if owned_connection_ids.iter().any(|id| id == connection_id) {
        Ok(())
    } else {
        Err(ValidationError::new("Access denied: connection does not belong to user"))
    }
}

/// Single-key object with an allow-listed operator (recursing into `$lookup`)
fn check_operator(raw_stage: &Value, index: usize) -> Result<(), ValidationError> {
    let obj = raw_stage.as_object().ok_or_else(|| {
        ValidationError::new(format!(
            "Stage {} must be an object, got {}",
            index,
            type_name(raw_stage)
        ))
    })?;
    if obj.len() != 1 {
        return Err(ValidationError::new(format!(
            "Stage {} must have exactly one operator",
            index
        )));
    }

    let Some((name, spec)) = obj.iter().next() else {
        return Err(ValidationError::new(format!("Stage {} is empty", index)));
    };
    if BLOCKED_STAGES.contains(&name.as_str()) {
        return Err(ValidationError::new(format!(
            "Stage '{}' is not allowed for security reasons",
            name
        )));
    }
    if !ALLOWED_STAGES.contains(&name.as_str()) {
        return Err(ValidationError::new(format!(
            "Stage '{}' is not supported. Allowed stages: {}",
            name,
            ALLOWED_STAGES.join(", ")
        )));
    }

    if name == "$lookup" {
        if let Some(Value::Array(sub_stages)) = spec.get("pipeline") {
            for (sub_index, sub_stage) in sub_stages.iter().enumerate() {
                check_operator(sub_stage, sub_index)?;
            }
        }
    }
    Ok(())
}

fn validate_lookup(lookup: &LookupSpec, raw_stage: &Value, owned: &[String]) -> Result<(), ValidationError> {
    if lookup.from != RAW_DATA_COLLECTION {
        return Err(ValidationError::new(format!(
            "$lookup may only join the {} collection",
            RAW_DATA_COLLECTION
        )));
    }

    let Some(stages) = &lookup.pipeline else {
        return Err(ValidationError::new(
            "$lookup must use a pipeline that filters by the user's connection_id",
        ));
    };

    let mut scoped = false;
    for stage in stages {
        match stage {
            Stage::Match(filter) => match match_scope(filter, &lookup.let_vars, owned) {
                Scope::Owned => scoped = true,
                Scope::Foreign => {
                    log::warn!("🚫 Rejected cross-tenant $lookup: {}", raw_stage);
                    return Err(ValidationError::new(
                        "$lookup pipeline filters on a connection the user does not own",
                    ));
                }
                Scope::Unscoped => {}
            },
            Stage::Lookup(nested) => {
                validate_lookup(nested, &nested_raw(nested), owned)?;
            }
            _ => {}
        }
    }

    if scoped {
        Ok(())
    } else {
        Err(ValidationError::new(
            "$lookup pipeline must filter by user's connection_id",
        ))
    }
}

fn nested_raw(lookup: &LookupSpec) -> Value {
    Stage::Lookup(lookup.clone()).to_value()
}

enum Scope {
    Owned,
    Foreign,
    Unscoped,
}

/// How a sub-pipeline `$match` constrains `connection_id`
///
/// The correlated `$expr` form only counts when its variable is bound to the
/// outer document's own `connection_id`.
fn match_scope(filter: &Map<String, Value>, let_vars: &Map<String, Value>, owned: &[String]) -> Scope {
    let is_owned = |id: &str| owned.iter().any(|o| o == id);

    if let Some(condition) = filter.get("connection_id") {
        let ids: Option<Vec<&str>> = match condition {
            Value::String(id) => Some(vec![id.as_str()]),
            Value::Object(ops) if ops.len() == 1 => match (ops.get("$eq"), ops.get("$in")) {
                (Some(Value::String(id)), _) => Some(vec![id.as_str()]),
                (_, Some(Value::Array(items))) if !items.is_empty() => {
                    items.iter().map(Value::as_str).collect()
                }
                _ => None,
            },
            _ => None,
        };
        return match ids {
            Some(ids) if ids.iter().all(|id| is_owned(id)) => Scope::Owned,
            _ => Scope::Foreign,
        };
    }

    let correlated = filter
        .get("$expr")
        .and_then(correlated_variable)
        .and_then(|var| let_vars.get(var))
        .map(|bound| bound == "$connection_id")
        .unwrap_or(false);
    if correlated {
        Scope::Owned
    } else {
        Scope::Unscoped
    }
}
