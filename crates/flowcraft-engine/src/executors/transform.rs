//! The transform executor: resolve `input`, then pipe it through a
//! chain of `operations` (map/filter/reduce/flatten/sort/unique/group/join).
//! Each operation's `as` binding writes into the *step's own*
//! `metadata.outputs`, never into the flow's global context.

use std::cmp::Ordering;
use std::collections::HashSet;

use flowcraft_core::error::{FlowError, FlowResult, StateError, TimeoutError, ValidationError};
use flowcraft_core::model::{StepResult, StepType, TransformOp, TransformStep};
use serde_json::{json, Map, Value};

use crate::abort::{AbortReason, AbortScope};
use crate::events::timestamp;
use crate::expression::ExpressionEngine;
use crate::reference::{self, ResolutionStack, Scope};

pub async fn execute(step_name: &str, transform: &TransformStep, scope: &Scope<'_>, abort: &AbortScope, timeout_ms: u64) -> FlowResult<StepResult> {
    let child = abort.child();
    let start = std::time::Instant::now();

    let body = async {
        let mut value = reference::resolve_references(&transform.input, scope)?;
        let mut outputs = Map::new();
        let mut op_names = Vec::with_capacity(transform.operations.len());

        for op in &transform.operations {
            if child.is_cancelled() {
                return Err(FlowError::State(StateError::Invalid {
                    operation: step_name.to_string(),
                    reason: format!("Transform {} operation aborted", op.name()),
                }));
            }
            op_names.push(op.name());
            value = apply_operation(step_name, op, value, scope)?;
            if let Some(binding) = op.as_binding() {
                outputs.insert(binding.to_string(), value.clone());
            }
        }

        let input_type = type_name(&transform.input);
        let result_type = type_name(&value);

        let mut result = StepResult::new(StepType::Transform, Some(value))
            .with_metadata("operations", Value::Array(op_names.into_iter().map(Value::from).collect()))
            .with_metadata("inputType", input_type)
            .with_metadata("resultType", result_type)
            .with_metadata("timeout", timeout_ms)
            .with_metadata("timestamp", timestamp());
        if !outputs.is_empty() {
            result = result.with_metadata("outputs", Value::Object(outputs));
        }
        Ok(result)
    };

    tokio::select! {
        result = body => result,
        _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
            child.cancel(AbortReason::Timeout);
            Err(TimeoutError::for_step(step_name, "transform", timeout_ms, start.elapsed().as_millis() as u64).into())
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_array(step_name: &str, op_name: &str, value: Value) -> FlowResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(ValidationError::new(format!(
            "step '{step_name}' operation '{op_name}' requires an array input, got {other}"
        ))
        .into()),
    }
}

fn eval_with_element(step_name: &str, expr: &str, binding: &str, element: &Value, scope: &Scope) -> FlowResult<Value> {
    let mut locals = scope.locals.clone();
    locals.insert(binding.to_string(), element.clone());
    let element_scope = scope.with_locals(&locals);
    let engine = ExpressionEngine::new();
    let mut stack = ResolutionStack::new();
    engine.evaluate(expr, &element_scope, &mut stack).map_err(|e| {
        flowcraft_core::error::FlowError::execution(
            step_name,
            flowcraft_core::error::ExecutionError::Wrapped(Box::new(e)),
        )
    })
}

fn apply_operation(step_name: &str, op: &TransformOp, value: Value, scope: &Scope) -> FlowResult<Value> {
    match op {
        TransformOp::Map { using, .. } => {
            let items = as_array(step_name, "map", value)?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_with_element(step_name, using, "item", &item, scope)?);
            }
            Ok(Value::Array(out))
        }
        TransformOp::Filter { using, .. } => {
            let items = as_array(step_name, "filter", value)?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let kept = eval_with_element(step_name, using, "item", &item, scope)?;
                if crate::expression::is_truthy(&kept) {
                    out.push(item);
                }
            }
            Ok(Value::Array(out))
        }
        TransformOp::Reduce { using, initial, .. } => {
            let items = as_array(step_name, "reduce", value)?;
            let mut acc = initial.clone().unwrap_or(Value::Null);
            for item in items {
                let mut locals = scope.locals.clone();
                locals.insert("acc".to_string(), acc.clone());
                locals.insert("item".to_string(), item.clone());
                let reduce_scope = scope.with_locals(&locals);
                let engine = ExpressionEngine::new();
                let mut stack = ResolutionStack::new();
                acc = engine.evaluate(using, &reduce_scope, &mut stack)?;
            }
            Ok(acc)
        }
        TransformOp::Flatten { .. } => {
            let items = as_array(step_name, "flatten", value)?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Array(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            Ok(Value::Array(out))
        }
        TransformOp::Sort { using, .. } => {
            let mut items = as_array(step_name, "sort", value)?;
            let mut err = None;
            items.sort_by(|a, b| {
                if err.is_some() {
                    return Ordering::Equal;
                }
                let ka = eval_with_element(step_name, using, "item", a, scope);
                let kb = eval_with_element(step_name, using, "item", b, scope);
                match (ka, kb) {
                    (Ok(ka), Ok(kb)) => compare_values(&ka, &kb),
                    (Err(e), _) | (_, Err(e)) => {
                        err = Some(e);
                        Ordering::Equal
                    }
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            Ok(Value::Array(items))
        }
        TransformOp::Unique { .. } => {
            let items = as_array(step_name, "unique", value)?;
            let mut seen: HashSet<String> = HashSet::new();
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let key = serde_json::to_string(&item).unwrap_or_default();
                if seen.insert(key) {
                    out.push(item);
                }
            }
            Ok(Value::Array(out))
        }
        TransformOp::Group { using, .. } => {
            let items = as_array(step_name, "group", value)?;
            let mut groups: Map<String, Value> = Map::new();
            for item in items {
                let key_value = eval_with_element(step_name, using, "item", &item, scope)?;
                let key = match &key_value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match groups.get_mut(&key) {
                    Some(Value::Array(bucket)) => bucket.push(item),
                    _ => {
                        groups.insert(key, Value::Array(vec![item]));
                    }
                }
            }
            Ok(Value::Object(groups))
        }
        TransformOp::Join { using, .. } => {
            let items = as_array(step_name, "join", value)?;
            let joined = items.iter().map(scalar_to_string).collect::<Vec<_>>().join(using);
            Ok(Value::String(joined))
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}


fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(na), Value::Number(nb)) => na.as_f64().partial_cmp(&nb.as_f64()).unwrap_or(Ordering::Equal),
        (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
        _ => Ordering::Equal,
    }
}
