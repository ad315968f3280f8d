//! The loop executor: iterate `over` a list, binding each element to
//! `as`, optionally skipping iterations where `condition` is falsy, and
//! dispatching the loop body as a nested step per iteration.

use flowcraft_core::error::{ExecutionError, FlowError, FlowResult, TimeoutError, ValidationError};
use flowcraft_core::model::{LoopStep, StepResult, StepType};
use serde_json::{json, Value};

use crate::abort::{AbortReason, AbortScope};
use crate::events::{timestamp, Event};
use crate::expression::{is_truthy, ExpressionEngine};
use crate::reference::{self, ResolutionStack, Scope};

use super::StepContext;

pub async fn execute(cx: &StepContext<'_>, step_name: &str, loop_step: &LoopStep, scope: &Scope<'_>, abort: &AbortScope, timeout_ms: u64) -> FlowResult<StepResult> {
    let child = abort.child();
    let start = std::time::Instant::now();

    let body = run_loop(cx, step_name, loop_step, scope, &child);

    tokio::select! {
        result = body => result,
        _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
            child.cancel(AbortReason::Timeout);
            Err(TimeoutError::for_step(step_name, "loop", timeout_ms, start.elapsed().as_millis() as u64).into())
        }
    }
}

async fn run_loop(cx: &StepContext<'_>, step_name: &str, loop_step: &LoopStep, scope: &Scope<'_>, abort: &AbortScope) -> FlowResult<StepResult> {
    let over_value = reference::resolve_references(&Value::String(loop_step.over.clone()), scope)?;
    let items = match over_value {
        Value::Array(items) => items,
        other => {
            return Err(ValidationError::new(format!(
                "loop step '{step_name}' 'over' must resolve to an array, got {other}"
            ))
            .into())
        }
    };

    let total = items.len() as u64;
    let max_iterations = loop_step.max_iterations.unwrap_or(u64::MAX);
    let body_steps = loop_step.body();
    // "copy-of-history": the wrapped results of every processed iteration so
    // far, exposed to later iterations via `metadata.iteration`.
    let mut history: Vec<Value> = Vec::new();
    let mut processed: Vec<Value> = Vec::new();
    let mut iteration_count: u64 = 0;
    let mut skipped_count: u64 = 0;

    for (index, item) in items.iter().enumerate() {
        if iteration_count >= max_iterations {
            break;
        }
        if abort.is_cancelled() {
            return Err(crate::retry::abort_error(abort, step_name));
        }

        iteration_count += 1;
        let iteration_info = json!({
            "index": index as u64,
            "count": iteration_count,
            "total": total,
            "maxIterations": loop_step.max_iterations,
            "isFirst": index == 0,
            "isLast": index as u64 == total.saturating_sub(1),
            "value": item,
        });

        let mut locals = scope.locals.clone();
        locals.insert(loop_step.as_ident.clone(), item.clone());
        locals.insert(
            "metadata".to_string(),
            json!({ "iteration": history.clone(), "current": iteration_info }),
        );
        let iteration_scope = scope.with_locals(&locals);

        if let Some(condition_expr) = &loop_step.condition {
            let engine = ExpressionEngine::new();
            let mut stack = ResolutionStack::new();
            let condition_value = engine.evaluate(condition_expr, &iteration_scope, &mut stack)?;
            if !is_truthy(&condition_value) {
                skipped_count += 1;
                cx.events.emit(Event::StepSkip {
                    step: step_name.to_string(),
                    timestamp: timestamp(),
                    reason: format!("loop condition false at iteration {index}"),
                });
                continue;
            }
        }

        cx.events.emit(Event::StepProgress {
            step: step_name.to_string(),
            timestamp: timestamp(),
            iteration: iteration_count,
            total_iterations: loop_step.max_iterations,
            percent: Some(if total == 0 { 100.0 } else { (iteration_count as f64 / total as f64) * 100.0 }),
        });

        let mut iteration_results = Vec::with_capacity(body_steps.len());
        for body_step in &body_steps {
            let result = cx
                .nested
                .dispatch_nested(*body_step, &locals, abort, cx.correlation)
                .await
                .map_err(|e| FlowError::execution(step_name, ExecutionError::Wrapped(Box::new(e))))?;
            iteration_results.push(result.to_value());
        }

        let iteration_value = if iteration_results.len() == 1 {
            iteration_results.into_iter().next().unwrap()
        } else {
            Value::Array(iteration_results)
        };
        history.push(iteration_value.clone());
        processed.push(iteration_value);
    }

    // maxIterations cut the walk short: whatever's left in `items` counts
    // as skipped, same as a condition-skip would.
    if iteration_count >= max_iterations && iteration_count < total {
        skipped_count += total - iteration_count;
    }

    let result_value = json!({
        "value": processed,
        "iterationCount": iteration_count,
        "skippedCount": skipped_count,
    });

    Ok(StepResult::new(StepType::Loop, Some(result_value))
        .with_metadata("over", loop_step.over.clone())
        .with_metadata("variable", loop_step.as_ident.clone())
        .with_metadata("iterationCount", iteration_count)
        .with_metadata("skippedCount", skipped_count)
        .with_metadata("timestamp", timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowcraft_core::model::{Flow, Step, StepKind, StepResultMap, StepType as ST, StopStep};
    use std::sync::{atomic::AtomicU64, Arc};

    use crate::dispatch::{DispatchOptions, JsonRpcRequest, RpcDispatcher};
    use crate::events::EventEmitter;

    struct Unused;
    #[async_trait]
    impl RpcDispatcher for Unused {
        async fn dispatch(&self, _request: JsonRpcRequest, _options: DispatchOptions) -> Result<Value, FlowError> {
            unreachable!()
        }
    }

    struct CountingNested {
        calls: std::sync::atomic::AtomicU64,
    }
    #[async_trait]
    impl super::super::NestedDispatch for CountingNested {
        async fn dispatch_nested(&self, _step: &Step, locals: &serde_json::Map<String, Value>, _abort: &AbortScope, _correlation: &str) -> FlowResult<StepResult> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(StepResult::new(ST::Stop, Some(locals.get("u").cloned().unwrap_or(Value::Null))))
        }
    }

    fn stop_step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            description: None,
            kind: StepKind::Stop { stop: StopStep::default() },
            policies: None,
        }
    }

    #[tokio::test]
    async fn iterates_over_array_and_binds_as() {
        let f = Flow::from_yaml_str("name: f\nsteps: []").unwrap();
        let dispatcher: Arc<dyn RpcDispatcher> = Arc::new(Unused);
        let events = EventEmitter::default();
        let counter = AtomicU64::new(0);
        let nested = CountingNested { calls: std::sync::atomic::AtomicU64::new(0) };
        let cx = StepContext {
            flow: &f,
            dispatcher: &dispatcher,
            events: &events,
            request_counter: &counter,
            nested: &nested,
            correlation: "root",
        };

        let results = StepResultMap::new();
        let context = json!({});
        let locals = serde_json::Map::new();
        let scope = Scope::new(&results, &context, &locals);
        let abort = AbortScope::root();

        let loop_step = LoopStep {
            over: "${context.items}".to_string(),
            as_ident: "u".to_string(),
            condition: None,
            max_iterations: None,
            step: Some(Box::new(stop_step("touch"))),
            steps: None,
        };

        let context_with_items = json!({"items": [1, 2, 3]});
        let scope2 = Scope::new(&results, &context_with_items, &locals);
        let _ = scope;
        let result = execute(&cx, "loopy", &loop_step, &scope2, &abort, 5000).await.unwrap();
        assert_eq!(nested.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(result.metadata["iterationCount"], json!(3));
        assert_eq!(result.metadata["skippedCount"], json!(0));
        assert_eq!(result.metadata["variable"], json!("u"));
        let value = result.result.unwrap()["value"].clone();
        assert_eq!(value.as_array().unwrap().len(), 3);
    }

    struct ConditionalNested {
        calls: std::sync::atomic::AtomicU64,
    }
    #[async_trait]
    impl super::super::NestedDispatch for ConditionalNested {
        async fn dispatch_nested(&self, _step: &Step, locals: &serde_json::Map<String, Value>, _abort: &AbortScope, _correlation: &str) -> FlowResult<StepResult> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(StepResult::new(ST::Stop, Some(locals.get("user").cloned().unwrap_or(Value::Null))))
        }
    }

    #[tokio::test]
    async fn skips_iterations_failing_condition() {
        let f = Flow::from_yaml_str("name: f\nsteps: []").unwrap();
        let dispatcher: Arc<dyn RpcDispatcher> = Arc::new(Unused);
        let events = EventEmitter::default();
        let counter = AtomicU64::new(0);
        let nested = ConditionalNested { calls: std::sync::atomic::AtomicU64::new(0) };
        let cx = StepContext {
            flow: &f,
            dispatcher: &dispatcher,
            events: &events,
            request_counter: &counter,
            nested: &nested,
            correlation: "root",
        };

        let results = StepResultMap::new();
        let context = json!({
            "users": [
                {"name": "a", "active": true},
                {"name": "b", "active": false},
                {"name": "c", "active": true},
            ]
        });
        let locals = serde_json::Map::new();
        let scope = Scope::new(&results, &context, &locals);
        let abort = AbortScope::root();

        let loop_step = LoopStep {
            over: "${context.users}".to_string(),
            as_ident: "user".to_string(),
            condition: Some("${user.active}".to_string()),
            max_iterations: None,
            step: Some(Box::new(stop_step("process"))),
            steps: None,
        };

        let result = execute(&cx, "process", &loop_step, &scope, &abort, 5000).await.unwrap();
        assert_eq!(nested.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(result.metadata["iterationCount"], json!(3));
        assert_eq!(result.metadata["skippedCount"], json!(1));
        let value = result.result.unwrap()["value"].clone();
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_array_over_is_validation_error() {
        let f = Flow::from_yaml_str("name: f\nsteps: []").unwrap();
        let dispatcher: Arc<dyn RpcDispatcher> = Arc::new(Unused);
        let events = EventEmitter::default();
        let counter = AtomicU64::new(0);
        let nested = CountingNested { calls: std::sync::atomic::AtomicU64::new(0) };
        let cx = StepContext {
            flow: &f,
            dispatcher: &dispatcher,
            events: &events,
            request_counter: &counter,
            nested: &nested,
            correlation: "root",
        };

        let results = StepResultMap::new();
        let context = json!({"items": "not-a-list"});
        let locals = serde_json::Map::new();
        let scope = Scope::new(&results, &context, &locals);
        let abort = AbortScope::root();

        let loop_step = LoopStep {
            over: "${context.items}".to_string(),
            as_ident: "u".to_string(),
            condition: None,
            max_iterations: None,
            step: Some(Box::new(stop_step("touch"))),
            steps: None,
        };

        let err = execute(&cx, "loopy", &loop_step, &scope, &abort, 5000).await.unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
    }
}
