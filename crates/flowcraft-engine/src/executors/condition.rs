//! The condition executor: evaluate `if`, dispatch whichever of
//! `then`/`else` applies as a nested step.

use flowcraft_core::error::{ExecutionError, FlowError, FlowResult, TimeoutError};
use flowcraft_core::model::{ConditionStep, StepResult, StepType};

use crate::abort::{AbortReason, AbortScope};
use crate::events::timestamp;
use crate::expression::ExpressionEngine;
use crate::reference::{ResolutionStack, Scope};

use super::StepContext;

pub async fn execute(cx: &StepContext<'_>, step_name: &str, condition: &ConditionStep, scope: &Scope<'_>, abort: &AbortScope, timeout_ms: u64) -> FlowResult<StepResult> {
    let child = abort.child();
    let start = std::time::Instant::now();

    let body = async {
        let engine = ExpressionEngine::new();
        let mut stack = ResolutionStack::new();
        let condition_value = engine.evaluate(&condition.if_expr, scope, &mut stack)?;
        let taken = crate::expression::is_truthy(&condition_value);

        let branch = if taken {
            Some(condition.then.as_ref())
        } else {
            condition.else_step.as_deref()
        };

        match branch {
            Some(step) => {
                let nested_result = cx
                    .nested
                    .dispatch_nested(step, cx_empty_locals(), &child, cx.correlation)
                    .await
                    .map_err(|e| FlowError::execution(step_name, ExecutionError::Wrapped(Box::new(e))))?;
                Ok(StepResult::new(StepType::Condition, Some(nested_result.to_value()))
                    .with_metadata("condition", condition.if_expr.clone())
                    .with_metadata("conditionValue", condition_value.clone())
                    .with_metadata("branchTaken", if taken { "then" } else { "else" })
                    .with_metadata("timestamp", timestamp()))
            }
            None => Ok(StepResult::new(StepType::Condition, None)
                .with_metadata("condition", condition.if_expr.clone())
                .with_metadata("conditionValue", condition_value.clone())
                .with_metadata("branchTaken", "else")
                .with_metadata("timestamp", timestamp())),
        }
    };

    tokio::select! {
        result = body => result,
        _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
            child.cancel(AbortReason::Timeout);
            Err(TimeoutError::for_step(step_name, "condition", timeout_ms, start.elapsed().as_millis() as u64).into())
        }
        _ = child.cancelled() => {
            Err(crate::retry::abort_error(&child, step_name))
        }
    }
}

fn cx_empty_locals() -> &'static serde_json::Map<String, serde_json::Value> {
    use std::sync::OnceLock;
    static EMPTY: OnceLock<serde_json::Map<String, serde_json::Value>> = OnceLock::new();
    EMPTY.get_or_init(serde_json::Map::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowcraft_core::model::{Flow, Step, StepResultMap, StepType as ST};
    use serde_json::{json, Value};
    use std::sync::{atomic::AtomicU64, Arc};

    use crate::dispatch::{DispatchOptions, JsonRpcRequest, RpcDispatcher};
    use crate::events::EventEmitter;

    struct Unused;
    #[async_trait]
    impl RpcDispatcher for Unused {
        async fn dispatch(&self, _request: JsonRpcRequest, _options: DispatchOptions) -> Result<Value, FlowError> {
            unreachable!("condition executor dispatches only through NestedDispatch")
        }
    }

    struct RecordingNested {
        name_seen: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl super::super::NestedDispatch for RecordingNested {
        async fn dispatch_nested(&self, step: &Step, _locals: &serde_json::Map<String, Value>, _abort: &AbortScope, _correlation: &str) -> FlowResult<StepResult> {
            *self.name_seen.lock().unwrap() = Some(step.name.clone());
            Ok(StepResult::new(ST::Request, Some(json!({"ok": true}))))
        }
    }

    fn flow() -> Flow {
        Flow::from_yaml_str("name: f\nsteps: []").unwrap()
    }

    #[tokio::test]
    async fn takes_then_branch_when_truthy() {
        let f = flow();
        let dispatcher: Arc<dyn RpcDispatcher> = Arc::new(Unused);
        let events = EventEmitter::default();
        let counter = AtomicU64::new(0);
        let nested = RecordingNested { name_seen: std::sync::Mutex::new(None) };
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

        let cond = ConditionStep {
            if_expr: "true".to_string(),
            then: Box::new(Step {
                name: "onTrue".to_string(),
                description: None,
                kind: flowcraft_core::model::StepKind::Stop {
                    stop: flowcraft_core::model::StopStep::default(),
                },
                policies: None,
            }),
            else_step: None,
        };
        let result = execute(&cx, "check", &cond, &scope, &abort, 1000).await.unwrap();
        assert_eq!(result.step_type, ST::Condition);
        assert_eq!(result.metadata["branchTaken"], json!("then"));
        assert_eq!(result.metadata["conditionValue"], json!(true));
        assert_eq!(result.result.unwrap()["result"], json!({"ok": true}));
        assert_eq!(*nested.name_seen.lock().unwrap(), Some("onTrue".to_string()));
    }

    #[tokio::test]
    async fn missing_else_branch_yields_none_result() {
        let f = flow();
        let dispatcher: Arc<dyn RpcDispatcher> = Arc::new(Unused);
        let events = EventEmitter::default();
        let counter = AtomicU64::new(0);
        let nested = RecordingNested { name_seen: std::sync::Mutex::new(None) };
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

        let cond = ConditionStep {
            if_expr: "false".to_string(),
            then: Box::new(Step {
                name: "onTrue".to_string(),
                description: None,
                kind: flowcraft_core::model::StepKind::Stop {
                    stop: flowcraft_core::model::StopStep::default(),
                },
                policies: None,
            }),
            else_step: None,
        };
        let result = execute(&cx, "check", &cond, &scope, &abort, 1000).await.unwrap();
        assert_eq!(result.metadata["branchTaken"], json!("else"));
        assert!(result.result.is_none());
    }
}
