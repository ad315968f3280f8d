//! The delay executor: sleep for `duration` milliseconds, then
//! dispatch the nested `step`, marking it as a nested invocation via locals.

use flowcraft_core::error::{ExecutionError, FlowError, FlowResult};
use flowcraft_core::model::{DelayStep, StepResult, StepType};
use serde_json::json;

use crate::abort::AbortScope;
use crate::events::timestamp;

use super::StepContext;

pub async fn execute(cx: &StepContext<'_>, step_name: &str, delay: &DelayStep, abort: &AbortScope) -> FlowResult<StepResult> {
    let duration = delay.duration;

    tokio::select! {
        _ = tokio::time::sleep(std::time::Duration::from_millis(duration)) => {}
        _ = abort.cancelled() => return Err(crate::retry::abort_error(abort, step_name)),
    }

    let mut locals = serde_json::Map::new();
    locals.insert("_nestedStep".to_string(), json!(true));
    locals.insert("_parentStep".to_string(), json!(step_name));

    let nested_result = cx
        .nested
        .dispatch_nested(&delay.step, &locals, abort, cx.correlation)
        .await
        .map_err(|e| FlowError::execution(step_name, ExecutionError::Wrapped(Box::new(e))))?;

    Ok(StepResult::new(StepType::Delay, Some(nested_result.to_value()))
        .with_metadata("duration", duration)
        .with_metadata("timestamp", timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowcraft_core::model::{Flow, Step, StepKind, StepType as ST, StopStep};
    use serde_json::Value;
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

    struct MarkerCheckingNested;
    #[async_trait]
    impl super::super::NestedDispatch for MarkerCheckingNested {
        async fn dispatch_nested(&self, _step: &Step, locals: &serde_json::Map<String, Value>, _abort: &AbortScope, _correlation: &str) -> FlowResult<StepResult> {
            assert_eq!(locals.get("_nestedStep"), Some(&json!(true)));
            Ok(StepResult::new(ST::Stop, None))
        }
    }

    #[tokio::test]
    async fn sleeps_then_dispatches_nested_with_markers() {
        let f = Flow::from_yaml_str("name: f\nsteps: []").unwrap();
        let dispatcher: Arc<dyn RpcDispatcher> = Arc::new(Unused);
        let events = EventEmitter::default();
        let counter = AtomicU64::new(0);
        let nested = MarkerCheckingNested;
        let cx = StepContext {
            flow: &f,
            dispatcher: &dispatcher,
            events: &events,
            request_counter: &counter,
            nested: &nested,
            correlation: "root",
        };
        let abort = AbortScope::root();
        let delay = DelayStep {
            duration: 1,
            step: Box::new(Step {
                name: "after".to_string(),
                description: None,
                kind: StepKind::Stop { stop: StopStep::default() },
                policies: None,
            }),
        };
        let result = execute(&cx, "wait", &delay, &abort).await.unwrap();
        assert_eq!(result.step_type, ST::Delay);
        assert_eq!(result.metadata["duration"], json!(1));
    }
}
