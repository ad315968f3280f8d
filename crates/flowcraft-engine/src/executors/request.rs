//! The request executor: builds a JSON-RPC envelope, dispatches it
//! through the caller-supplied [`RpcDispatcher`], and wraps the call in a
//! per-step timeout and abort scope.

use flowcraft_core::error::{ExecutionError, FlowError, FlowResult, TimeoutError, ValidationError};
use flowcraft_core::model::{RequestStep, StepResult, StepType};
use serde_json::Value;

use crate::abort::{AbortReason, AbortScope};
use crate::dispatch::{response_has_error, DispatchOptions, JsonRpcRequest};
use crate::events::timestamp;
use crate::reference::{self, Scope};

use super::StepContext;

pub fn can_execute(step: &RequestStep) -> bool {
    !step.method.trim().is_empty() && matches!(step.params, Value::Object(_) | Value::Array(_) | Value::Null)
}

pub async fn execute(cx: &StepContext<'_>, step_name: &str, request: &RequestStep, scope: &Scope<'_>, abort: &AbortScope, timeout_ms: u64) -> FlowResult<StepResult> {
    if request.method.trim().is_empty() {
        return Err(ValidationError::new(format!("step '{step_name}' has an empty request method")).into());
    }
    if !matches!(request.params, Value::Object(_) | Value::Array(_) | Value::Null) {
        return Err(ValidationError::new(format!("step '{step_name}' request.params must be an object, array, or null")).into());
    }

    let resolved_params = reference::resolve_references(&request.params, scope)?;
    let id = cx.next_request_id();
    let envelope = JsonRpcRequest {
        jsonrpc: "2.0",
        method: request.method.clone(),
        params: resolved_params,
        id,
    };

    let child = abort.child();
    let dispatch_fut = cx.dispatcher.dispatch(
        envelope,
        DispatchOptions {
            cancellation: child.clone(),
            timeout_ms: Some(timeout_ms),
        },
    );

    let start = std::time::Instant::now();
    let outcome = tokio::select! {
        result = dispatch_fut => result,
        _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
            child.cancel(AbortReason::Timeout);
            return Err(TimeoutError::for_step(step_name, "request", timeout_ms, start.elapsed().as_millis() as u64).into());
        }
        _ = child.cancelled() => {
            return Err(crate::retry::abort_error(&child, step_name));
        }
    };

    let response = outcome.map_err(|e| wrap_dispatch_error(step_name, e))?;
    let has_error = response_has_error(&response);

    let mut result = StepResult::new(StepType::Request, Some(response))
        .with_metadata("method", request.method.clone())
        .with_metadata("requestId", id)
        .with_metadata("timestamp", timestamp());
    if has_error {
        result = result.with_metadata("hasError", true);
    }
    Ok(result)
}

/// `JsonRpcRequestError` and `TimeoutError` propagate unwrapped;
/// anything else is wrapped in `ExecutionError::Network` unless it already
/// carries a recognized code.
fn wrap_dispatch_error(step: &str, err: FlowError) -> FlowError {
    match err {
        FlowError::JsonRpcRequest { .. } | FlowError::Timeout(_) => err,
        other => FlowError::execution(step, ExecutionError::Network(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowcraft_core::model::{StepResultMap, StepType as ST};
    use serde_json::json;

    use crate::dispatch::RpcDispatcher;

    struct Echo;
    #[async_trait]
    impl RpcDispatcher for Echo {
        async fn dispatch(&self, request: JsonRpcRequest, _options: DispatchOptions) -> Result<Value, FlowError> {
            Ok(json!({ "method": request.method, "echoed": request.params }))
        }
    }

    struct NeverResponds;
    #[async_trait]
    impl RpcDispatcher for NeverResponds {
        async fn dispatch(&self, _request: JsonRpcRequest, _options: DispatchOptions) -> Result<Value, FlowError> {
            std::future::pending().await
        }
    }

    struct DummyNested;
    #[async_trait]
    impl super::super::NestedDispatch for DummyNested {
        async fn dispatch_nested(
            &self,
            _step: &flowcraft_core::model::Step,
            _locals: &serde_json::Map<String, Value>,
            _abort: &AbortScope,
            _correlation: &str,
        ) -> FlowResult<StepResult> {
            unreachable!("request executor never calls nested dispatch")
        }
    }

    fn make_cx<'a>(
        flow: &'a flowcraft_core::model::Flow,
        dispatcher: &'a std::sync::Arc<dyn RpcDispatcher>,
        events: &'a crate::events::EventEmitter,
        counter: &'a std::sync::atomic::AtomicU64,
        nested: &'a DummyNested,
    ) -> StepContext<'a> {
        StepContext {
            flow,
            dispatcher,
            events,
            request_counter: counter,
            nested,
            correlation: "root",
        }
    }

    #[tokio::test]
    async fn dispatches_and_wraps_result() {
        let flow = flowcraft_core::model::Flow::from_yaml_str("name: f\nsteps: []").unwrap();
        let dispatcher: std::sync::Arc<dyn RpcDispatcher> = std::sync::Arc::new(Echo);
        let events = crate::events::EventEmitter::default();
        let counter = std::sync::atomic::AtomicU64::new(0);
        let nested = DummyNested;
        let cx = make_cx(&flow, &dispatcher, &events, &counter, &nested);

        let results = StepResultMap::new();
        let context = json!({});
        let locals = serde_json::Map::new();
        let scope = Scope::new(&results, &context, &locals);
        let abort = AbortScope::root();

        let req = RequestStep {
            method: "user.get".to_string(),
            params: json!({ "id": 1 }),
        };
        let result = execute(&cx, "getUser", &req, &scope, &abort, 1000).await.unwrap();
        assert_eq!(result.step_type, ST::Request);
        assert_eq!(result.result.unwrap()["method"], json!("user.get"));
    }

    #[tokio::test]
    async fn timeout_raises_timeout_error() {
        let flow = flowcraft_core::model::Flow::from_yaml_str("name: f\nsteps: []").unwrap();
        let dispatcher: std::sync::Arc<dyn RpcDispatcher> = std::sync::Arc::new(NeverResponds);
        let events = crate::events::EventEmitter::default();
        let counter = std::sync::atomic::AtomicU64::new(0);
        let nested = DummyNested;
        let cx = make_cx(&flow, &dispatcher, &events, &counter, &nested);

        let results = StepResultMap::new();
        let context = json!({});
        let locals = serde_json::Map::new();
        let scope = Scope::new(&results, &context, &locals);
        let abort = AbortScope::root();

        let req = RequestStep {
            method: "slow".to_string(),
            params: Value::Null,
        };
        let err = execute(&cx, "r", &req, &scope, &abort, 10).await.unwrap_err();
        assert!(matches!(err, FlowError::Timeout(_)));
    }
}
