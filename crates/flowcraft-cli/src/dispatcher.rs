//! A demo [`RpcDispatcher`] for the `run` subcommand: resolves methods
//! against a small in-memory table instead of a real transport, so a flow
//! document can be exercised end-to-end without any external service.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use flowcraft_core::error::FlowError;
use flowcraft_engine::{DispatchOptions, JsonRpcRequest, RpcDispatcher};
use serde_json::{json, Value};

type Handler = Box<dyn Fn(&Value) -> Value + Send + Sync>;

/// Dispatches JSON-RPC calls against handlers registered by method name.
/// Unregistered methods fall back to an echo response so arbitrary demo
/// flows still produce something to inspect.
pub struct DemoDispatcher {
    handlers: HashMap<String, Handler>,
}

impl DemoDispatcher {
    pub fn new() -> Self {
        let mut handlers: HashMap<String, Handler> = HashMap::new();
        handlers.insert(
            "echo".to_string(),
            Box::new(|params: &Value| params.clone()),
        );
        handlers.insert(
            "ping".to_string(),
            Box::new(|_params: &Value| json!("pong")),
        );
        DemoDispatcher { handlers }
    }

    pub fn register(&mut self, method: impl Into<String>, handler: impl Fn(&Value) -> Value + Send + Sync + 'static) {
        self.handlers.insert(method.into(), Box::new(handler));
    }
}

impl Default for DemoDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcDispatcher for DemoDispatcher {
    async fn dispatch(&self, request: JsonRpcRequest, options: DispatchOptions) -> Result<Value, FlowError> {
        log::debug!("dispatching {} (id {})", request.method, request.id);

        // A small artificial latency keeps `run`'s progress output legible
        // for demo flows instead of completing every step in the same tick.
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            _ = options.cancellation.cancelled() => return Err(flowcraft_core::error::StateError::Invalid {
                operation: "dispatch".to_string(),
                reason: "cancelled before response".to_string(),
            }.into()),
        }

        let result = match self.handlers.get(request.method.as_str()) {
            Some(handler) => handler(&request.params),
            None => json!({ "method": request.method, "params": request.params }),
        };

        Ok(json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "result": result,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcraft_engine::abort::AbortScope;

    #[tokio::test]
    async fn echoes_unregistered_methods() {
        let dispatcher = DemoDispatcher::new();
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "user.get".to_string(),
            params: json!({"id": 1}),
            id: 1,
        };
        let options = DispatchOptions {
            cancellation: AbortScope::root(),
            timeout_ms: Some(1000),
        };
        let response = dispatcher.dispatch(request, options).await.unwrap();
        assert_eq!(response["result"]["method"], json!("user.get"));
    }

    #[tokio::test]
    async fn ping_resolves_registered_handler() {
        let dispatcher = DemoDispatcher::new();
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "ping".to_string(),
            params: Value::Null,
            id: 2,
        };
        let options = DispatchOptions {
            cancellation: AbortScope::root(),
            timeout_ms: Some(1000),
        };
        let response = dispatcher.dispatch(request, options).await.unwrap();
        assert_eq!(response["result"], json!("pong"));
    }
}
