//! The RPC dispatch contract: the caller-supplied function the
//! request executor invokes. Expressed as an `async_trait` object,
//! mirroring the `Engine`/`FileUpload` traits in
//! `fluent-core/src/traits.rs`.

use async_trait::async_trait;
use serde_json::Value;

use flowcraft_core::error::FlowError;

use crate::abort::AbortScope;

/// The JSON-RPC 2.0 envelope a request step builds before dispatch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
    pub id: u64,
}

/// Options accompanying a dispatch call: a cancellation scope and a
/// per-call timeout hint.
#[derive(Clone)]
pub struct DispatchOptions {
    pub cancellation: AbortScope,
    pub timeout_ms: Option<u64>,
}

/// The caller-supplied RPC dispatch function ("no process-global
/// state -- every dependency is injected at construction").
#[async_trait]
pub trait RpcDispatcher: Send + Sync {
    async fn dispatch(&self, request: JsonRpcRequest, options: DispatchOptions) -> Result<Value, FlowError>;
}

/// True when `value` is an object carrying a JSON-RPC `error` field --
/// the request executor records `metadata.hasError` but still returns a
/// result rather than failing.
pub fn response_has_error(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.contains_key("error"))
}
