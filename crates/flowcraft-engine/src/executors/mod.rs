//! Step executors: one file per step variant, following
//! `fluent-engines/src/pipeline/{command,condition,loop}_executor.rs`'s
//! one-executor-per-file convention. Each shares `canExecute`/`execute`
//! semantics and a common [`StepContext`] carrying everything an executor
//! needs to dispatch RPCs, emit events, and -- for condition/loop/delay --
//! re-enter the flow executor for nested steps.

pub mod condition;
pub mod delay;
pub mod loop_step;
pub mod request;
pub mod stop;
pub mod transform;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use flowcraft_core::error::FlowResult;
use flowcraft_core::model::{Flow, Step, StepResult};
use serde_json::{Map, Value};

use crate::abort::AbortScope;
use crate::dispatch::RpcDispatcher;
use crate::events::EventEmitter;

/// The flow executor's nested-step re-entry point: condition, loop,
/// and delay executors call back into it to run their nested steps with
/// the same evaluator/resolver/cancellation scope the top-level walk uses.
#[async_trait]
pub trait NestedDispatch: Send + Sync {
    async fn dispatch_nested(&self, step: &Step, locals: &Map<String, Value>, abort: &AbortScope, correlation: &str) -> FlowResult<StepResult>;
}

/// Everything a step executor needs beyond the step itself and its local
/// scope bindings.
pub struct StepContext<'a> {
    pub flow: &'a Flow,
    pub dispatcher: &'a Arc<dyn RpcDispatcher>,
    pub events: &'a EventEmitter,
    pub request_counter: &'a AtomicU64,
    pub nested: &'a dyn NestedDispatch,
    pub correlation: &'a str,
}

impl<'a> StepContext<'a> {
    pub fn next_request_id(&self) -> u64 {
        // Wraps on overflow per ("monotonically increasing request id
        // (wrapping on overflow)").
        self.request_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}
