//! The flow executor: walks a flow's dependency-ordered steps,
//! applying policy resolution, retries, and cancellation, and re-enters
//! itself for nested steps via [`NestedDispatch`].

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flowcraft_core::error::{FlowError, FlowResult, PauseError, TimeoutError};
use flowcraft_core::model::{Flow, Step, StepKind, StepResult, StepResultMap, StepStatus, StepStatusMap, StepType};
use serde_json::{Map, Value};

use crate::abort::{AbortReason, AbortScope};
use crate::dispatch::RpcDispatcher;
use crate::events::{timestamp, Event, EventEmitter, EventOptionsPatch};
use crate::executors::{self, NestedDispatch, StepContext};
use crate::graph::DependencyGraph;
use crate::policy;
use crate::reference::Scope;
use crate::retry;

#[derive(Clone)]
struct ExecutionState {
    step_results: StepResultMap,
    step_status: StepStatusMap,
    context: Value,
}

/// Orchestrates a single [`Flow`] document against a caller-supplied
/// [`RpcDispatcher`].
pub struct FlowExecutor {
    flow: Flow,
    dispatcher: Arc<dyn RpcDispatcher>,
    events: EventEmitter,
    graph: DependencyGraph,
    state: Mutex<ExecutionState>,
    root: Mutex<AbortScope>,
    request_counter: AtomicU64,
}

impl FlowExecutor {
    pub fn new(flow: Flow, dispatcher: Arc<dyn RpcDispatcher>) -> FlowResult<Self> {
        Self::with_events(flow, dispatcher, EventEmitter::default())
    }

    pub fn with_events(flow: Flow, dispatcher: Arc<dyn RpcDispatcher>, events: EventEmitter) -> FlowResult<Self> {
        flow.validate_unique_names()?;
        let graph = DependencyGraph::build(&flow)?;
        let context = flow.context.clone().map(Value::Object).unwrap_or_else(|| Value::Object(Map::new()));

        Ok(FlowExecutor {
            flow,
            dispatcher,
            events,
            graph,
            state: Mutex::new(ExecutionState {
                step_results: StepResultMap::new(),
                step_status: StepStatusMap::new(),
                context,
            }),
            root: Mutex::new(AbortScope::root()),
            request_counter: AtomicU64::new(0),
        })
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn subscribe(&self, f: impl Fn(&Event) + Send + Sync + 'static) {
        self.events.subscribe(f);
    }

    pub fn update_event_options(&self, patch: EventOptionsPatch) {
        self.events.update_options(patch);
    }

    pub fn set_context(&self, context: Value) {
        self.state.lock().unwrap().context = context;
    }

    /// Seeds step results directly, marking each as completed -- used to
    /// resume a flow whose prior results were persisted elsewhere.
    pub fn set_step_results(&self, results: StepResultMap) {
        let mut state = self.state.lock().unwrap();
        for name in results.keys() {
            state.step_status.insert(name.clone(), StepStatus::Completed);
        }
        state.step_results = results;
    }

    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.state.lock().unwrap().step_status.get(name).copied()
    }

    /// Abort the current run with [`AbortReason::Pause`]. A no-op if
    /// the run already finished or was already aborted.
    pub fn pause(&self) {
        self.root_scope().cancel(AbortReason::Pause);
    }

    /// Discard all recorded progress and start over from a fresh scope.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.step_results = StepResultMap::new();
        state.step_status = StepStatusMap::new();
        *self.root.lock().unwrap() = AbortScope::root();
    }

    /// Re-enter `execute()` with a fresh cancellation scope, skipping steps
    /// already marked completed`).
    pub async fn resume(&self) -> FlowResult<StepResultMap> {
        *self.root.lock().unwrap() = AbortScope::root();
        self.execute().await
    }

    /// Clear `step_name` and everything that transitively depends on it,
    /// then re-run the flow`).
    pub async fn retry(&self, step_name: &str) -> FlowResult<StepResultMap> {
        let dependents = self.transitive_dependents(step_name)?;
        {
            let mut state = self.state.lock().unwrap();
            state.step_status.shift_remove(step_name);
            state.step_results.shift_remove(step_name);
            for dependent in &dependents {
                state.step_status.shift_remove(dependent);
                state.step_results.shift_remove(dependent);
            }
        }
        *self.root.lock().unwrap() = AbortScope::root();
        self.execute().await
    }

    fn transitive_dependents(&self, name: &str) -> FlowResult<Vec<String>> {
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            for dependent in self.graph.get_dependents(&current)? {
                if seen.insert(dependent.clone()) {
                    out.push(dependent.clone());
                    stack.push(dependent);
                }
            }
        }
        Ok(out)
    }

    fn root_scope(&self) -> AbortScope {
        self.root.lock().unwrap().clone()
    }

    fn mark_status(&self, name: &str, status: StepStatus) {
        self.state.lock().unwrap().step_status.insert(name.to_string(), status);
    }

    fn snapshot_context(&self) -> Value {
        self.state.lock().unwrap().context.clone()
    }

    /// Run the whole flow to completion (or first error/abort) in
    /// dependency order.
    pub async fn execute(&self) -> FlowResult<StepResultMap> {
        let order = self.graph.get_execution_order()?;
        let start = std::time::Instant::now();

        self.events.emit(Event::FlowStart {
            flow: self.flow.name.clone(),
            timestamp: timestamp(),
        });
        self.events.emit(Event::DependencyResolved {
            flow: self.flow.name.clone(),
            timestamp: timestamp(),
            ordered_steps: order.clone(),
        });

        let global_timeout = policy::resolve_global_timeout(&self.flow);
        let run = self.run_ordered(&order);

        let outcome = match global_timeout {
            Some(ms) => {
                tokio::select! {
                    result = run => result,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                        self.root_scope().cancel(AbortReason::Timeout);
                        self.events.emit(Event::FlowTimeout {
                            flow: self.flow.name.clone(),
                            timestamp: timestamp(),
                            timeout_ms: ms,
                        });
                        Err(FlowError::Timeout(TimeoutError::for_step(self.flow.name.clone(), "flow", ms, start.elapsed().as_millis() as u64)))
                    }
                }
            }
            None => run.await,
        };

        match &outcome {
            Ok(results) => {
                self.events.emit(Event::FlowComplete {
                    flow: self.flow.name.clone(),
                    timestamp: timestamp(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    results: if self.events.include_results() { Some(results_to_value(results)) } else { None },
                });
            }
            Err(err) if err.is_pause() => {
                self.events.emit(Event::FlowAborted {
                    flow: self.flow.name.clone(),
                    timestamp: timestamp(),
                    reason: "paused".to_string(),
                });
            }
            Err(err) => {
                self.events.emit(Event::FlowError {
                    flow: self.flow.name.clone(),
                    timestamp: timestamp(),
                    step: None,
                    error: err.to_string(),
                });
            }
        }

        outcome
    }

    async fn run_ordered(&self, order: &[String]) -> FlowResult<StepResultMap> {
        let empty_locals: Map<String, Value> = Map::new();

        for (idx, name) in order.iter().enumerate() {
            let root = self.root_scope();
            if root.is_cancelled() {
                return Err(if root.is_pause() { PauseError.into() } else { retry::abort_error(&root, name) });
            }

            if matches!(self.step_status(name), Some(StepStatus::Completed)) {
                continue;
            }

            let step = self.flow.step(name).expect("execution order is derived from the flow's own steps");
            self.mark_status(name, StepStatus::Running);

            self.events.emit(Event::StepStart {
                step: name.clone(),
                timestamp: timestamp(),
                step_type: step.step_type(),
                correlation: None,
                context_snapshot: if self.events.include_context() { Some(self.snapshot_context()) } else { None },
            });
            let step_start = std::time::Instant::now();

            match self.dispatch_step(step, &empty_locals, &root, name).await {
                Ok(result) => {
                    self.events.emit(Event::StepComplete {
                        step: name.clone(),
                        timestamp: timestamp(),
                        step_type: step.step_type(),
                        duration_ms: step_start.elapsed().as_millis() as u64,
                        result: if self.events.include_results() { Some(result.clone()) } else { None },
                        correlation: None,
                    });
                    let mut state = self.state.lock().unwrap();
                    state.step_status.insert(name.clone(), StepStatus::Completed);
                    state.step_results.insert(name.clone(), result);
                }
                Err(err) => {
                    if err.is_pause() {
                        self.mark_status(name, StepStatus::Aborted);
                        self.events.emit(Event::StepAborted {
                            step: name.clone(),
                            timestamp: timestamp(),
                            reason: "paused".to_string(),
                        });
                        return Err(err);
                    }
                    if let FlowError::Timeout(ref t) = err {
                        self.events.emit(Event::StepTimeout {
                            step: name.clone(),
                            timestamp: timestamp(),
                            timeout_ms: t.timeout_ms,
                        });
                    } else {
                        self.events.emit(Event::StepError {
                            step: name.clone(),
                            timestamp: timestamp(),
                            step_type: step.step_type(),
                            error: err.to_string(),
                            correlation: None,
                        });
                    }
                    self.mark_status(name, StepStatus::Failed);
                    return Err(err);
                }
            }

            if self.root_scope().is_cancelled() {
                for skipped in &order[idx + 1..] {
                    if matches!(self.step_status(skipped), Some(StepStatus::Completed)) {
                        continue;
                    }
                    self.mark_status(skipped, StepStatus::Skipped);
                    self.events.emit(Event::StepSkip {
                        step: skipped.clone(),
                        timestamp: timestamp(),
                        reason: "previous step".to_string(),
                    });
                }
                break;
            }
        }

        Ok(self.state.lock().unwrap().step_results.clone())
    }

    /// Resolve policy, apply retries, and dispatch a single step -- shared
    /// by the top-level walk and nested re-entry.
    async fn dispatch_step(&self, step: &Step, locals: &Map<String, Value>, abort: &AbortScope, correlation: &str) -> FlowResult<StepResult> {
        match policy::resolve_retry_policy(&self.flow, step, None).cloned() {
            Some(retry_policy) => {
                retry::run_with_retry(&retry_policy, abort, &self.events, &step.name, || self.dispatch_step_once(step, locals, abort, correlation)).await
            }
            None => self.dispatch_step_once(step, locals, abort, correlation).await,
        }
    }

    async fn dispatch_step_once(&self, step: &Step, locals: &Map<String, Value>, abort: &AbortScope, correlation: &str) -> FlowResult<StepResult> {
        let snapshot = self.state.lock().unwrap().clone();
        let expr_timeout_ms = policy::resolve_expression_timeout(&self.flow, Some(step));
        let scope = Scope::new(&snapshot.step_results, &snapshot.context, locals).with_expr_timeout_ms(expr_timeout_ms);
        let timeout_ms = policy::resolve_timeout(&self.flow, step, None);

        let cx = StepContext {
            flow: &self.flow,
            dispatcher: &self.dispatcher,
            events: &self.events,
            request_counter: &self.request_counter,
            nested: self,
            correlation,
        };

        match &step.kind {
            StepKind::Request { request } => executors::request::execute(&cx, &step.name, request, &scope, abort, timeout_ms).await,
            StepKind::Condition { condition } => executors::condition::execute(&cx, &step.name, condition, &scope, abort, timeout_ms).await,
            StepKind::Loop { loop_ } => executors::loop_step::execute(&cx, &step.name, loop_, &scope, abort, timeout_ms).await,
            StepKind::Transform { transform } => executors::transform::execute(&step.name, transform, &scope, abort, timeout_ms).await,
            StepKind::Delay { delay } => executors::delay::execute(&cx, &step.name, delay, abort).await,
            StepKind::Stop { stop } => executors::stop::execute(&step.name, stop, &self.root_scope()).await,
        }
    }
}

#[async_trait]
impl NestedDispatch for FlowExecutor {
    async fn dispatch_nested(&self, step: &Step, locals: &Map<String, Value>, abort: &AbortScope, correlation: &str) -> FlowResult<StepResult> {
        let child = abort.child();
        self.events.emit(Event::StepStart {
            step: step.name.clone(),
            timestamp: timestamp(),
            step_type: step.step_type(),
            correlation: Some(correlation.to_string()),
            context_snapshot: None,
        });
        let start = std::time::Instant::now();

        let result = self.dispatch_step(step, locals, &child, correlation).await;

        match &result {
            Ok(r) => {
                self.events.emit(Event::StepComplete {
                    step: step.name.clone(),
                    timestamp: timestamp(),
                    step_type: step.step_type(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    result: if self.events.include_results() { Some(r.clone()) } else { None },
                    correlation: Some(correlation.to_string()),
                });
            }
            Err(e) if e.is_pause() => {
                self.events.emit(Event::StepAborted {
                    step: step.name.clone(),
                    timestamp: timestamp(),
                    reason: "paused".to_string(),
                });
            }
            Err(e) if matches!(e, FlowError::Timeout(_)) => {
                if let FlowError::Timeout(t) = e {
                    self.events.emit(Event::StepTimeout {
                        step: step.name.clone(),
                        timestamp: timestamp(),
                        timeout_ms: t.timeout_ms,
                    });
                }
            }
            Err(e) => {
                self.events.emit(Event::StepError {
                    step: step.name.clone(),
                    timestamp: timestamp(),
                    step_type: step.step_type(),
                    error: e.to_string(),
                    correlation: Some(correlation.to_string()),
                });
            }
        }

        result
    }
}

fn results_to_value(results: &StepResultMap) -> Value {
    let mut map = Map::new();
    for (name, result) in results {
        map.insert(name.clone(), result.to_value());
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::dispatch::{DispatchOptions, JsonRpcRequest};

    struct Echo;
    #[async_trait]
    impl RpcDispatcher for Echo {
        async fn dispatch(&self, request: JsonRpcRequest, _options: DispatchOptions) -> Result<Value, FlowError> {
            Ok(json!({ "method": request.method, "params": request.params }))
        }
    }

    #[tokio::test]
    async fn executes_a_chain_of_steps() {
        let flow = Flow::from_yaml_str(
            r#"
name: chain
steps:
  - name: getUser
    request:
      method: user.get
      params:
        id: 1
  - name: greet
    request:
      method: greet.say
      params:
        name: "${getUser.result.method}"
"#,
        )
        .unwrap();

        let executor = FlowExecutor::new(flow, Arc::new(Echo)).unwrap();
        let results = executor.execute().await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.contains_key("getUser"));
        assert!(results.contains_key("greet"));
    }

    #[tokio::test]
    async fn stop_step_halts_remaining_steps() {
        let flow = Flow::from_yaml_str(
            r#"
name: halted
steps:
  - name: first
    stop:
      endWorkflow: true
  - name: never
    request:
      method: unreachable
      params: null
"#,
        )
        .unwrap();

        let executor = FlowExecutor::new(flow, Arc::new(Echo)).unwrap();
        let results = executor.execute().await.unwrap();
        assert!(results.contains_key("first"));
        assert!(!results.contains_key("never"));
        assert_eq!(executor.step_status("never"), Some(StepStatus::Skipped));
    }

    #[tokio::test]
    async fn resume_skips_already_completed_steps() {
        let flow = Flow::from_yaml_str(
            r#"
name: resumable
steps:
  - name: a
    request:
      method: m
      params: null
"#,
        )
        .unwrap();

        let executor = FlowExecutor::new(flow, Arc::new(Echo)).unwrap();
        executor.execute().await.unwrap();
        assert_eq!(executor.step_status("a"), Some(StepStatus::Completed));
        let results = executor.resume().await.unwrap();
        assert!(results.contains_key("a"));
    }
}
