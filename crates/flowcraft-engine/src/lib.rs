//! The flow execution engine: reference resolution, expression evaluation,
//! dependency-graph construction, policy/retry resolution, cancellation,
//! events, and the step executors that tie them together.

pub mod abort;
pub mod dispatch;
pub mod events;
pub mod executors;
pub mod expression;
pub mod flow;
pub mod graph;
pub mod path;
pub mod policy;
pub mod reference;
pub mod retry;

pub use dispatch::{DispatchOptions, JsonRpcRequest, RpcDispatcher};
pub use flow::FlowExecutor;
pub use graph::DependencyGraph;
