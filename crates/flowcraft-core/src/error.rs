//! Error taxonomy for flow construction and execution.
//!
//! `FlowError` is the root of a tagged hierarchy, mirroring the flat
//! set-of-named-variants shape `fluent-cli/src/error.rs` uses for its own
//! error enum, generalized to the categories the flow engine actually
//! raises: validation, execution, timeouts, retries, reference/path
//! resolution, and dependency-graph construction.

use thiserror::Error;

/// Root error type returned by every public flowcraft-core/-engine operation.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("execution error in step '{step}': {source}")]
    Execution {
        step: String,
        #[source]
        source: ExecutionError,
    },

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    MaxRetriesExceeded(#[from] MaxRetriesExceededError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// A caller-supplied JSON-RPC error, propagated unwrapped per /.
    #[error("json-rpc error {code}: {message}")]
    JsonRpcRequest {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
}

impl FlowError {
    /// The stable error code surfaced to event subscribers.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "VALIDATION_ERROR",
            FlowError::Execution { .. } => "EXECUTION_ERROR",
            FlowError::State(_) => "STATE_ERROR",
            FlowError::Timeout(_) => "TIMEOUT_ERROR",
            FlowError::MaxRetriesExceeded(_) => "MAX_RETRIES_EXCEEDED",
            FlowError::Reference(_) => "NETWORK_ERROR",
            FlowError::Path(_) => "VALIDATION_ERROR",
            FlowError::Dependency(_) => "VALIDATION_ERROR",
            FlowError::Expression(_) => "VALIDATION_ERROR",
            FlowError::JsonRpcRequest { .. } => "NETWORK_ERROR",
        }
    }

    /// True when this error carries a `code` that a retry policy can match
    /// against `retryableErrors`.
    pub fn retry_code(&self) -> &'static str {
        self.code()
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Message(String),
    #[error("step '{step}' has an invalid {field}: {reason}")]
    InvalidField {
        step: String,
        field: String,
        reason: String,
    },
}

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        ValidationError::Message(msg.into())
    }
}

/// Generic executor failure, always carrying the underlying cause (
/// propagation policy: "raw dispatch/evaluator errors are wrapped in an
/// executor-specific ExecutionError preserving cause").
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Wrapped(Box<FlowError>),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("execution paused")]
    Pause(#[from] PauseError),
    #[error("{operation} is not valid in the current state: {reason}")]
    Invalid { operation: String, reason: String },
}

/// Raised when `pause()` aborts an in-flight `execute()`. Semantically
/// recoverable: callers may `resume()` afterwards.
#[derive(Debug, Error)]
#[error("flow execution paused")]
pub struct PauseError;

#[derive(Debug, Error)]
#[error("{step_type} step '{step}' timed out after {timeout_ms}ms")]
pub struct TimeoutError {
    pub step: String,
    pub step_type: String,
    pub timeout_ms: u64,
    pub execution_time_ms: u64,
    pub is_expression_timeout: bool,
}

impl TimeoutError {
    pub fn for_step(step: impl Into<String>, step_type: impl Into<String>, timeout_ms: u64, execution_time_ms: u64) -> Self {
        TimeoutError {
            step: step.into(),
            step_type: step_type.into(),
            timeout_ms,
            execution_time_ms,
            is_expression_timeout: false,
        }
    }

    pub fn for_expression(timeout_ms: u64, execution_time_ms: u64) -> Self {
        TimeoutError {
            step: String::new(),
            step_type: "expression".to_string(),
            timeout_ms,
            execution_time_ms,
            is_expression_timeout: true,
        }
    }
}

#[derive(Debug, Error)]
#[error("step '{step}' exceeded {attempts} retry attempts; last error: {last}")]
pub struct MaxRetriesExceededError {
    pub step: String,
    pub attempts: u32,
    pub last: String,
    pub attempt_errors: Vec<String>,
}

/// Reference resolution errors.
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("unknown reference root '{root}'; available roots: {}", .available.join(", "))]
    UnknownReference { root: String, available: Vec<String> },
    #[error("invalid reference syntax: {0}")]
    InvalidReference(String),
    #[error("circular reference detected: {}", .cycle.join(" -> "))]
    CircularReference { cycle: Vec<String> },
    #[error("failed to resolve reference '{path}' against value {value}: {reason}")]
    ResolutionFailed {
        path: String,
        value: String,
        reason: String,
    },
}

/// Path-accessor errors.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid path syntax in '{path}': {reason}")]
    Syntax { path: String, reason: String },
    #[error("cannot access '{segment}' on path '{path}': {reason}")]
    PropertyAccess {
        path: String,
        segment: String,
        reason: String,
    },
}

/// Dependency-graph construction errors.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("step '{step}' not found; available steps: {}", .available.join(", "))]
    StepNotFound { step: String, available: Vec<String> },
    #[error("step '{dependent}' depends on unknown step '{dependency}'; available steps: {}", .available.join(", "))]
    UnknownDependency {
        dependent: String,
        dependency: String,
        available: Vec<String>,
    },
    #[error("circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
}

/// Expression evaluator errors.
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("failed to tokenize expression '{expr}': {reason}")]
    Tokenizer { expr: String, reason: String },
    #[error("failed to evaluate expression '{expr}': {reason}")]
    Eval { expr: String, reason: String },
}

impl From<PauseError> for FlowError {
    fn from(err: PauseError) -> Self {
        FlowError::State(StateError::Pause(err))
    }
}

impl FlowError {
    pub fn execution(step: impl Into<String>, source: ExecutionError) -> Self {
        FlowError::Execution {
            step: step.into(),
            source,
        }
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, FlowError::State(StateError::Pause(_)))
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
