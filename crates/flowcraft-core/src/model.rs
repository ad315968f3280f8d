//! The flow document data model.
//!
//! A [`Flow`] is a named, ordered list of [`Step`]s plus an optional initial
//! context and policy block. Steps are tagged unions discriminated by which
//! block (`request`/`condition`/`loop`/`transform`/`delay`/`stop`) is
//! present, following the `PipelineStep` enum shape
//! (`pipeline_executor.rs`) generalized from external tagging to a flattened
//! untagged enum so that `name` lives alongside the discriminator block
//! instead of inside it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, ValidationError};

/// A declarative flow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub context: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub policies: Option<PolicyBlock>,
    /// Free-form, engine-ignored metadata carried with the document.
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl Flow {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, FlowError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FlowError::Validation(ValidationError::new(format!("invalid flow YAML: {e}"))))
    }

    pub fn from_json_str(json: &str) -> Result<Self, FlowError> {
        serde_json::from_str(json)
            .map_err(|e| FlowError::Validation(ValidationError::new(format!("invalid flow JSON: {e}"))))
    }

    /// Steps must have unique names.
    pub fn validate_unique_names(&self) -> Result<(), FlowError> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ValidationError::new(format!(
                    "duplicate step name '{}'",
                    step.name
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }
}

/// A single named step. Exactly one of `kind`'s variants is present in the
/// serialized form, chosen by which discriminator block the document uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub policies: Option<StepPolicies>,
}

impl Step {
    pub fn step_type(&self) -> StepType {
        match &self.kind {
            StepKind::Request { .. } => StepType::Request,
            StepKind::Condition { .. } => StepType::Condition,
            StepKind::Loop { .. } => StepType::Loop,
            StepKind::Transform { .. } => StepType::Transform,
            StepKind::Delay { .. } => StepType::Delay,
            StepKind::Stop { .. } => StepType::Stop,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepKind {
    Request { request: RequestStep },
    Condition { condition: ConditionStep },
    Loop {
        #[serde(rename = "loop")]
        loop_: LoopStep,
    },
    Transform { transform: TransformStep },
    Delay { delay: DelayStep },
    Stop { stop: StopStep },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Request,
    Condition,
    Loop,
    Transform,
    Delay,
    Stop,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepType::Request => "request",
            StepType::Condition => "condition",
            StepType::Loop => "loop",
            StepType::Transform => "transform",
            StepType::Delay => "delay",
            StepType::Stop => "stop",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStep {
    pub method: String,
    #[serde(default = "default_null")]
    pub params: Value,
}

fn default_null() -> Value {
    Value::Null
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    #[serde(rename = "if")]
    pub if_expr: String,
    pub then: Box<Step>,
    #[serde(rename = "else", default)]
    pub else_step: Option<Box<Step>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStep {
    pub over: String,
    #[serde(rename = "as")]
    pub as_ident: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(rename = "maxIterations", default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub step: Option<Box<Step>>,
    #[serde(default)]
    pub steps: Option<Vec<Step>>,
}

impl LoopStep {
    /// The nested steps to run per iteration, regardless of whether the
    /// document used singular `step` or plural `steps` (: "exactly one of
    /// step/steps").
    pub fn body(&self) -> Vec<&Step> {
        if let Some(step) = &self.step {
            vec![step.as_ref()]
        } else if let Some(steps) = &self.steps {
            steps.iter().collect()
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStep {
    pub input: Value,
    pub operations: Vec<TransformOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransformOp {
    Map {
        using: String,
        #[serde(default)]
        r#as: Option<String>,
    },
    Filter {
        using: String,
        #[serde(default)]
        r#as: Option<String>,
    },
    Reduce {
        using: String,
        #[serde(default)]
        initial: Option<Value>,
        #[serde(default)]
        r#as: Option<String>,
    },
    Flatten {
        #[serde(default)]
        r#as: Option<String>,
    },
    Sort {
        using: String,
        #[serde(default)]
        r#as: Option<String>,
    },
    Unique {
        #[serde(default)]
        r#as: Option<String>,
    },
    Group {
        using: String,
        #[serde(default)]
        r#as: Option<String>,
    },
    Join {
        using: String,
        #[serde(default)]
        r#as: Option<String>,
    },
}

impl TransformOp {
    pub fn name(&self) -> &'static str {
        match self {
            TransformOp::Map { .. } => "map",
            TransformOp::Filter { .. } => "filter",
            TransformOp::Reduce { .. } => "reduce",
            TransformOp::Flatten { .. } => "flatten",
            TransformOp::Sort { .. } => "sort",
            TransformOp::Unique { .. } => "unique",
            TransformOp::Group { .. } => "group",
            TransformOp::Join { .. } => "join",
        }
    }

    pub fn as_binding(&self) -> Option<&str> {
        match self {
            TransformOp::Map { r#as, .. }
            | TransformOp::Filter { r#as, .. }
            | TransformOp::Reduce { r#as, .. }
            | TransformOp::Flatten { r#as }
            | TransformOp::Sort { r#as, .. }
            | TransformOp::Unique { r#as }
            | TransformOp::Group { r#as, .. }
            | TransformOp::Join { r#as, .. } => r#as.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayStep {
    pub duration: u64,
    pub step: Box<Step>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopStep {
    #[serde(rename = "endWorkflow", default)]
    pub end_workflow: Option<bool>,
}

// -- Policies -----------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyBlock {
    #[serde(default)]
    pub global: Option<GlobalPolicy>,
    #[serde(default)]
    pub step: Option<StepPolicyBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalPolicy {
    #[serde(default)]
    pub timeout: Option<TimeoutPolicy>,
    #[serde(rename = "retryPolicy", default)]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepPolicyBlock {
    #[serde(default)]
    pub timeout: Option<TimeoutPolicy>,
    #[serde(rename = "retryPolicy", default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub request: Option<StepTypePolicy>,
    #[serde(default)]
    pub condition: Option<StepTypePolicy>,
    #[serde(rename = "loop", default)]
    pub loop_: Option<StepTypePolicy>,
    #[serde(default)]
    pub transform: Option<StepTypePolicy>,
    #[serde(default)]
    pub delay: Option<StepTypePolicy>,
    #[serde(default)]
    pub stop: Option<StepTypePolicy>,
}

impl StepPolicyBlock {
    pub fn for_type(&self, step_type: StepType) -> Option<&StepTypePolicy> {
        match step_type {
            StepType::Request => self.request.as_ref(),
            StepType::Condition => self.condition.as_ref(),
            StepType::Loop => self.loop_.as_ref(),
            StepType::Transform => self.transform.as_ref(),
            StepType::Delay => self.delay.as_ref(),
            StepType::Stop => self.stop.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTypePolicy {
    #[serde(default)]
    pub timeout: Option<TimeoutPolicy>,
    #[serde(rename = "retryPolicy", default)]
    pub retry_policy: Option<RetryPolicy>,
}

/// Per-step policy override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepPolicies {
    #[serde(default)]
    pub timeout: Option<TimeoutPolicy>,
    #[serde(rename = "retryPolicy", default)]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(rename = "expressionEval", default)]
    pub expression_eval: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    #[serde(rename = "retryableErrors", default)]
    pub retryable_errors: Vec<String>,
    #[serde(rename = "retryDelay", default)]
    pub retry_delay: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: u64,
    pub multiplier: f64,
    #[serde(rename = "maxDelay")]
    pub max_delay: u64,
    #[serde(default)]
    pub strategy: Option<BackoffStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

// -- Execution-time results ----------------------------------------------

/// The wrapped result stored for every completed step. Request-step
/// payloads live under `result`; `metadata` always carries `timestamp` plus
/// step-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub result: Option<Value>,
    pub metadata: serde_json::Map<String, Value>,
}

impl StepResult {
    pub fn new(step_type: StepType, result: Option<Value>) -> Self {
        StepResult {
            step_type,
            result,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Represent this result the way the reference resolver sees it on the
    /// wire: `{result, type, metadata}`.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "result": self.result,
            "type": self.step_type.to_string(),
            "metadata": self.metadata,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Aborted,
}

/// Insertion-order-preserving map from step name to its terminal result
///.
pub type StepResultMap = IndexMap<String, StepResult>;
/// Insertion-order-preserving map from step name to its current status.
pub type StepStatusMap = IndexMap<String, StepStatus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_step() {
        let yaml = r#"
name: simple
steps:
  - name: getUser
    request:
      method: user.get
      params:
        id: 1
"#;
        let flow = Flow::from_yaml_str(yaml).unwrap();
        assert_eq!(flow.steps.len(), 1);
        assert_eq!(flow.steps[0].step_type(), StepType::Request);
        match &flow.steps[0].kind {
            StepKind::Request { request } => assert_eq!(request.method, "user.get"),
            _ => panic!("expected request step"),
        }
    }

    #[test]
    fn parses_loop_step_with_nested_request() {
        let yaml = r#"
name: loopy
steps:
  - name: process
    loop:
      over: "${getUsers.result}"
      as: u
      condition: "${u.active}"
      step:
        name: touch
        request:
          method: user.touch
          params:
            id: "${u.id}"
"#;
        let flow = Flow::from_yaml_str(yaml).unwrap();
        match &flow.steps[0].kind {
            StepKind::Loop { loop_ } => {
                assert_eq!(loop_.as_ident, "u");
                assert_eq!(loop_.body().len(), 1);
            }
            _ => panic!("expected loop step"),
        }
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let yaml = r#"
name: dup
steps:
  - name: a
    stop: {}
  - name: a
    stop: {}
"#;
        let flow = Flow::from_yaml_str(yaml).unwrap();
        assert!(flow.validate_unique_names().is_err());
    }

    #[test]
    fn step_result_wraps_payload_for_reference_resolution() {
        let result = StepResult::new(StepType::Request, Some(Value::String("hi".into())))
            .with_metadata("requestId", 1);
        let value = result.to_value();
        assert_eq!(value["result"], Value::String("hi".into()));
        assert_eq!(value["type"], Value::String("request".into()));
        assert_eq!(value["metadata"]["requestId"], 1);
    }
}
