//! Policy resolution: effective timeout and retry policy by precedence
//!: `override > step.policies > flow.policies.step[type] >
//! flow.policies.step > flow.policies.global > default`.

use flowcraft_core::model::{Flow, RetryPolicy, Step, StepType};

/// Default timeouts per step type, in milliseconds.
pub fn default_timeout_ms(step_type: StepType) -> u64 {
    match step_type {
        StepType::Request => 5_000,
        StepType::Condition => 5_000,
        StepType::Loop => 60_000,
        StepType::Transform => 10_000,
        StepType::Delay => 10_000,
        StepType::Stop => 1_000,
    }
}

pub const DEFAULT_GLOBAL_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_EXPRESSION_TIMEOUT_MS: u64 = 1_000;

/// Resolve the effective step timeout for `step`, honoring an explicit
/// caller `override_ms` first.
pub fn resolve_timeout(flow: &Flow, step: &Step, override_ms: Option<u64>) -> u64 {
    if let Some(ms) = override_ms {
        return ms;
    }
    let step_type = step.step_type();

    if let Some(ms) = step.policies.as_ref().and_then(|p| p.timeout).and_then(|t| t.timeout) {
        return ms;
    }

    if let Some(policies) = &flow.policies {
        if let Some(step_block) = &policies.step {
            if let Some(ms) = step_block.for_type(step_type).and_then(|t| t.timeout).and_then(|t| t.timeout) {
                return ms;
            }
            if let Some(ms) = step_block.timeout.and_then(|t| t.timeout) {
                return ms;
            }
        }
        if let Some(ms) = policies.global.as_ref().and_then(|g| g.timeout).and_then(|t| t.timeout) {
            return ms;
        }
    }

    default_timeout_ms(step_type)
}

/// Resolve the flow-level (global) timeout, if any is configured (
/// `execute`: "if policy resolves a global timeout").
pub fn resolve_global_timeout(flow: &Flow) -> Option<u64> {
    flow.policies.as_ref().and_then(|p| p.global.as_ref()).and_then(|g| g.timeout).and_then(|t| t.timeout)
}

/// Resolve the expression-evaluation deadline for `step` (or the global
/// default when none is configured anywhere in the precedence chain).
pub fn resolve_expression_timeout(flow: &Flow, step: Option<&Step>) -> u64 {
    if let Some(step) = step {
        if let Some(ms) = step.policies.as_ref().and_then(|p| p.timeout).and_then(|t| t.expression_eval) {
            return ms;
        }
        if let Some(policies) = &flow.policies {
            if let Some(step_block) = &policies.step {
                if let Some(ms) = step_block
                    .for_type(step.step_type())
                    .and_then(|t| t.timeout)
                    .and_then(|t| t.expression_eval)
                {
                    return ms;
                }
                if let Some(ms) = step_block.timeout.and_then(|t| t.expression_eval) {
                    return ms;
                }
            }
        }
    }
    if let Some(ms) = flow
        .policies
        .as_ref()
        .and_then(|p| p.global.as_ref())
        .and_then(|g| g.timeout)
        .and_then(|t| t.expression_eval)
    {
        return ms;
    }
    DEFAULT_EXPRESSION_TIMEOUT_MS
}

/// Resolve the effective retry policy for `step`, or `None` if no policy
/// applies anywhere in the precedence chain (no retries are attempted).
pub fn resolve_retry_policy<'a>(flow: &'a Flow, step: &'a Step, override_policy: Option<&'a RetryPolicy>) -> Option<&'a RetryPolicy> {
    if let Some(p) = override_policy {
        return Some(p);
    }
    let step_type = step.step_type();

    if let Some(p) = step.policies.as_ref().and_then(|p| p.retry_policy.as_ref()) {
        return Some(p);
    }

    if let Some(policies) = &flow.policies {
        if let Some(step_block) = &policies.step {
            if let Some(p) = step_block.for_type(step_type).and_then(|t| t.retry_policy.as_ref()) {
                return Some(p);
            }
            if let Some(p) = step_block.retry_policy.as_ref() {
                return Some(p);
            }
        }
        if let Some(p) = policies.global.as_ref().and_then(|g| g.retry_policy.as_ref()) {
            return Some(p);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcraft_core::model::Flow;

    fn flow_with_step_override() -> Flow {
        Flow::from_yaml_str(
            r#"
name: f
policies:
  global:
    timeout:
      timeout: 100
  step:
    request:
      timeout:
        timeout: 200
steps:
  - name: r
    policies:
      timeout:
        timeout: 300
    request:
      method: m
      params: null
  - name: r2
    request:
      method: m
      params: null
"#,
        )
        .unwrap()
    }

    #[test]
    fn step_override_wins_over_type_and_global() {
        let flow = flow_with_step_override();
        let step = flow.step("r").unwrap();
        assert_eq!(resolve_timeout(&flow, step, None), 300);
    }

    #[test]
    fn step_type_policy_wins_over_global() {
        let flow = flow_with_step_override();
        let step = flow.step("r2").unwrap();
        assert_eq!(resolve_timeout(&flow, step, None), 200);
    }

    #[test]
    fn caller_override_wins_over_everything() {
        let flow = flow_with_step_override();
        let step = flow.step("r").unwrap();
        assert_eq!(resolve_timeout(&flow, step, Some(42)), 42);
    }

    #[test]
    fn falls_back_to_step_type_default() {
        let flow = Flow::from_yaml_str(
            r#"
name: f
steps:
  - name: s
    stop: {}
"#,
        )
        .unwrap();
        let step = flow.step("s").unwrap();
        assert_eq!(resolve_timeout(&flow, step, None), default_timeout_ms(StepType::Stop));
    }
}
