//! The stop executor: terminates the flow. `endWorkflow: true` (the
//! default) aborts the whole run via the root [`AbortScope`]; otherwise it
//! only ends the branch it's part of (the condition/loop caller simply
//! stops walking its own nested steps).

use flowcraft_core::error::FlowResult;
use flowcraft_core::model::{StepResult, StepType, StopStep};

use crate::abort::{AbortReason, AbortScope};
use crate::events::timestamp;

pub async fn execute(step_name: &str, stop: &StopStep, abort: &AbortScope) -> FlowResult<StepResult> {
    let end_workflow = stop.end_workflow.unwrap_or(true);
    if end_workflow {
        abort.cancel(AbortReason::Stop { step: step_name.to_string() });
    }

    Ok(StepResult::new(StepType::Stop, None)
        .with_metadata("endWorkflow", end_workflow)
        .with_metadata("timestamp", timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn end_workflow_true_cancels_scope() {
        let abort = AbortScope::root();
        let stop = StopStep { end_workflow: Some(true) };
        let result = execute("halt", &stop, &abort).await.unwrap();
        assert!(abort.is_cancelled());
        assert_eq!(result.metadata["endWorkflow"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn end_workflow_false_leaves_scope_running() {
        let abort = AbortScope::root();
        let stop = StopStep { end_workflow: Some(false) };
        let _ = execute("halt", &stop, &abort).await.unwrap();
        assert!(!abort.is_cancelled());
    }

    #[tokio::test]
    async fn defaults_to_ending_workflow() {
        let abort = AbortScope::root();
        let stop = StopStep { end_workflow: None };
        let _ = execute("halt", &stop, &abort).await.unwrap();
        assert!(abort.is_cancelled());
    }
}
