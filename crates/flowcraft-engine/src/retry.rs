//! The retry engine: run a unit operation with backoff, classify
//! retryable errors, and propagate cancellation. Modeled on
//! `fluent-agent/src/workflow/engine.rs::execute_with_retry` (attempt
//! counter, backoff-strategy match, `tokio::time::sleep` between
//! attempts), generalized from a fixed/exponential/linear enum to the
//! fuller `RetryPolicy` shape.

use std::future::Future;

use flowcraft_core::error::{FlowError, MaxRetriesExceededError};
use flowcraft_core::model::{BackoffStrategy, RetryPolicy};

use crate::abort::AbortScope;
use crate::events::{timestamp, Event, EventEmitter};

/// Delay before the `attempt`-th retry (1-based: `attempt=1` is the delay
/// before the *second* overall try), capped by `maxDelay`.
fn backoff_delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    let b = &policy.backoff;
    let strategy = b.strategy.unwrap_or_default();
    let raw = match strategy {
        BackoffStrategy::Exponential => (b.initial as f64) * b.multiplier.powi(attempt as i32 - 1),
        BackoffStrategy::Linear => (b.initial as f64) + b.multiplier * (attempt as f64 - 1.0),
    };
    (raw.max(0.0) as u64).min(b.max_delay)
}

fn is_retryable(policy: &RetryPolicy, err: &FlowError) -> bool {
    policy.retryable_errors.iter().any(|code| code == err.code())
}

/// Run `op` up to `policy.max_attempts` times, sleeping between attempts
/// per the configured backoff. Stops early (without retrying) when `err`
/// is not in `retryableErrors`, or when `abort` fires.
pub async fn run_with_retry<F, Fut, T>(policy: &RetryPolicy, abort: &AbortScope, events: &EventEmitter, step_name: &str, mut op: F) -> Result<T, FlowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FlowError>>,
{
    let mut attempt_errors: Vec<String> = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        if abort.is_cancelled() {
            return Err(abort_error(abort, step_name));
        }

        let result = op().await;
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_pause() {
                    return Err(err);
                }
                attempt_errors.push(err.to_string());

                if attempt >= policy.max_attempts || !is_retryable(policy, &err) {
                    // Terminal failure: the caller (top-level or nested
                    // dispatch) emits `step:timeout`/`step:error` for it, so
                    // don't double-emit here.
                    if attempt >= policy.max_attempts && is_retryable(policy, &err) {
                        return Err(FlowError::MaxRetriesExceeded(MaxRetriesExceededError {
                            step: step_name.to_string(),
                            attempts: attempt,
                            last: err.to_string(),
                            attempt_errors,
                        }));
                    }
                    return Err(err);
                }

                if let FlowError::Timeout(ref t) = err {
                    events.emit(Event::StepTimeout {
                        step: step_name.to_string(),
                        timestamp: timestamp(),
                        timeout_ms: t.timeout_ms,
                    });
                }

                let delay_ms = policy.retry_delay.unwrap_or_else(|| backoff_delay_ms(policy, attempt));
                events.emit(Event::StepRetry {
                    step: step_name.to_string(),
                    timestamp: timestamp(),
                    attempt,
                    error: err.to_string(),
                    delay_ms,
                });

                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {}
                    _ = abort.cancelled() => return Err(abort_error(abort, step_name)),
                }
            }
        }
    }
}

/// Map an already-cancelled scope's reason to the error a caller observing
/// that cancellation should see. `step_name` identifies the step that was
/// in flight when the cancellation was observed -- used only to label a
/// generic timeout; this is not the authoritative per-step timeout raised
/// directly by an executor's own deadline race (those carry their own
/// `timeout_ms`/`execution_time_ms`).
pub(crate) fn abort_error(abort: &AbortScope, step_name: &str) -> FlowError {
    use crate::abort::AbortReason;
    match abort.reason() {
        Some(AbortReason::Pause) => flowcraft_core::error::PauseError.into(),
        Some(AbortReason::Timeout) => FlowError::Timeout(flowcraft_core::error::TimeoutError::for_step(step_name, "unknown", 0, 0)),
        Some(other) => FlowError::State(flowcraft_core::error::StateError::Invalid {
            operation: "execute".to_string(),
            reason: format!("{other:?}"),
        }),
        None => FlowError::State(flowcraft_core::error::StateError::Invalid {
            operation: "execute".to_string(),
            reason: "aborted".to_string(),
        }),
    }
}
