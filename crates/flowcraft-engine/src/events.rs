//! The structured event stream.
//!
//! Subscribers are plain callbacks invoked synchronously on the emitter
//! "thread" (the calling task) -- matching 's "Event subscribers run
//! synchronously on the emitter thread; they must not block." Options
//! gate which families fire and how much payload they carry.

use std::sync::{Arc, Mutex};

use flowcraft_core::model::{StepResult, StepType};
use serde_json::Value;

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[derive(Debug, Clone)]
pub enum Event {
    FlowStart {
        flow: String,
        timestamp: u64,
    },
    FlowComplete {
        flow: String,
        timestamp: u64,
        duration_ms: u64,
        results: Option<Value>,
    },
    FlowError {
        flow: String,
        timestamp: u64,
        step: Option<String>,
        error: String,
    },
    FlowAborted {
        flow: String,
        timestamp: u64,
        reason: String,
    },
    FlowTimeout {
        flow: String,
        timestamp: u64,
        timeout_ms: u64,
    },
    StepStart {
        step: String,
        timestamp: u64,
        step_type: StepType,
        correlation: Option<String>,
        context_snapshot: Option<Value>,
    },
    StepComplete {
        step: String,
        timestamp: u64,
        step_type: StepType,
        duration_ms: u64,
        result: Option<StepResult>,
        correlation: Option<String>,
    },
    StepError {
        step: String,
        timestamp: u64,
        step_type: StepType,
        error: String,
        correlation: Option<String>,
    },
    StepSkip {
        step: String,
        timestamp: u64,
        reason: String,
    },
    StepProgress {
        step: String,
        timestamp: u64,
        iteration: u64,
        total_iterations: Option<u64>,
        percent: Option<f64>,
    },
    StepRetry {
        step: String,
        timestamp: u64,
        attempt: u32,
        error: String,
        delay_ms: u64,
    },
    StepTimeout {
        step: String,
        timestamp: u64,
        timeout_ms: u64,
    },
    StepAborted {
        step: String,
        timestamp: u64,
        reason: String,
    },
    DependencyResolved {
        flow: String,
        timestamp: u64,
        ordered_steps: Vec<String>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::FlowStart { .. } => "flow:start",
            Event::FlowComplete { .. } => "flow:complete",
            Event::FlowError { .. } => "flow:error",
            Event::FlowAborted { .. } => "flow:aborted",
            Event::FlowTimeout { .. } => "flow:timeout",
            Event::StepStart { .. } => "step:start",
            Event::StepComplete { .. } => "step:complete",
            Event::StepError { .. } => "step:error",
            Event::StepSkip { .. } => "step:skip",
            Event::StepProgress { .. } => "step:progress",
            Event::StepRetry { .. } => "step:retry",
            Event::StepTimeout { .. } => "step:timeout",
            Event::StepAborted { .. } => "step:aborted",
            Event::DependencyResolved { .. } => "dependency:resolved",
        }
    }

    fn is_flow_event(&self) -> bool {
        matches!(
            self,
            Event::FlowStart { .. } | Event::FlowComplete { .. } | Event::FlowError { .. } | Event::FlowAborted { .. } | Event::FlowTimeout { .. }
        )
    }

    fn is_step_event(&self) -> bool {
        matches!(
            self,
            Event::StepStart { .. }
                | Event::StepComplete { .. }
                | Event::StepError { .. }
                | Event::StepSkip { .. }
                | Event::StepProgress { .. }
                | Event::StepRetry { .. }
                | Event::StepTimeout { .. }
                | Event::StepAborted { .. }
        )
    }

    fn is_dependency_event(&self) -> bool {
        matches!(self, Event::DependencyResolved { .. })
    }
}

/// Gates which event families fire and how much payload they carry.
#[derive(Debug, Clone)]
pub struct EventOptions {
    pub emit_flow_events: bool,
    pub emit_step_events: bool,
    pub emit_dependency_events: bool,
    pub include_results: bool,
    pub include_context: bool,
}

impl Default for EventOptions {
    fn default() -> Self {
        EventOptions {
            emit_flow_events: true,
            emit_step_events: true,
            emit_dependency_events: true,
            include_results: true,
            include_context: false,
        }
    }
}

impl EventOptions {
    /// Merge `patch` into `self`, leaving unspecified fields untouched --
    /// mirrors `updateEventOptions(partial)`.
    pub fn merge(&mut self, patch: EventOptionsPatch) {
        if let Some(v) = patch.emit_flow_events {
            self.emit_flow_events = v;
        }
        if let Some(v) = patch.emit_step_events {
            self.emit_step_events = v;
        }
        if let Some(v) = patch.emit_dependency_events {
            self.emit_dependency_events = v;
        }
        if let Some(v) = patch.include_results {
            self.include_results = v;
        }
        if let Some(v) = patch.include_context {
            self.include_context = v;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventOptionsPatch {
    pub emit_flow_events: Option<bool>,
    pub emit_step_events: Option<bool>,
    pub emit_dependency_events: Option<bool>,
    pub include_results: Option<bool>,
    pub include_context: Option<bool>,
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Typed, optional event stream. Cloning shares the same
/// subscriber list and options -- the flow executor and its nested
/// dispatch entry point both emit through one instance.
#[derive(Clone)]
pub struct EventEmitter {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    options: Arc<Mutex<EventOptions>>,
}

impl EventEmitter {
    pub fn new(options: EventOptions) -> Self {
        EventEmitter {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            options: Arc::new(Mutex::new(options)),
        }
    }

    pub fn subscribe(&self, f: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Arc::new(f));
    }

    pub fn update_options(&self, patch: EventOptionsPatch) {
        self.options.lock().unwrap().merge(patch);
    }

    pub fn options(&self) -> EventOptions {
        self.options.lock().unwrap().clone()
    }

    pub fn include_results(&self) -> bool {
        self.options.lock().unwrap().include_results
    }

    pub fn include_context(&self) -> bool {
        self.options.lock().unwrap().include_context
    }

    pub fn emit(&self, event: Event) {
        let opts = self.options.lock().unwrap();
        let enabled = (event.is_flow_event() && opts.emit_flow_events)
            || (event.is_step_event() && opts.emit_step_events)
            || (event.is_dependency_event() && opts.emit_dependency_events);
        drop(opts);
        if !enabled {
            return;
        }
        log::trace!("emitting event {}", event.name());
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber(&event);
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(EventOptions::default())
    }
}

pub fn timestamp() -> u64 {
    now_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn disabled_family_is_not_emitted() {
        let emitter = EventEmitter::default();
        emitter.update_options(EventOptionsPatch {
            emit_step_events: Some(false),
            ..Default::default()
        });
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        emitter.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(Event::StepStart {
            step: "a".to_string(),
            timestamp: 0,
            step_type: StepType::Request,
            correlation: None,
            context_snapshot: None,
        });
        emitter.emit(Event::FlowStart {
            flow: "f".to_string(),
            timestamp: 0,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
