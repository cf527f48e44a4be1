//! Test doubles and observation helpers

use crossbeam_channel::Receiver;
use hl7_engine::codec::Message;
use hl7_engine::pipeline::TaskEvent;
use hl7_engine::scripting::{RhaiExecutor, ScriptExecutor, ScriptResult, ScriptValue, StageContext};
use std::sync::{Arc, Mutex};

/// Executor that records every script it runs before delegating to Rhai
#[derive(Default)]
pub struct RecordingExecutor {
    inner: RhaiExecutor,
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(stage, script)` pairs in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ran(&self, script: &str) -> bool {
        self.calls().iter().any(|(_, s)| s == script)
    }
}

impl ScriptExecutor for RecordingExecutor {
    fn execute(&self, script: &str, message: &mut Message, ctx: &StageContext) -> ScriptResult<ScriptValue> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.stage.to_string(), script.to_string()));
        self.inner.execute(script, message, ctx)
    }
}

/// Drain whatever events are already queued
pub fn drain_events(events: &Receiver<TaskEvent>) -> Vec<TaskEvent> {
    events.try_iter().collect()
}
