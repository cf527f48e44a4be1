//! Script tasks and their observers
//!
//! Every script a channel runs is wrapped in a [`ScriptTask`]. When the task
//! finishes its tagged [`TaskOutcome`] is handed to every registered
//! observer, which is how monitoring (and tests) follow a message through the
//! pipeline without hooking into the stages themselves.

use crate::codec::Message;
use crate::scripting::{ScriptError, ScriptExecutor, ScriptResult, ScriptValue, Stage, StageContext};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// How a task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(ScriptValue),
    Error(ScriptError),
    /// Never ran: skipped, or an earlier task aborted its connector
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// Completion record delivered to observers
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub channel_id: String,
    pub connector: Option<String>,
    pub stage: Stage,
    /// Rule/step name, or the stage name for channel scripts
    pub label: String,
    pub outcome: TaskOutcome,
    pub elapsed: Duration,
}

/// Callback invoked with every finished task
pub type TaskObserver = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Registered observers, shared by all tasks of a pipeline
///
/// Channel subscribers are dropped once their receiver is gone.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<RwLock<Vec<TaskObserver>>>,
    subscribers: Arc<Mutex<Vec<Sender<TaskEvent>>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: TaskObserver) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Receive every task event on a channel
    pub fn subscribe(&self) -> Receiver<TaskEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        let callbacks = self.inner.read().unwrap_or_else(PoisonError::into_inner).len();
        callbacks + self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: &TaskEvent) {
        let observers = self.inner.read().unwrap_or_else(PoisonError::into_inner).clone();
        for observer in observers {
            observer(event);
        }

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("count", &self.len()).finish()
    }
}

/// One script execution bound to its stage context
pub struct ScriptTask<'a> {
    label: String,
    script: &'a str,
    ctx: &'a StageContext,
}

impl<'a> ScriptTask<'a> {
    pub fn new(label: impl Into<String>, script: &'a str, ctx: &'a StageContext) -> Self {
        Self {
            label: label.into(),
            script,
            ctx,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Execute the script and report the outcome
    pub fn run(
        self,
        executor: &dyn ScriptExecutor,
        message: &mut Message,
        observers: &Observers,
    ) -> ScriptResult<ScriptValue> {
        let started = Instant::now();
        let result = executor.execute(self.script, message, self.ctx);

        let outcome = match &result {
            Ok(value) => {
                tracing::trace!(channel = %self.ctx.channel_id, stage = %self.ctx.stage, task = %self.label, "Task finished");
                TaskOutcome::Success(value.clone())
            }
            Err(e) => {
                tracing::warn!(channel = %self.ctx.channel_id, stage = %self.ctx.stage, task = %self.label, "Task failed: {}", e);
                TaskOutcome::Error(e.clone())
            }
        };
        let elapsed = started.elapsed();
        observers.notify(&self.event(outcome, elapsed));
        result
    }

    /// Report the task as not run
    pub fn cancel(self, observers: &Observers) {
        tracing::debug!(channel = %self.ctx.channel_id, stage = %self.ctx.stage, task = %self.label, "Task cancelled");
        observers.notify(&self.event(TaskOutcome::Cancelled, Duration::ZERO));
    }

    fn event(&self, outcome: TaskOutcome, elapsed: Duration) -> TaskEvent {
        TaskEvent {
            channel_id: self.ctx.channel_id.clone(),
            connector: self.ctx.connector_name.clone(),
            stage: self.ctx.stage,
            label: self.label.clone(),
            outcome,
            elapsed,
        }
    }
}
