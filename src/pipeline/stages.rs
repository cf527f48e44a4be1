//! Filter and transformer evaluation for one connector.

use crate::codec::Message;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::task::{Observers, ScriptTask};
use crate::scripting::{ScriptExecutor, ScriptValue, Stage, StageContext};
use crate::types::{Connector, Filter, ScriptKind, Transformer};

/// Result of running one connector over a message
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorResult {
    /// Whether the connector's filter accepted the message
    pub passed: bool,
    /// Message after the transformer (unchanged when filtered)
    pub message: Message,
}

/// Runs connector stages through an executor, reporting to observers
#[derive(Clone, Copy)]
pub struct StageRunner<'a> {
    executor: &'a dyn ScriptExecutor,
    observers: &'a Observers,
}

impl<'a> StageRunner<'a> {
    pub fn new(executor: &'a dyn ScriptExecutor, observers: &'a Observers) -> Self {
        Self { executor, observers }
    }

    /// Filter, then transform when the filter passes
    pub fn connector(&self, connector: &Connector, mut message: Message, ctx: &StageContext) -> PipelineResult<ConnectorResult> {
        let passed = self.filter(&connector.filter, &mut message, &ctx.for_stage(Stage::Filter))?;
        if !passed {
            tracing::debug!(channel = %ctx.channel_id, connector = %connector.name, "Message filtered");
            return Ok(ConnectorResult { passed, message });
        }

        self.transform(&connector.transformer, &mut message, &ctx.for_stage(Stage::Transformer))?;
        Ok(ConnectorResult { passed, message })
    }

    /// First enabled rule returning exactly `true` passes the filter
    ///
    /// No enabled rules passes vacuously. A rule that throws counts as not
    /// passed; a halted rule ends evaluation with an error.
    pub fn filter(&self, filter: &Filter, message: &mut Message, ctx: &StageContext) -> PipelineResult<bool> {
        let mut rules = filter.enabled_rules().peekable();
        if rules.peek().is_none() {
            return Ok(true);
        }

        while let Some(rule) = rules.next() {
            let task = ScriptTask::new(rule.display_name(), &rule.script, ctx);
            if rule.kind != ScriptKind::Script {
                tracing::warn!(channel = %ctx.channel_id, rule = rule.display_name(), "Skipping rule without an executable script");
                task.cancel(self.observers);
                continue;
            }

            match task.run(self.executor, message, self.observers) {
                Ok(value) if value.is_true() => {
                    for rest in rules {
                        ScriptTask::new(rest.display_name(), &rest.script, ctx).cancel(self.observers);
                    }
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    return Err(connector_error(ctx, rule.display_name(), e));
                }
                Err(e) => {
                    tracing::warn!(channel = %ctx.channel_id, rule = rule.display_name(), "Rule failed, treating as not passed: {}", e);
                }
            }
        }

        Ok(false)
    }

    /// Apply enabled steps in order; any step failure aborts the connector
    pub fn transform(&self, transformer: &Transformer, message: &mut Message, ctx: &StageContext) -> PipelineResult<()> {
        let mut steps = transformer.enabled_steps();
        while let Some(step) = steps.next() {
            let task = ScriptTask::new(step.display_name(), &step.script, ctx);
            if step.kind != ScriptKind::Script {
                tracing::warn!(channel = %ctx.channel_id, step = step.display_name(), "Skipping step without an executable script");
                task.cancel(self.observers);
                continue;
            }

            match task.run(self.executor, message, self.observers) {
                Ok(ScriptValue::Message(replacement)) => *message = replacement,
                Ok(_) => {}
                Err(e) => {
                    for rest in steps {
                        ScriptTask::new(rest.display_name(), &rest.script, ctx).cancel(self.observers);
                    }
                    return Err(connector_error(ctx, step.display_name(), e));
                }
            }
        }
        Ok(())
    }
}

fn connector_error(ctx: &StageContext, item: &str, source: crate::scripting::ScriptError) -> PipelineError {
    PipelineError::Connector {
        connector: ctx.connector_name.clone().unwrap_or_default(),
        stage: ctx.stage,
        item: item.to_string(),
        source,
    }
}
