//! Channel processor: runs one message through a channel.
//!
//! Per message:
//! 1. Preprocessor script (a returned message replaces the working message).
//! 2. Source connector filter and transformer. A rejected message ends here
//!    with no result.
//! 3. Every enabled destination, in parallel, each on its own copy of the
//!    post-source message.
//! 4. Postprocessor script over the source message (return value ignored).
//!
//! Message turns are serialized per channel, so the channel and connector
//! maps only ever see one message at a time.

use crate::codec::Message;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::stages::{ConnectorResult, StageRunner};
use crate::pipeline::task::{Observers, ScriptTask, TaskEvent, TaskObserver};
use crate::scripting::{GlobalMaps, ScopedMap, ScopedMaps, ScriptExecutor, ScriptValue, SharedMap, Stage, StageContext};
use crate::types::{Channel, Connector};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Outcome of one destination connector
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationResult {
    pub connector: String,
    pub meta_data_id: Option<u32>,
    pub outcome: PipelineResult<ConnectorResult>,
}

impl DestinationResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Composite result of a message that passed the source filter
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub source: ConnectorResult,
    /// In configured connector order
    pub destinations: Vec<DestinationResult>,
}

impl ProcessOutcome {
    pub fn failed_destinations(&self) -> impl Iterator<Item = &DestinationResult> {
        self.destinations.iter().filter(|d| !d.is_ok())
    }
}

/// Per-channel message processor
pub struct Pipeline {
    channel: Channel,
    executor: Arc<dyn ScriptExecutor>,
    globals: GlobalMaps,
    channel_map: SharedMap,
    response_map: SharedMap,
    source_map: SharedMap,
    /// One per configured destination, same order
    destination_maps: Vec<SharedMap>,
    observers: Observers,
    turn: Mutex<()>,
    debug: AtomicBool,
}

impl Pipeline {
    pub fn new(channel: Channel, globals: GlobalMaps, executor: Arc<dyn ScriptExecutor>) -> Self {
        let destination_maps = channel
            .destination_connectors
            .iter()
            .map(|_| ScopedMap::shared())
            .collect();

        Self {
            channel,
            executor,
            globals,
            channel_map: ScopedMap::shared(),
            response_map: ScopedMap::shared(),
            source_map: ScopedMap::shared(),
            destination_maps,
            observers: Observers::new(),
            turn: Mutex::new(()),
            debug: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn channel_map(&self) -> &SharedMap {
        &self.channel_map
    }

    pub fn response_map(&self) -> &SharedMap {
        &self.response_map
    }

    pub fn source_map(&self) -> &SharedMap {
        &self.source_map
    }

    pub fn destination_map(&self, index: usize) -> Option<&SharedMap> {
        self.destination_maps.get(index)
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Register a callback for every finished script task
    pub fn observe(&self, observer: TaskObserver) {
        self.observers.add(observer);
    }

    /// Receive every finished script task on a channel
    pub fn subscribe(&self) -> Receiver<TaskEvent> {
        self.observers.subscribe()
    }

    /// Clear the channel, connector and response maps
    pub fn clear_maps(&self) {
        self.channel_map.clear();
        self.response_map.clear();
        self.source_map.clear();
        for map in &self.destination_maps {
            map.clear();
        }
    }

    fn context(&self, stage: Stage, connector: &Connector, connector_map: &SharedMap) -> StageContext {
        let maps = ScopedMaps::new(
            &self.globals,
            self.channel_map.clone(),
            connector_map.clone(),
            self.response_map.clone(),
        );
        StageContext::new(self.channel.id(), self.channel.name.clone(), stage, maps).with_connector(connector.name.clone())
    }

    fn runner(&self) -> StageRunner<'_> {
        StageRunner::new(self.executor.as_ref(), &self.observers)
    }

    /// Run a channel-level script; empty scripts are skipped
    fn channel_script(&self, stage: Stage, script: &str, message: &mut Message) -> PipelineResult<Option<ScriptValue>> {
        if script.trim().is_empty() {
            return Ok(None);
        }
        let ctx = self.context(stage, &self.channel.source_connector, &self.source_map);
        ScriptTask::new(stage.as_str(), script, &ctx)
            .run(self.executor.as_ref(), message, &self.observers)
            .map(Some)
            .map_err(|source| PipelineError::Channel {
                channel: self.channel.id().to_string(),
                stage,
                source,
            })
    }

    /// Run the on-deploy script
    pub fn deploy(&self) -> PipelineResult<()> {
        let _turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        self.channel_script(Stage::Deploy, &self.channel.deploy_script, &mut Message::new())
            .map(|_| ())
    }

    /// Run the on-undeploy script
    pub fn undeploy(&self) -> PipelineResult<()> {
        let _turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        self.channel_script(Stage::Undeploy, &self.channel.undeploy_script, &mut Message::new())
            .map(|_| ())
    }

    /// Process one decoded message
    ///
    /// `Ok(None)` means the source filter rejected the message.
    pub fn process(&self, message: Message) -> PipelineResult<Option<ProcessOutcome>> {
        let _turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        let channel_id = self.channel.id();
        self.response_map.clear();

        if self.is_debug() {
            tracing::debug!(channel = %channel_id, "Processing message:\n{}", message);
        }

        let mut working = message;
        if let Some(ScriptValue::Message(replacement)) =
            self.channel_script(Stage::Preprocessor, &self.channel.preprocessing_script, &mut working)?
        {
            working = replacement;
        }

        let source = &self.channel.source_connector;
        self.source_map.clear();
        let ctx = self.context(Stage::Filter, source, &self.source_map);
        let source_result = self.runner().connector(source, working, &ctx)?;
        if !source_result.passed {
            tracing::info!(channel = %channel_id, "Message rejected by source filter");
            return Ok(None);
        }

        let destinations = self.run_destinations(&source_result.message);
        if let Some(fatal) = destinations
            .iter()
            .find_map(|d| d.outcome.as_ref().err().filter(|e| e.is_fatal()))
        {
            return Err(fatal.clone());
        }

        let mut source_result = source_result;
        self.channel_script(Stage::Postprocessor, &self.channel.postprocessing_script, &mut source_result.message)?;

        let failed = destinations.iter().filter(|d| !d.is_ok()).count();
        tracing::debug!(channel = %channel_id, destinations = destinations.len(), failed, "Message processed");

        Ok(Some(ProcessOutcome {
            source: source_result,
            destinations,
        }))
    }

    /// Fan out to enabled destinations; each result is isolated
    fn run_destinations(&self, message: &Message) -> Vec<DestinationResult> {
        let runner = self.runner();
        let enabled: Vec<(&Connector, &SharedMap)> = self
            .channel
            .destination_connectors
            .iter()
            .zip(&self.destination_maps)
            .filter(|(connector, _)| connector.enabled)
            .collect();

        std::thread::scope(|scope| {
            let handles: Vec<_> = enabled
                .iter()
                .map(|&(connector, map)| {
                    let copy = message.clone();
                    let handle = scope.spawn(move || {
                        map.clear();
                        let ctx = self.context(Stage::Filter, connector, map);
                        runner.connector(connector, copy, &ctx)
                    });
                    (connector, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(connector, handle)| {
                    let outcome = handle
                        .join()
                        .unwrap_or_else(|_| Err(PipelineError::Panicked(connector.name.clone())));
                    if let Err(e) = &outcome {
                        tracing::warn!(channel = %self.channel.id(), connector = %connector.name, "Destination failed: {}", e);
                    }
                    DestinationResult {
                        connector: connector.name.clone(),
                        meta_data_id: connector.meta_data_id,
                        outcome,
                    }
                })
                .collect()
        })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("channel", &self.channel.id())
            .field("destinations", &self.destination_maps.len())
            .field("observers", &self.observers)
            .finish()
    }
}
