//! Channel lifecycle
//!
//! The manager owns the registered channel definitions and, for every
//! deployed channel, its [`Pipeline`] and (for listening sources) its
//! [`MllpServer`]. Deploying validates the source connector, runs the deploy
//! script and then starts the listener; undeploying stops the listener and
//! runs the undeploy script.

use crate::codec::Message;
use crate::pipeline::{Pipeline, PipelineError, ProcessOutcome};
use crate::scripting::{GlobalMaps, ScriptExecutor};
use crate::transport::{HandlerError, MessageHandler, MllpServer, Reply, TransportError};
use crate::types::{Channel, ResponseMode};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;

/// Lifecycle errors
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("channel {0} not found")]
    NotFound(String),

    #[error("channel {0} is already deployed")]
    AlreadyDeployed(String),

    #[error("channel {0} is not deployed")]
    NotDeployed(String),

    #[error("invalid configuration for channel {channel}: {reason}")]
    Config { channel: String, reason: String },

    #[error(transparent)]
    Script(#[from] PipelineError),

    #[error("destination {connector} failed: {source}")]
    Destination {
        connector: String,
        source: PipelineError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type ManagerResult<T> = std::result::Result<T, ManagerError>;

/// Turns pipeline outcomes into transport replies for one channel
pub struct ChannelHandler {
    pipeline: Arc<Pipeline>,
    response: ResponseMode,
}

impl ChannelHandler {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let response = pipeline.channel().source_connector.properties.response;
        Self { pipeline, response }
    }

    /// Process a message and pick the reply
    pub fn reply(&self, message: Message) -> ManagerResult<Reply> {
        let outcome = match self.pipeline.process(message)? {
            Some(outcome) => outcome,
            // Filtered messages are still acknowledged
            None => return Ok(Reply::Ack),
        };
        self.select_reply(outcome)
    }

    fn select_reply(&self, outcome: ProcessOutcome) -> ManagerResult<Reply> {
        if let Some(failed) = outcome.failed_destinations().next() {
            if let Err(source) = &failed.outcome {
                return Err(ManagerError::Destination {
                    connector: failed.connector.clone(),
                    source: source.clone(),
                });
            }
        }

        Ok(match self.response {
            ResponseMode::SourceMessage => Reply::Message(outcome.source.message),
            ResponseMode::AutoAck => Reply::Ack,
        })
    }
}

impl MessageHandler for ChannelHandler {
    fn handle(&self, message: Message) -> Result<Reply, HandlerError> {
        self.reply(message).map_err(Into::into)
    }
}

struct Deployment {
    pipeline: Arc<Pipeline>,
    server: Option<MllpServer>,
}

/// Registry and lifecycle of channels
pub struct ChannelManager {
    executor: Arc<dyn ScriptExecutor>,
    globals: GlobalMaps,
    channels: RwLock<BTreeMap<String, Channel>>,
    deployed: Mutex<HashMap<String, Deployment>>,
    debug: AtomicBool,
}

impl ChannelManager {
    pub fn new(globals: GlobalMaps, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            executor,
            globals,
            channels: RwLock::new(BTreeMap::new()),
            deployed: Mutex::new(HashMap::new()),
            debug: AtomicBool::new(false),
        }
    }

    pub fn globals(&self) -> &GlobalMaps {
        &self.globals
    }

    /// Clear the global and global-channel maps
    pub fn clear_global_maps(&self) {
        tracing::info!("Clearing global maps");
        self.globals.clear();
    }

    /// Register or replace a channel definition
    ///
    /// A replaced definition takes effect on the next deploy.
    pub fn add_channel(&self, channel: Channel) -> Option<Channel> {
        let id = channel.id().to_string();
        tracing::debug!(channel = %id, name = %channel.name, "Channel registered");
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, channel)
    }

    /// Undeploy if needed and forget the channel
    pub async fn remove_channel(&self, id: &str) -> ManagerResult<Channel> {
        if self.is_deployed(id).await {
            self.undeploy(id).await?;
        }
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    pub fn channel(&self, id: &str) -> Option<Channel> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Registered channels ordered by id
    pub fn channels(&self) -> Vec<Channel> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub async fn is_deployed(&self, id: &str) -> bool {
        self.deployed.lock().await.contains_key(id)
    }

    pub async fn deployed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.deployed.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pipeline of a deployed channel
    pub async fn pipeline(&self, id: &str) -> Option<Arc<Pipeline>> {
        self.deployed.lock().await.get(id).map(|d| d.pipeline.clone())
    }

    /// Listener address of a deployed channel
    pub async fn local_addr(&self, id: &str) -> Option<SocketAddr> {
        self.deployed
            .lock()
            .await
            .get(id)
            .and_then(|d| d.server.as_ref())
            .and_then(MllpServer::local_addr)
    }

    /// Toggle payload logging for every deployed channel
    pub async fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
        for deployment in self.deployed.lock().await.values() {
            deployment.pipeline.set_debug(enabled);
            if let Some(server) = &deployment.server {
                server.set_debug(enabled);
            }
        }
        tracing::info!(enabled, "Debug mode changed");
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Deploy a registered channel
    ///
    /// Returns the listener address when the source connector listens.
    pub async fn deploy(&self, id: &str) -> ManagerResult<Option<SocketAddr>> {
        let channel = self.channel(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        let mut deployed = self.deployed.lock().await;
        if deployed.contains_key(id) {
            return Err(ManagerError::AlreadyDeployed(id.to_string()));
        }

        let listener = listener_address(&channel)?;

        let pipeline = Arc::new(Pipeline::new(channel, self.globals.clone(), self.executor.clone()));
        pipeline.set_debug(self.is_debug());
        run_blocking({
            let pipeline = pipeline.clone();
            move || pipeline.deploy()
        })
        .await??;

        let server = match listener {
            Some((host, port)) => {
                let server = MllpServer::new(
                    pipeline.channel().name.clone(),
                    &host,
                    port,
                    Arc::new(ChannelHandler::new(pipeline.clone())),
                );
                server.set_debug(self.is_debug());
                server.start().await?;
                Some(server)
            }
            None => None,
        };
        let addr = server.as_ref().and_then(MllpServer::local_addr);

        tracing::info!(channel = %id, addr = ?addr, "Channel deployed");
        deployed.insert(id.to_string(), Deployment { pipeline, server });
        Ok(addr)
    }

    /// Stop a deployed channel's listener, then run its undeploy script
    pub async fn undeploy(&self, id: &str) -> ManagerResult<()> {
        let deployment = {
            let mut deployed = self.deployed.lock().await;
            match deployed.remove(id) {
                Some(deployment) => deployment,
                None if self.channel(id).is_some() => return Err(ManagerError::NotDeployed(id.to_string())),
                None => return Err(ManagerError::NotFound(id.to_string())),
            }
        };

        if let Some(server) = &deployment.server {
            server.stop().await;
        }
        let pipeline = deployment.pipeline;
        run_blocking(move || pipeline.undeploy()).await??;

        tracing::info!(channel = %id, "Channel undeployed");
        Ok(())
    }

    /// Deploy every enabled channel that is not running yet
    pub async fn deploy_all(&self) -> Vec<(String, ManagerResult<Option<SocketAddr>>)> {
        let mut results = Vec::new();
        for channel in self.channels() {
            let id = channel.id().to_string();
            if !channel.enabled {
                tracing::info!(channel = %id, "Skipping disabled channel");
                continue;
            }
            if self.is_deployed(&id).await {
                continue;
            }
            let result = self.deploy(&id).await;
            if let Err(e) = &result {
                tracing::error!(channel = %id, "Deploy failed: {}", e);
            }
            results.push((id, result));
        }
        results
    }

    /// Undeploy every deployed channel
    pub async fn undeploy_all(&self) -> Vec<(String, ManagerResult<()>)> {
        let mut results = Vec::new();
        for id in self.deployed_ids().await {
            let result = self.undeploy(&id).await;
            if let Err(e) = &result {
                tracing::error!(channel = %id, "Undeploy failed: {}", e);
            }
            results.push((id, result));
        }
        results
    }

    /// Run a message through a deployed channel without the transport
    pub async fn dispatch(&self, id: &str, message: Message) -> ManagerResult<Reply> {
        let pipeline = match self.pipeline(id).await {
            Some(pipeline) => pipeline,
            None if self.channel(id).is_some() => return Err(ManagerError::NotDeployed(id.to_string())),
            None => return Err(ManagerError::NotFound(id.to_string())),
        };
        let handler = ChannelHandler::new(pipeline);
        run_blocking(move || handler.reply(message)).await?
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channels().len())
            .field("debug", &self.is_debug())
            .finish()
    }
}

/// Host and port the source connector must listen on, if any
fn listener_address(channel: &Channel) -> ManagerResult<Option<(String, u16)>> {
    let source = &channel.source_connector;
    if !source.transport.requires_listener() {
        return Ok(None);
    }

    let config_error = |reason: &str| ManagerError::Config {
        channel: channel.id().to_string(),
        reason: reason.to_string(),
    };
    let listener = source
        .properties
        .listener
        .as_ref()
        .ok_or_else(|| config_error("listening source connector has no listener properties"))?;
    let port = listener
        .port
        .ok_or_else(|| config_error("listening source connector has no port"))?;
    Ok(Some((listener.host.clone(), port)))
}

/// Run script work off the async worker threads
async fn run_blocking<T, F>(f: F) -> ManagerResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ManagerError::Task(e.to_string()))
}
