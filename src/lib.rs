//! # HL7 Engine: a minimal clinical-integration engine
//!
//! Receives HL7 v2 messages over MLLP, runs them through a per-channel
//! pipeline of scripted filters and transformers, fans out to destinations
//! and answers the sender with a message or an acknowledgment.
//!
//! ## Architecture
//!
//! - **Transport**: MLLP framing over a tokio TCP listener per listening channel
//! - **Codec**: wire text to an addressable segment/field/component tree and back
//! - **Scripting**: sandboxed Rhai with five scoped variable maps and execution budgets
//! - **Pipeline**: preprocessor, source filter/transformer, parallel destinations, postprocessor
//! - **Manager**: deploy/undeploy lifecycle that wires channels to listeners
//!
//! ## Configuration
//!
//! Engine settings and channel definitions are TOML or JSON documents; see
//! [`config`]. The default settings file lives in the platform config
//! directory under `hl7-engine/engine.toml`.
//!
//! ## Example
//!
//! ```ignore
//! use hl7_engine::{
//!     config::EngineConfig,
//!     manager::ChannelManager,
//!     scripting::{GlobalMaps, RhaiExecutor},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load_or_default(None)?;
//!     let executor = Arc::new(RhaiExecutor::with_limits(config.sandbox.clone()));
//!     let manager = ChannelManager::new(GlobalMaps::new(), executor);
//!
//!     for channel in config.load_channels()? {
//!         manager.add_channel(channel);
//!     }
//!     manager.deploy_all().await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.undeploy_all().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod scripting;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use codec::{decode, encode, Message};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use manager::{ChannelManager, ManagerError};
pub use pipeline::{Pipeline, PipelineError};
pub use scripting::{GlobalMaps, RhaiExecutor, ScriptExecutor};
pub use transport::MllpServer;
pub use types::{Channel, Connector, Filter, Rule, Step, Transformer};
