//! Script sandbox for channel stages
//!
//! Every scripted stage (preprocessor, filter rule, transformer step,
//! postprocessor, deploy/undeploy) goes through the [`ScriptExecutor`]
//! strategy, so the pipeline never depends on a particular script backend.
//! The bundled backend is [`RhaiExecutor`].
//!
//! ## Script Surface
//!
//! The following names are in scope for every invocation:
//!
//! - `msg` / `message` - The in-flight message, rooted at `HL7Message`
//! - `channel_id`, `channel_name`, `connector_name`, `stage` - Read-only strings
//! - `logger` - `logger.info(..)`, `logger.warn(..)`, `logger.error(..)`, `logger.trace(..)`
//! - `global_map` / `g`, `global_channel_map` / `gc`, `channel_map` / `c`,
//!   `connector_map` / `co`, `response_map` / `r` - One argument reads, two arguments write
//!
//! ## Example Scripts
//!
//! Filter rule accepting admissions only:
//! ```rhai
//! msg.HL7Message.MSH["MSH.8"] == "ADT^A01"
//! ```
//!
//! Transformer step tagging the header and counting messages:
//! ```rhai
//! msg.HL7Message.MSH["MSH.CustomField"] = "Processed";
//! let seen = c("seen") ?? 0;
//! c("seen", seen + 1);
//! ```
//!
//! ## Limits
//!
//! Execution is bounded by an operation count and a wall-clock budget
//! ([`SandboxLimits`]). Running past either aborts the script with
//! [`ScriptError::Halted`], which the pipeline treats as fatal for the message.

mod engine;
mod maps;

pub use engine::RhaiExecutor;
pub use maps::{GlobalMaps, MapScope, ScopedMap, ScopedMaps, SharedMap};

use crate::codec::Message;
use rhai::{Engine, AST};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors raised while running a script
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// Script text did not parse
    #[error("invalid script: {0}")]
    Invalid(String),

    /// Script raised an error while running
    #[error("script threw: {0}")]
    Thrown(String),

    /// Execution budget exhausted; the sandbox stopped the script
    #[error("script execution halted: {0}")]
    Halted(String),

    /// Script left the message in a shape that is not a message
    #[error("script produced an unusable message: {0}")]
    Conversion(String),
}

impl ScriptError {
    /// Halts end processing of the whole message
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScriptError::Halted(_))
    }
}

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// Stage a script runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Deploy,
    Undeploy,
    Preprocessor,
    Filter,
    Transformer,
    Postprocessor,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Deploy => "deploy",
            Stage::Undeploy => "undeploy",
            Stage::Preprocessor => "preprocessor",
            Stage::Filter => "filter",
            Stage::Transformer => "transformer",
            Stage::Postprocessor => "postprocessor",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient context for one script invocation
#[derive(Debug, Clone)]
pub struct StageContext {
    pub channel_id: String,
    pub channel_name: String,
    pub connector_name: Option<String>,
    pub stage: Stage,
    pub maps: ScopedMaps,
}

impl StageContext {
    pub fn new(channel_id: impl Into<String>, channel_name: impl Into<String>, stage: Stage, maps: ScopedMaps) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_name: channel_name.into(),
            connector_name: None,
            stage,
            maps,
        }
    }

    pub fn with_connector(mut self, name: impl Into<String>) -> Self {
        self.connector_name = Some(name.into());
        self
    }

    /// Same channel and maps, different stage
    pub fn for_stage(&self, stage: Stage) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

/// Value a script evaluated to
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// No value (unit / null)
    Unit,
    Bool(bool),
    /// A message-shaped map
    Message(Message),
    Other(serde_json::Value),
}

impl ScriptValue {
    /// Exactly `true`; truthy values do not count
    pub fn is_true(&self) -> bool {
        matches!(self, ScriptValue::Bool(true))
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            ScriptValue::Message(message) => Some(message),
            _ => None,
        }
    }
}

/// Runs script text against a message and a stage context
///
/// Implementations mutate `message` in place with whatever the script did to
/// it. A message-shaped return value is reported as [`ScriptValue::Message`];
/// whether it replaces the working message is up to the calling stage.
#[cfg_attr(test, mockall::automock)]
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, script: &str, message: &mut Message, ctx: &StageContext) -> ScriptResult<ScriptValue>;
}

/// Execution limits for the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Operation budget per invocation (0 disables the check)
    pub max_operations: u64,
    /// Wall-clock budget per invocation in milliseconds (0 disables the check)
    pub timeout_ms: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            timeout_ms: 5_000,
            max_call_levels: 32,
            max_expr_depth: 64,
            max_string_size: 1_048_576,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

/// Cache of compiled scripts keyed by source text
#[derive(Default)]
pub struct ScriptCache {
    cache: HashMap<String, AST>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached AST or compile and cache it
    pub fn get_or_compile(&mut self, engine: &Engine, source: &str) -> ScriptResult<AST> {
        if let Some(ast) = self.cache.get(source) {
            return Ok(ast.clone());
        }

        let ast = engine
            .compile(source)
            .map_err(|e| ScriptError::Invalid(e.to_string()))?;
        self.cache.insert(source.to_string(), ast.clone());
        Ok(ast)
    }

    /// Cached AST for `source`, if compiled before
    pub fn peek(&self, source: &str) -> Option<AST> {
        self.cache.get(source).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Thread-safe script cache wrapper
pub type SharedScriptCache = Arc<RwLock<ScriptCache>>;
