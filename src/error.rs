//! Error handling for the HL7 engine
//!
//! Each module has its own error enum; [`EngineError`] rolls them up for
//! callers that drive the whole engine (configuration loading, bootstrap).

use crate::manager::ManagerError;
use crate::pipeline::PipelineError;
use crate::scripting::ScriptError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Errors related to script execution outside a pipeline
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// Errors raised while processing a message
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Channel lifecycle errors
    #[error("Channel error: {0}")]
    Manager(#[from] ManagerError),

    /// Listener errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping context layers
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<EngineError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
