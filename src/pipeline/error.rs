//! Pipeline-specific error types.

use crate::scripting::{ScriptError, Stage};
use thiserror::Error;

/// Errors that can occur while a channel processes a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A channel-level script (pre/postprocessor, deploy, undeploy) failed
    #[error("{stage} script of channel {channel} failed: {source}")]
    Channel {
        channel: String,
        stage: Stage,
        source: ScriptError,
    },

    /// A filter rule or transformer step of a connector failed
    #[error("connector {connector} failed in {stage} `{item}`: {source}")]
    Connector {
        connector: String,
        stage: Stage,
        item: String,
        source: ScriptError,
    },

    #[error("connector {0} panicked")]
    Panicked(String),
}

impl PipelineError {
    /// Underlying script error, if any
    pub fn script_error(&self) -> Option<&ScriptError> {
        match self {
            PipelineError::Channel { source, .. } | PipelineError::Connector { source, .. } => Some(source),
            PipelineError::Panicked(_) => None,
        }
    }

    /// A halted script ends processing of the whole message
    pub fn is_fatal(&self) -> bool {
        self.script_error().is_some_and(ScriptError::is_fatal)
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
