//! Channel pipeline.
//!
//! A message flows through one channel in a fixed order:
//!
//! ```text
//! [Preprocessor] ──► [Source filter ─► transformer] ──┬──► [Destination 1]
//!                                                     ├──► [Destination 2]
//!                                                     └──► ...
//!                                      [Postprocessor] ◄── source message
//! ```
//!
//! # Design
//!
//! - **Scripts behind a strategy**: every stage calls a [`ScriptExecutor`](crate::scripting::ScriptExecutor).
//! - **Isolated destinations**: each runs on its own thread with its own copy of the message.
//! - **Observable tasks**: each script run reports a tagged [`TaskOutcome`] to observers.

pub mod error;
pub mod processor;
pub mod stages;
pub mod task;

pub use error::{PipelineError, PipelineResult};
pub use processor::{DestinationResult, Pipeline, ProcessOutcome};
pub use stages::{ConnectorResult, StageRunner};
pub use task::{Observers, ScriptTask, TaskEvent, TaskObserver, TaskOutcome};
