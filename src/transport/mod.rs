//! MLLP transport
//!
//! A TCP listener that extracts framed messages from every connection,
//! hands each decoded message to a [`MessageHandler`] and writes the framed
//! reply back. Within a connection messages are handled strictly in arrival
//! order; connections are independent of each other.

mod frame;
mod server;

pub use frame::{FrameBuffer, DEFAULT_MAX_FRAME_LEN};
pub use server::MllpServer;

use crate::codec::Message;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener {0} is already running")]
    AlreadyRunning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to send back for a handled message
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Positive acknowledgment for the received control id
    Ack,
    /// A message to encode and send
    Message(Message),
    /// Raw text; blank text is answered with an acknowledgment
    Text(String),
}

/// Error returned by a handler; its text ends up in the negative acknowledgment
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one received message
///
/// Runs on a blocking thread, so implementations may execute scripts.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> Result<Reply, HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(Message) -> Result<Reply, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: Message) -> Result<Reply, HandlerError> {
        self(message)
    }
}
