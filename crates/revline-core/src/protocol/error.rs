//! Protocol errors

use thiserror::Error;

use super::state::ConnectionState;

/// Errors that can occur while talking to the diagnostic adapter
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No active link when a write was attempted
    #[error("Not connected to adapter")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    /// No framed response arrived within the command's timeout
    #[error("Timed out waiting for response to '{command}'")]
    Timeout { command: String },

    /// The pending command was resolved without a response (disconnect or
    /// a newer command displaced a leaked slot)
    #[error("Command cancelled")]
    Cancelled,

    /// A response arrived but no known layout matched it
    #[error("Unrecognized response: {0:?}")]
    UnrecognizedResponse(String),

    #[error("Initialization failed at '{command}': {response}")]
    InitializationFailed { command: String, response: String },

    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("Operation not allowed in state {0}")]
    InvalidState(ConnectionState),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Misses that the polling loop absorbs instead of escalating
    pub fn is_recoverable_miss(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout { .. } | ProtocolError::UnrecognizedResponse(_)
        )
    }
}
