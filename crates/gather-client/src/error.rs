use thiserror::Error;

use gather_shared::{ProtocolError, ValidationError};

/// Errors produced by the chat engine.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The transport could not be opened or died underneath us.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation that needs a live connection was attempted without one.
    #[error("Not connected")]
    NotConnected,

    /// The connection was torn down while a request was in flight.
    #[error("Connection closed before the server answered")]
    ConnectionClosed,

    /// No acknowledgment arrived within the configured timeout.
    #[error("Timed out waiting for acknowledgment after {0} s")]
    AckTimeout(u64),

    /// An event subscriber fell behind and this many events were dropped.
    #[error("Event stream lagged, {0} events dropped")]
    EventsLagged(u64),

    /// The server refused a send request.
    #[error("Server rejected message: {0}")]
    Rejected(String),

    /// `send` was called without an active conversation.
    #[error("No peer selected")]
    NoPeerSelected,

    /// REST call to the backend failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    /// A required configuration value is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
