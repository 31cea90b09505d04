use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("User identity must not be empty")]
    EmptyIdentity,

    #[error("Message content must not be empty")]
    EmptyContent,

    #[error("Message content too long: {len} chars (max {max})")]
    ContentTooLong { len: usize, max: usize },

    #[error("Cannot send a message to yourself")]
    SelfAddressed,
}
