use thiserror::Error;

/// Why a handler invocation did not return normally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The handler ran and reported a failure.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The handler panicked; the payload message is kept when it is a string.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// The handler rejected the arguments it was given.
    #[error("Invalid handler arguments: {0}")]
    InvalidArgs(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

/// Lets handlers decode their arguments with `?`.
impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::InvalidArgs(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HandlerError>;
