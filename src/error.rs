use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskqError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout error after {0}ms")]
    Timeout(u64),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection busy: an exchange is already awaiting its reply")]
    Busy,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskqError {
    /// Whether the coordinator masks this failure with its single reconnect.
    ///
    /// Only mid-exchange socket failures qualify. Connect failures, timeouts
    /// and validation errors are surfaced to the caller unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskqError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, TaskqError>;
