use thiserror::Error;

/// Errors produced by the webssh session layer.
#[derive(Debug, Error)]
pub enum WebsshError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("pty error: {0}")]
    Pty(String),

    #[error("process error: {0}")]
    Process(String),

    /// The caller asked the input loop to stop. Not a failure.
    #[error("session loop cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl WebsshError {
    /// Whether this error is a requested exit rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WebsshError::Cancelled)
    }
}

pub type WebsshResult<T> = Result<T, WebsshError>;
