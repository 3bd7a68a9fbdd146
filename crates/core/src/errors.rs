use thiserror::Error;

/// Error type shared by the dispatcher and worker crates.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used across the workspace.
pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        Self::Authentication(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }
    pub fn websocket<S: Into<String>>(msg: S) -> Self {
        Self::WebSocket(msg.into())
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::Internal(_)
                | DispatchError::Configuration(_)
                | DispatchError::AlreadyRunning
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Network(_)
                | DispatchError::WebSocket(_)
                | DispatchError::Timeout(_)
                | DispatchError::Io(_)
                | DispatchError::Authentication(_)
        )
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Internal(err.to_string())
    }
}
