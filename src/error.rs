//! Error types for pictoken-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error. Covers numeric-materialization failures
    /// during sampling (the backend failing to produce a concrete value).
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Caller violated a shape/offset contract (e.g. feeding more tokens
    /// than the configured budget). Never retried; indicates a bug in the
    /// calling code, not a runtime condition.
    #[error("precondition: {0}")]
    Precondition(String),

    /// Invalid model configuration.
    #[error("config: {0}")]
    Config(String),

    /// Model checkpoint loading error. Fatal at startup.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// Malformed client request (bad token list, missing prompt, ...).
    #[error("request: {0}")]
    Request(String),

    /// Generation manager error (shut down, worker panicked, ...).
    #[error("manager: {0}")]
    Manager(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::Precondition`].
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }
}
