use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown language: {tag}")]
    UnknownLanguage {
        tag: String,
        /// Closest known aliases, empty when nothing comes close.
        suggestions: Vec<String>,
    },

    #[error("A submission is already running in this channel")]
    AlreadyRunning,

    #[error("Execution quota exceeded, try again in a moment")]
    QuotaExceeded,

    #[error("All execution slots are busy, try again later")]
    Busy,

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Execution service rejected the request: {status_code} - {message}")]
    Api { status_code: u16, message: String },

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Invalid registry snapshot: {0}")]
    Registry(String),
}

impl Error {
    /// Whether the condition is backpressure rather than a fault of the
    /// request itself.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::QuotaExceeded | Error::Busy)
    }
}
