//! Error types for roamlink.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection refused, reset, closed or timed out.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server refused our identity, or answered with something other than a welcome.
    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Decision hook error: {0}")]
    Decision(String),

    #[error("Travel failed: {0}")]
    Travel(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn handler(s: impl Into<String>) -> Self {
        Error::Handler(s.into())
    }

    pub fn transport(s: impl Into<String>) -> Self {
        Error::Transport(s.into())
    }

    /// Whether this error means the link itself is gone.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}
