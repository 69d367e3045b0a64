//! Error types for websock-client

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No channel was attached when the request was submitted or retried.
    #[error("no connection available")]
    NoConnection,

    #[error("failed to send message to server: {0}")]
    SendFailed(String),

    /// The server answered with an error-typed response. The message is
    /// absent when the response carried no payload.
    #[error("remote error: {}", .0.as_deref().unwrap_or("<no message>"))]
    Remote(Option<String>),

    #[error("timeout error")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A bounded wait ran out. The request itself is still pending.
    #[error("no result within {0:?}")]
    Elapsed(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection closed")]
    Closed,
}

impl ClientError {
    /// The error message as exposed through a future's error accessor.
    ///
    /// A remote error without payload has no message.
    pub fn message(&self) -> Option<String> {
        match self {
            ClientError::Remote(msg) => msg.clone(),
            other => Some(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Codec(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
