use thiserror::Error;

/// Errors surfaced to callers of the client runtime. Transport drops and
/// malformed frames never appear here; those are absorbed by the reconnect
/// loop and the decode boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected and no REST fallback available")]
    NotConnected,
    #[error("command failed: {message}")]
    Command { message: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("connection closed before the command was answered")]
    ConnectionClosed,
    #[error("not authenticated")]
    Unauthenticated,
    #[error("unexpected server response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    pub fn command(message: impl Into<String>) -> Self {
        ClientError::Command {
            message: message.into(),
        }
    }
}
