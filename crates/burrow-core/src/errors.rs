use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories shared by the daemon and its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request was malformed or missing a required field.
    InvalidRequest,
    /// Project or resource does not exist.
    NotFound,
    /// Command or path was refused by the command policy.
    PolicyDenied,
    /// Interactive terminals are disabled on this daemon.
    BackendUnavailable,
    /// Terminal id is stale or owned by another connection.
    SessionNotFound,
    /// Every port in the configured range is busy.
    PortRangeExhausted,
    /// A child process could not be started.
    SpawnFailed,
    Timeout,
    ProtocolMismatch,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct BurrowError {
    pub code: ErrorCode,
    pub message: String,
    pub detail: Option<String>,
}

impl BurrowError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Wraps an I/O failure as an internal error tagged with the attempted action.
    pub fn io(action: &str, err: std::io::Error) -> Self {
        Self::new(ErrorCode::Internal, action).with_detail(err.to_string())
    }
}
