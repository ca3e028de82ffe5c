use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the broker rejected a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame arrived out of order, e.g. anything before `hello`.
    Protocol,
    /// Frame could not be parsed.
    Validation,
}

/// Error body carried in a broker `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
