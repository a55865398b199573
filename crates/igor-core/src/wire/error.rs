//! Wire error frames (spec.md Section 7).

use serde::Serialize;
use thiserror::Error;

/// The five error kinds that can appear in an `{"error": ..., "message":
/// ...}` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ServerError,
    UnhandledServerError,
    ClientError,
    CommandError,
    ParamError,
}

/// An error surfaced to the originating connection. The connection stays
/// open; this is not a transport failure (spec.md Section 7, "Local
/// recovery").
#[derive(Debug, Error, Serialize)]
#[error("{kind:?}: {message}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientError, message)
    }

    pub fn param(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParamError, message)
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandError, message)
    }

    pub fn unhandled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnhandledServerError, message)
    }

    pub fn to_frame(&self) -> serde_json::Value {
        serde_json::json!({"error": self.kind, "message": self.message})
    }
}
