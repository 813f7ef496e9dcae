//! Tool invocation errors.
//!
//! Adapters never panic or bubble transport errors up the stack; every
//! failure is turned into a [`ToolError`] and recorded as a step outcome.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a tool failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// The call did not finish within its time budget
    Timeout,

    /// The collaborator could not be reached
    Transport,

    /// The collaborator answered with a non-2xx status
    Status,

    /// The collaborator ran but reported its own failure
    Remote,

    /// The response could not be interpreted
    MalformedResponse,

    /// The arguments did not have the expected shape
    InvalidArguments,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Status => "status",
            Self::Remote => "remote",
            Self::MalformedResponse => "malformed_response",
            Self::InvalidArguments => "invalid_arguments",
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub detail: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, detail)
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Transport, detail)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::MalformedResponse, detail)
    }

    pub fn invalid_arguments(detail: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidArguments, detail)
    }

    /// Whether calling again with the same arguments can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, ToolErrorKind::InvalidArguments)
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_decode() {
            Self::malformed(err.to_string())
        } else {
            Self::transport(err.to_string())
        }
    }
}
