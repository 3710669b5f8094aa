//! Cross-component error taxonomy.
//!
//! Every component error maps onto an [`ErrorKind`], which decides whether a
//! failure is retried, absorbed, downgraded or surfaced to the caller.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network timeout, rate limit. Retried with backoff.
    Transient,
    /// Safety or length validation failed. Retried once with a new prompt.
    ContentInvalid,
    /// Cache full, host alarm limit reached. Maintenance plus one retry.
    ResourceExhausted,
    /// Cancelling something that no longer exists. Treated as success.
    AlreadySatisfied,
    /// Authorization denied, storage missing. Surfaced immediately.
    FatalConfiguration,
    /// Conflicting or past fire time. Reported synchronously.
    Validation,
    /// Unknown alarm id on the write surface.
    NotFound,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::ResourceExhausted)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::ContentInvalid => "content-invalid",
            Self::ResourceExhausted => "resource-exhausted",
            Self::AlreadySatisfied => "already-satisfied",
            Self::FatalConfiguration => "fatal-configuration",
            Self::Validation => "validation",
            Self::NotFound => "not-found",
        };
        f.write_str(name)
    }
}
