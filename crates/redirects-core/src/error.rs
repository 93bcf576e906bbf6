//! Error types shared by the core and the application crate.

use thiserror::Error;

/// Result type alias for redirect operations.
pub type Result<T> = std::result::Result<T, RedirectError>;

/// Errors surfaced by diffing, consolidation, storage and resolution.
///
/// A detected redirect cycle is deliberately absent: cycles are recorded
/// on the affected definition as `stale = true` and never raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedirectError {
    /// Missing or empty arguments, or a write that violates an invariant.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The durable store could not be read or written.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// An inbound request or target URL could not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// A definition addressed by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl RedirectError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest(message.into())
    }
}
