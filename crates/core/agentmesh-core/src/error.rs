//! Error types for the AgentMesh message model.

use std::fmt;
use thiserror::Error;

/// Result type for core message-model operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors raised while building, encoding or signing messages
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed headers, message, reply-to address or schema violation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Signing key or signature problems
    #[error("Signature error: {0}")]
    Signature(String),

    /// Wire encoding/decoding failures
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new validation error
    pub fn validation<T: fmt::Display>(msg: T) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Create a new signature error
    pub fn signature<T: fmt::Display>(msg: T) -> Self {
        Self::Signature(msg.to_string())
    }

    /// Check if this error was caused by invalid caller input
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
