//! Error types for the MCP runtime

use agentmesh_core::{CoreError, ErrorCode};
use thiserror::Error;

/// Result type for MCP operations
pub type Result<T> = std::result::Result<T, McpError>;

/// MCP runtime errors
#[derive(Error, Debug)]
pub enum McpError {
    /// Malformed headers, message, arguments or tool definition
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport failure; the caller may retry
    #[error("Communication error: {0}")]
    Communication(String),

    /// Target is tripped; the call was rejected before reaching the transport
    #[error("Circuit breaker open for target '{target}'")]
    CircuitBreakerOpen {
        /// Target whose breaker is open
        target: String,
    },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// What timed out
        operation: String,
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// Signing or verification failure
    #[error("Signature error: {0}")]
    Signature(String),

    /// Tool not found
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Workflow, server or trace not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Tool handler failure
    #[error("Handler error: {0}")]
    Handler(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl McpError {
    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new communication error
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    /// Create a new handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Check if the caller may retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::Timeout { .. })
    }

    /// Wire error code used when this error is reported in a response
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::Serialization(_) => ErrorCode::ValidationError,
            Self::Communication(_) => ErrorCode::CommunicationError,
            Self::CircuitBreakerOpen { .. } => ErrorCode::CircuitOpen,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Signature(_) => ErrorCode::InvalidSignature,
            Self::ToolNotFound(_) => ErrorCode::ToolNotFound,
            Self::Handler(_) => ErrorCode::ExecutionError,
            Self::NotFound(_) | Self::Configuration(_) | Self::Other(_) => ErrorCode::InternalError,
        }
    }
}

impl From<CoreError> for McpError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => McpError::Validation(msg),
            CoreError::Signature(msg) => McpError::Signature(msg),
            CoreError::Serialization(e) => McpError::Serialization(e),
        }
    }
}
