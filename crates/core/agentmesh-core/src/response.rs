//! Responses returned for every delivered message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Outcome class of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// Accepted; the real result follows as a callback
    Ack,
    /// Completed synchronously
    Success,
    /// Rejected or failed
    Error,
}

/// Structured error codes surfaced in responses instead of raised errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No tool with the requested name is registered
    ToolNotFound,
    /// No handler is registered for the message type
    NoHandler,
    /// Signature missing where required, or not matching
    InvalidSignature,
    /// A handler produced a malformed response
    InvalidHandlerResponse,
    /// Message, arguments or output failed validation
    ValidationError,
    /// Per-tool rate limit exhausted
    RateLimited,
    /// Tool requires an authenticated (signed) call
    AuthRequired,
    /// Tool handler failed
    ExecutionError,
    /// Operation exceeded its deadline
    Timeout,
    /// Callback for a trace that is not (or no longer) active
    UnknownTrace,
    /// Target circuit breaker is open
    CircuitOpen,
    /// Transport failure
    CommunicationError,
    /// Unexpected internal failure
    InternalError,
    /// Code not understood by this peer
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ToolNotFound => "TOOL_NOT_FOUND",
            ErrorCode::NoHandler => "NO_HANDLER",
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::InvalidHandlerResponse => "INVALID_HANDLER_RESPONSE",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::UnknownTrace => "UNKNOWN_TRACE",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::CommunicationError => "COMMUNICATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to a delivered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Outcome class
    pub status: ResponseStatus,
    /// Human-readable summary
    pub message: String,
    /// Result data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// Structured error code, for `error` responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Trace the response belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

impl Response {
    fn with_status(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
            error_code: None,
            trace_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Acknowledgement of accepted work
    pub fn ack(message: impl Into<String>) -> Self {
        Self::with_status(ResponseStatus::Ack, message)
    }

    /// Synchronous success
    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(ResponseStatus::Success, message)
    }

    /// Structured failure
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code),
            ..Self::with_status(ResponseStatus::Error, message)
        }
    }

    /// Attach result data
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the trace id
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Whether the response reports an error
    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    /// Whether the response acknowledges deferred work
    pub fn is_ack(&self) -> bool {
        self.status == ResponseStatus::Ack
    }

    /// Whether the response is fit to go on the wire: a non-empty message,
    /// an error code exactly when the status is `error`
    pub fn is_well_formed(&self) -> bool {
        if self.message.trim().is_empty() {
            return false;
        }
        match self.status {
            ResponseStatus::Error => self.error_code.is_some(),
            ResponseStatus::Ack | ResponseStatus::Success => self.error_code.is_none(),
        }
    }
}
