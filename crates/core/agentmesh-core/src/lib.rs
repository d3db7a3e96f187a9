//! # AgentMesh Core
//!
//! Pure data layer of the AgentMesh MCP substrate: the message envelope and
//! its headers, responses with structured error codes, tool descriptors,
//! declarative schemas, and HMAC message signing.
//!
//! ## Wire format
//!
//! ```text
//! {
//!   "type": "tool_call" | "callback" | "discover_tools" | "heartbeat" | "error",
//!   "headers": { "tenant-id", "trace-id", "conversation-id",
//!                "reply-to": "mcp://<agent>/<tool>", "caller",
//!                "timestamp", "auth-signature"? },
//!   "payload": { ... }
//! }
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use agentmesh_core::{Headers, Message, MessageType};
//! use serde_json::json;
//!
//! let headers = Headers::new("tenant-1", "mcp://agent-a/receive_callback", "agent-a").unwrap();
//! let message = Message::from_parts("tool_call", headers, json!({"tool_name": "echo"})).unwrap();
//! assert_eq!(message.message_type(), MessageType::ToolCall);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod headers;
pub mod message;
pub mod response;
pub mod schema;
pub mod signing;
pub mod tool;

pub use error::{CoreError, CoreResult};
pub use headers::{Headers, HeadersBuilder, ReplyTo, REPLY_TO_SCHEME};
pub use message::{Message, MessageType, TARGET_SERVER_KEY};
pub use response::{ErrorCode, Response, ResponseStatus};
pub use schema::{Schema, SchemaType, SchemaValidator};
pub use signing::MessageSigner;
pub use tool::{Tool, ToolType, DEFAULT_TOOL_TIMEOUT_SECS};

/// Version of the AgentMesh core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
