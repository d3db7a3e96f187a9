//! MCP message envelope and its closed set of message types.

use crate::error::{CoreError, CoreResult};
use crate::headers::Headers;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Payload key naming the server a message should be routed to
pub const TARGET_SERVER_KEY: &str = "target_server";

/// Closed set of MCP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Invoke a tool on the target agent
    ToolCall,
    /// Asynchronous result of an earlier tool call
    Callback,
    /// Ask the target for its tool descriptors
    DiscoverTools,
    /// Liveness check
    Heartbeat,
    /// Error notification
    Error,
}

impl MessageType {
    /// All message types, in wire order
    pub const ALL: [MessageType; 5] = [
        MessageType::ToolCall,
        MessageType::Callback,
        MessageType::DiscoverTools,
        MessageType::Heartbeat,
        MessageType::Error,
    ];

    /// Wire name of the message type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ToolCall => "tool_call",
            MessageType::Callback => "callback",
            MessageType::DiscoverTools => "discover_tools",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        MessageType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::validation(format!("unknown message type '{s}'")))
    }
}

/// A validated MCP message.
///
/// Construction checks the headers; the payload is always a JSON object.
/// Derived copies (signed, re-traced) are new values, the original is never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct Message {
    #[serde(rename = "type")]
    message_type: MessageType,
    headers: Headers,
    payload: Map<String, Value>,
}

impl Message {
    /// Create a message from typed parts
    pub fn new(
        message_type: MessageType,
        headers: Headers,
        payload: Map<String, Value>,
    ) -> CoreResult<Self> {
        headers.validate()?;
        Ok(Self {
            message_type,
            headers,
            payload,
        })
    }

    /// Create a message from untyped parts, as received from a peer
    pub fn from_parts(message_type: &str, headers: Headers, payload: Value) -> CoreResult<Self> {
        let message_type = message_type.parse()?;
        match payload {
            Value::Object(map) => Self::new(message_type, headers, map),
            other => Err(CoreError::validation(format!(
                "payload must be a map, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Message type
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Message headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Message payload
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Shortcut for the trace id header
    pub fn trace_id(&self) -> &str {
        self.headers.trace_id()
    }

    /// String value of a payload field
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Server this message should be routed to.
    ///
    /// Uses the `target_server` payload field; callbacks without one go to
    /// the agent named in their reply-to address.
    pub fn target_server(&self) -> Option<String> {
        if let Some(target) = self.payload_str(TARGET_SERVER_KEY).filter(|t| !t.is_empty()) {
            return Some(target.to_string());
        }
        match self.message_type {
            MessageType::Callback => self.headers.reply_target().ok().map(|reply| reply.agent),
            _ => None,
        }
    }

    /// Copy carrying the given signature
    pub fn with_signature(self, signature: impl Into<String>) -> Self {
        Self {
            headers: self.headers.set_signature(Some(signature.into())),
            ..self
        }
    }

    /// Copy with the signature removed
    pub fn without_signature(self) -> Self {
        Self {
            headers: self.headers.set_signature(None),
            ..self
        }
    }

    /// Copy correlated under a new trace id; any signature is dropped since
    /// it no longer covers the content
    pub fn with_trace_id(self, trace_id: impl Into<String>) -> CoreResult<Self> {
        let trace_id = trace_id.into();
        if trace_id.trim().is_empty() {
            return Err(CoreError::validation("header 'trace_id' must not be empty"));
        }
        Ok(Self {
            headers: self.headers.set_trace_id(trace_id).set_signature(None),
            ..self
        })
    }

    /// Encode to the JSON wire format
    pub fn to_wire(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the JSON wire format, re-running every validation
    pub fn from_wire(bytes: &[u8]) -> CoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Bytes covered by the message signature (the message with no signature)
    pub fn canonical_bytes(&self) -> CoreResult<Vec<u8>> {
        let unsigned = self.clone().without_signature();
        Ok(serde_json::to_vec(&unsigned)?)
    }
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    message_type: String,
    headers: Headers,
    #[serde(default = "empty_payload")]
    payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

impl TryFrom<RawMessage> for Message {
    type Error = CoreError;

    fn try_from(raw: RawMessage) -> CoreResult<Self> {
        Message::from_parts(&raw.message_type, raw.headers, raw.payload)
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers() -> Headers {
        Headers::builder("tenant-1", "mcp://agent-a/receive_callback", "agent-a")
            .trace_id("trace-1")
            .build()
            .unwrap()
    }

    #[test]
    fn test_message_type_parsing() {
        for kind in MessageType::ALL {
            assert_eq!(kind.as_str().parse::<MessageType>().unwrap(), kind);
        }
        assert!("shutdown".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_payload_must_be_map() {
        assert!(Message::from_parts("tool_call", headers(), json!({"a": 1})).is_ok());
        let err = Message::from_parts("tool_call", headers(), json!("text")).unwrap_err();
        assert!(err.to_string().contains("payload must be a map"));
        assert!(Message::from_parts("tool_call", headers(), json!([1, 2])).is_err());
        assert!(Message::from_parts("bogus", headers(), json!({})).is_err());
    }

    #[test]
    fn test_wire_shape() {
        let mut payload = Map::new();
        payload.insert("tool_name".into(), json!("echo"));
        let message = Message::new(MessageType::ToolCall, headers(), payload).unwrap();
        let wire: Value = serde_json::from_slice(&message.to_wire().unwrap()).unwrap();
        assert_eq!(wire["type"], "tool_call");
        assert_eq!(wire["headers"]["tenant-id"], "tenant-1");
        assert_eq!(wire["headers"]["trace-id"], "trace-1");
        assert_eq!(wire["headers"]["reply-to"], "mcp://agent-a/receive_callback");
        assert!(wire["headers"].get("auth-signature").is_none());
        assert_eq!(wire["payload"]["tool_name"], "echo");
    }

    #[test]
    fn test_decode_rejects_scalar_payload() {
        let wire = json!({
            "type": "tool_call",
            "headers": {"tenant-id": "t", "reply-to": "mcp://a/b", "caller": "a"},
            "payload": 42,
        });
        assert!(serde_json::from_value::<Message>(wire).is_err());
    }

    #[test]
    fn test_target_server_resolution() {
        let mut payload = Map::new();
        payload.insert(TARGET_SERVER_KEY.into(), json!("agent-b"));
        let call = Message::new(MessageType::ToolCall, headers(), payload).unwrap();
        assert_eq!(call.target_server().as_deref(), Some("agent-b"));

        let callback = Message::new(MessageType::Callback, headers(), Map::new()).unwrap();
        assert_eq!(callback.target_server().as_deref(), Some("agent-a"));

        let heartbeat = Message::new(MessageType::Heartbeat, headers(), Map::new()).unwrap();
        assert_eq!(heartbeat.target_server(), None);
    }

    #[test]
    fn test_with_trace_id_drops_signature() {
        let message = Message::new(MessageType::Heartbeat, headers(), Map::new())
            .unwrap()
            .with_signature("deadbeef");
        assert_eq!(message.headers().auth_signature(), Some("deadbeef"));

        let copy = message.clone().with_trace_id("trace-1:agent-b").unwrap();
        assert_eq!(copy.trace_id(), "trace-1:agent-b");
        assert!(copy.headers().auth_signature().is_none());
        assert_eq!(message.trace_id(), "trace-1");
        assert!(message.clone().with_trace_id(" ").is_err());
    }
}
