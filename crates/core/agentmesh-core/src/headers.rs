//! Message headers and the `mcp://agent/tool` reply-to address.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// URI scheme prefix of every reply-to address
pub const REPLY_TO_SCHEME: &str = "mcp://";

/// Parsed `mcp://<agent>/<tool>` address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyTo {
    /// Agent that should receive the reply
    pub agent: String,
    /// Tool on that agent that receives the reply
    pub tool: String,
}

impl ReplyTo {
    /// Create a reply-to address, validating both parts
    pub fn new(agent: impl Into<String>, tool: impl Into<String>) -> CoreResult<Self> {
        let agent = agent.into();
        let tool = tool.into();
        if agent.is_empty() || agent.contains('/') {
            return Err(CoreError::validation(format!("invalid reply_to agent '{agent}'")));
        }
        if tool.is_empty() {
            return Err(CoreError::validation("reply_to tool must not be empty"));
        }
        Ok(Self { agent, tool })
    }
}

impl FromStr for ReplyTo {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let rest = s.strip_prefix(REPLY_TO_SCHEME).ok_or_else(|| {
            CoreError::validation(format!("reply_to '{s}' must match mcp://<agent>/<tool>"))
        })?;
        let (agent, tool) = rest.split_once('/').ok_or_else(|| {
            CoreError::validation(format!("reply_to '{s}' is missing the tool segment"))
        })?;
        Self::new(agent, tool)
    }
}

impl fmt::Display for ReplyTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", REPLY_TO_SCHEME, self.agent, self.tool)
    }
}

/// Routing and correlation headers carried by every message.
///
/// Fields are read-only after construction. The only derived copies are
/// produced by [`Headers::for_reply`] and the signature/trace helpers used by
/// [`crate::Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "RawHeaders")]
pub struct Headers {
    tenant_id: String,
    trace_id: String,
    conversation_id: String,
    reply_to: String,
    caller: String,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_signature: Option<String>,
}

impl Headers {
    /// Create headers with freshly generated trace and conversation ids
    pub fn new(
        tenant_id: impl Into<String>,
        reply_to: impl Into<String>,
        caller: impl Into<String>,
    ) -> CoreResult<Self> {
        HeadersBuilder::new(tenant_id, reply_to, caller).build()
    }

    /// Start a builder for headers with explicit ids
    pub fn builder(
        tenant_id: impl Into<String>,
        reply_to: impl Into<String>,
        caller: impl Into<String>,
    ) -> HeadersBuilder {
        HeadersBuilder::new(tenant_id, reply_to, caller)
    }

    /// Check that every header is present and well formed
    pub fn validate(&self) -> CoreResult<()> {
        for (field, value) in [
            ("tenant_id", &self.tenant_id),
            ("trace_id", &self.trace_id),
            ("reply_to", &self.reply_to),
            ("caller", &self.caller),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::validation(format!("header '{field}' must not be empty")));
            }
        }
        self.reply_to.parse::<ReplyTo>()?;
        Ok(())
    }

    /// Tenant the message belongs to
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Correlation id linking a call to its callback
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Conversation the message is part of
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Raw reply-to address
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Parsed reply-to address
    pub fn reply_target(&self) -> CoreResult<ReplyTo> {
        self.reply_to.parse()
    }

    /// Agent that produced the message
    pub fn caller(&self) -> &str {
        &self.caller
    }

    /// Creation time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Signature, when the message was signed
    pub fn auth_signature(&self) -> Option<&str> {
        self.auth_signature.as_deref()
    }

    /// Headers for a reply on the same trace, sent by `caller`.
    ///
    /// Tenant, trace, conversation and reply-to are kept; the timestamp is
    /// refreshed and the signature dropped.
    pub fn for_reply(&self, caller: impl Into<String>) -> CoreResult<Self> {
        HeadersBuilder::new(self.tenant_id.clone(), self.reply_to.clone(), caller)
            .trace_id(self.trace_id.clone())
            .conversation_id(self.conversation_id.clone())
            .build()
    }

    pub(crate) fn set_signature(mut self, signature: Option<String>) -> Self {
        self.auth_signature = signature;
        self
    }

    pub(crate) fn set_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = trace_id;
        self
    }
}

/// Builder for [`Headers`]
#[derive(Debug, Clone)]
pub struct HeadersBuilder {
    tenant_id: String,
    reply_to: String,
    caller: String,
    trace_id: Option<String>,
    conversation_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    auth_signature: Option<String>,
}

impl HeadersBuilder {
    /// Start a builder with the mandatory fields
    pub fn new(
        tenant_id: impl Into<String>,
        reply_to: impl Into<String>,
        caller: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            reply_to: reply_to.into(),
            caller: caller.into(),
            trace_id: None,
            conversation_id: None,
            timestamp: None,
            auth_signature: None,
        }
    }

    /// Use an explicit trace id
    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Use an explicit conversation id
    pub fn conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Use an explicit timestamp
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach a signature
    pub fn auth_signature(mut self, signature: impl Into<String>) -> Self {
        self.auth_signature = Some(signature.into());
        self
    }

    /// Build and validate the headers
    pub fn build(self) -> CoreResult<Headers> {
        let headers = Headers {
            tenant_id: self.tenant_id,
            trace_id: self.trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation_id: self
                .conversation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            reply_to: self.reply_to,
            caller: self.caller,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            auth_signature: self.auth_signature,
        };
        headers.validate()?;
        Ok(headers)
    }
}

/// Wire form accepted on decode; absent ids are generated
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawHeaders {
    #[serde(default)]
    tenant_id: String,
    trace_id: Option<String>,
    conversation_id: Option<String>,
    #[serde(default)]
    reply_to: String,
    #[serde(default)]
    caller: String,
    timestamp: Option<DateTime<Utc>>,
    auth_signature: Option<String>,
}

impl TryFrom<RawHeaders> for Headers {
    type Error = CoreError;

    fn try_from(raw: RawHeaders) -> CoreResult<Self> {
        let mut builder = HeadersBuilder::new(raw.tenant_id, raw.reply_to, raw.caller);
        if let Some(trace_id) = raw.trace_id.filter(|id| !id.is_empty()) {
            builder = builder.trace_id(trace_id);
        }
        if let Some(conversation_id) = raw.conversation_id.filter(|id| !id.is_empty()) {
            builder = builder.conversation_id(conversation_id);
        }
        if let Some(timestamp) = raw.timestamp {
            builder = builder.timestamp(timestamp);
        }
        if let Some(signature) = raw.auth_signature {
            builder = builder.auth_signature(signature);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_to_parsing() {
        let reply: ReplyTo = "mcp://agent-2/summarize".parse().unwrap();
        assert_eq!(reply.agent, "agent-2");
        assert_eq!(reply.tool, "summarize");
        assert_eq!(reply.to_string(), "mcp://agent-2/summarize");

        let nested: ReplyTo = "mcp://agent/tools/echo".parse().unwrap();
        assert_eq!(nested.agent, "agent");
        assert_eq!(nested.tool, "tools/echo");
    }

    #[test]
    fn test_reply_to_rejects_malformed() {
        for bad in ["http://bad", "mcp://", "mcp://agent", "mcp:///tool", "mcp://agent/", ""] {
            let err = bad.parse::<ReplyTo>().unwrap_err();
            assert!(err.is_validation(), "expected validation error for {bad:?}");
        }
    }

    #[test]
    fn test_headers_generate_ids() {
        let a = Headers::new("tenant", "mcp://agent-a/callback", "agent-a").unwrap();
        let b = Headers::new("tenant", "mcp://agent-a/callback", "agent-a").unwrap();
        assert!(!a.trace_id().is_empty());
        assert!(!a.conversation_id().is_empty());
        assert_ne!(a.trace_id(), b.trace_id());
        assert!(a.auth_signature().is_none());
    }

    #[test]
    fn test_headers_reject_empty_fields() {
        assert!(Headers::new("", "mcp://a/b", "a").is_err());
        assert!(Headers::new("t", "", "a").is_err());
        assert!(Headers::new("t", "mcp://a/b", "").is_err());
        assert!(Headers::builder("t", "mcp://a/b", "a").trace_id("").build().is_err());
        assert!(Headers::new("t", "http://bad", "a").is_err());
    }

    #[test]
    fn test_for_reply_keeps_correlation() {
        let original = Headers::builder("t1", "mcp://caller/receive_callback", "caller")
            .trace_id("trace-1")
            .conversation_id("conv-1")
            .auth_signature("abc")
            .build()
            .unwrap();
        let reply = original.for_reply("callee").unwrap();
        assert_eq!(reply.trace_id(), "trace-1");
        assert_eq!(reply.conversation_id(), "conv-1");
        assert_eq!(reply.reply_to(), "mcp://caller/receive_callback");
        assert_eq!(reply.caller(), "callee");
        assert!(reply.auth_signature().is_none());
    }

    #[test]
    fn test_decode_defaults_missing_ids() {
        let json = serde_json::json!({
            "tenant-id": "t",
            "reply-to": "mcp://a/b",
            "caller": "a",
        });
        let headers: Headers = serde_json::from_value(json).unwrap();
        assert!(!headers.trace_id().is_empty());
        assert!(!headers.conversation_id().is_empty());

        let bad = serde_json::json!({"tenant-id": "", "reply-to": "mcp://a/b", "caller": "a"});
        assert!(serde_json::from_value::<Headers>(bad).is_err());
    }
}
