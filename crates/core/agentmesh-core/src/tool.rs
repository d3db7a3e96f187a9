//! Tool descriptors exchanged during registration and discovery.

use crate::schema::Schema;
use serde::{Deserialize, Serialize};

/// Default tool execution timeout in seconds
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// Kind of functionality a tool exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    /// Callable function
    #[default]
    Function,
    /// Readable resource
    Resource,
    /// Prompt template
    Prompt,
}

/// Named, schema-described unit of remote functionality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Unique name within one server
    pub name: String,
    /// What the tool does
    #[serde(default)]
    pub description: String,
    /// Kind of tool
    #[serde(rename = "type", default)]
    pub tool_type: ToolType,
    /// Schema the call arguments must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Schema>,
    /// Schema the result must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,
    /// Only signed calls may invoke the tool
    #[serde(default)]
    pub requires_auth: bool,
    /// Rate limits are tracked per tenant rather than globally
    #[serde(default)]
    pub tenant_isolated: bool,
    /// Maximum calls per rate-limit window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    /// Execution timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Free-form tags used for filtering
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_timeout() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

impl Tool {
    /// Function tool with default settings
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tool_type: ToolType::Function,
            input_schema: None,
            output_schema: None,
            requires_auth: false,
            tenant_isolated: false,
            rate_limit: None,
            timeout: DEFAULT_TOOL_TIMEOUT_SECS,
            tags: Vec::new(),
        }
    }

    /// Set the tool kind
    pub fn with_type(mut self, tool_type: ToolType) -> Self {
        self.tool_type = tool_type;
        self
    }

    /// Set the input schema
    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Set the output schema
    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Limit calls per rate-limit window
    pub fn with_rate_limit(mut self, calls: u32) -> Self {
        self.rate_limit = Some(calls);
        self
    }

    /// Set the execution timeout in seconds
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = timeout_secs;
        self
    }

    /// Replace the tag list
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Require signed calls
    pub fn requiring_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    /// Track rate limits per tenant
    pub fn tenant_isolated(mut self) -> Self {
        self.tenant_isolated = true;
        self
    }

    /// Whether the tool carries at least one of the given tags
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag))
    }
}
