//! Tool registry: descriptors, handlers, schema checks and rate limiting

use crate::error::{McpError, Result};
use agentmesh_core::{SchemaValidator, Tool};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Tool registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Sliding window over which `Tool::rate_limit` calls are allowed
    #[serde(rename = "rate_limit_window_secs", with = "crate::config::duration_secs")]
    pub rate_limit_window: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rate_limit_window: Duration::from_secs(60), // calls per minute
        }
    }
}

/// Call metadata handed to a tool handler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolContext {
    /// Tenant of the calling message
    pub tenant_id: String,
    /// Trace the call belongs to
    pub trace_id: String,
    /// Conversation the call belongs to
    pub conversation_id: String,
    /// Calling agent
    pub caller: String,
    /// Extra payload fields of the call, e.g. workflow step context
    pub metadata: Map<String, Value>,
}

/// Executes a tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with validated arguments
    async fn call(&self, arguments: Map<String, Value>, ctx: ToolContext) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, arguments: Map<String, Value>, ctx: ToolContext) -> Result<Value> {
        (self.0)(arguments, ctx).await
    }
}

/// Wrap an async closure as a [`ToolHandler`]
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
struct RegisteredTool {
    tool: Tool,
    handler: Arc<dyn ToolHandler>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RateKey {
    Tool(String),
    Tenant(String, String),
}

/// Registry of the tools one agent serves
pub struct ToolRegistry {
    config: RegistryConfig,
    tools: DashMap<String, RegisteredTool>,
    validator: SchemaValidator,
    windows: Mutex<HashMap<RateKey, VecDeque<Instant>>>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            tools: DashMap::new(),
            validator: SchemaValidator::default(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Register a tool; a tool with the same name is replaced
    pub fn register(&self, tool: Tool, handler: Arc<dyn ToolHandler>) -> Result<()> {
        if tool.name.trim().is_empty() {
            return Err(McpError::validation("tool name must not be empty"));
        }

        let name = tool.name.clone();
        if self
            .tools
            .insert(name.clone(), RegisteredTool { tool, handler })
            .is_some()
        {
            warn!("Tool {} re-registered, previous handler replaced", name);
            self.windows.lock().retain(|key, _| !key_matches(key, &name));
        } else {
            info!("Registered tool {}", name);
        }
        Ok(())
    }

    /// Remove a tool, returning its descriptor
    pub fn unregister(&self, name: &str) -> Option<Tool> {
        let removed = self.tools.remove(name).map(|(_, entry)| entry.tool);
        if removed.is_some() {
            self.windows.lock().retain(|key, _| !key_matches(key, name));
            info!("Unregistered tool {}", name);
        }
        removed
    }

    /// Tool descriptor by name
    pub fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.get(name).map(|entry| entry.tool.clone())
    }

    /// Tool handler by name
    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|entry| Arc::clone(&entry.handler))
    }

    /// Descriptors sorted by name, optionally filtered to tools carrying
    /// any of `tags`
    pub fn list_tools(&self, tags: Option<&[String]>) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self
            .tools
            .iter()
            .filter(|entry| match tags {
                Some(tags) if !tags.is_empty() => entry.tool.has_any_tag(tags),
                _ => true,
            })
            .map(|entry| entry.tool.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tool is registered
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Admit or reject one call against the tool's sliding window.
    ///
    /// Admitted calls are recorded. Tools without a limit, and unknown tools,
    /// are always admitted.
    pub fn check_rate_limit(&self, tool_name: &str, tenant_id: &str) -> bool {
        let Some(tool) = self.get_tool(tool_name) else {
            return true;
        };
        let Some(limit) = tool.rate_limit else {
            return true;
        };

        let key = if tool.tenant_isolated {
            RateKey::Tenant(tool_name.to_string(), tenant_id.to_string())
        } else {
            RateKey::Tool(tool_name.to_string())
        };

        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(key).or_default();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.config.rate_limit_window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() < limit as usize {
            window.push_back(now);
            true
        } else {
            warn!("Rate limit of {} reached for tool {} (tenant {})", limit, tool_name, tenant_id);
            false
        }
    }

    /// Check call arguments against the tool's input schema
    pub fn validate_input(&self, tool_name: &str, data: &Value) -> Result<()> {
        let tool = self
            .get_tool(tool_name)
            .ok_or_else(|| McpError::ToolNotFound(tool_name.to_string()))?;
        match &tool.input_schema {
            Some(schema) => Ok(self.validator.validate(schema, data)?),
            None => Ok(()),
        }
    }

    /// Check a tool result against the tool's output schema
    pub fn validate_output(&self, tool_name: &str, data: &Value) -> Result<()> {
        let tool = self
            .get_tool(tool_name)
            .ok_or_else(|| McpError::ToolNotFound(tool_name.to_string()))?;
        match &tool.output_schema {
            Some(schema) => Ok(self.validator.validate(schema, data)?),
            None => Ok(()),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn key_matches(key: &RateKey, tool_name: &str) -> bool {
    match key {
        RateKey::Tool(name) | RateKey::Tenant(name, _) => name == tool_name,
    }
}
