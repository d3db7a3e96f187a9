//! Agent-side MCP client.
//!
//! One [`McpClient`] is both a caller and a callee:
//!
//! - as a caller it sends `tool_call`s through the circuit breaker and
//!   tracks each trace until its `callback` arrives;
//! - as a callee it validates inbound calls against its [`ToolRegistry`],
//!   answers with an immediate `ack` and runs the handler in a spawned task
//!   that reports back to the caller's reply-to address.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{McpError, Result};
use crate::protocol::{McpProtocol, MessageHandler, ProtocolConfig};
use crate::registry::{RegistryConfig, ToolContext, ToolHandler, ToolRegistry};
use crate::router::RoutedServer;
use crate::transport::Transport;
use agentmesh_core::{
    ErrorCode, Headers, Message, MessageType, ReplyTo, Response, SchemaValidator, Tool,
    TARGET_SERVER_KEY,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Payload keys reserved by the `tool_call` envelope
const ENVELOPE_KEYS: [&str; 3] = ["tool_name", "arguments", TARGET_SERVER_KEY];

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Agent identity, used as server name and reply-to host
    pub agent_id: String,
    /// Tenant used by convenience headers
    pub default_tenant: String,
    /// Default deadline for a delivery, and for its callback after an ack
    #[serde(rename = "call_timeout_ms", with = "crate::config::duration_ms")]
    pub call_timeout: Duration,
    /// Tool name callbacks are addressed to
    pub callback_tool: String,
    /// Buffered callback events per subscriber
    pub callback_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent".to_string(),
            default_tenant: "default".to_string(),
            call_timeout: Duration::from_secs(30),
            callback_tool: "receive_callback".to_string(),
            callback_buffer: 256,
        }
    }
}

/// Outbound call waiting for its callback
#[derive(Debug, Clone)]
pub struct ActiveTrace {
    /// Agent the call went to
    pub target: String,
    /// Tool that was called
    pub tool: String,
    /// When the call was sent
    pub started_at: Instant,
    /// After this the callback is no longer accepted; `None` when the
    /// timeout does not fit in an `Instant`
    pub deadline: Option<Instant>,
    /// Where the callee will reply
    pub reply_to: String,
}

impl ActiveTrace {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// Outcome reported by a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    /// Tool completed
    Success,
    /// Tool failed, timed out or produced invalid output
    Error,
}

/// Callback correlated with one of this client's calls
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    /// Trace of the original call
    pub trace_id: String,
    /// Tool that ran
    pub tool_name: String,
    /// Outcome
    pub status: CallbackStatus,
    /// Result data on success
    pub data: Option<Map<String, Value>>,
    /// Failure description on error
    pub error: Option<String>,
    /// Agent that ran the tool
    pub agent_id: String,
    /// Time between sending the call and receiving the callback
    pub elapsed: Duration,
}

/// Stream of callback events for one consumer
pub struct CallbackSubscription {
    rx: broadcast::Receiver<CallbackEvent>,
}

impl CallbackSubscription {
    /// Next callback event of any trace
    pub async fn recv(&mut self) -> Result<CallbackEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Callback subscriber lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(McpError::communication("callback channel closed"));
                }
            }
        }
    }

    /// Wait for the callback of `trace_id`, skipping other traces
    pub async fn wait_for(&mut self, trace_id: &str, timeout: Duration) -> Result<CallbackEvent> {
        let wait = async {
            loop {
                let event = self.recv().await?;
                if event.trace_id == trace_id {
                    return Ok::<_, McpError>(event);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| McpError::Timeout {
                operation: format!("callback for {}", trace_id),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }
}

struct ClientInner {
    config: ClientConfig,
    registry: ToolRegistry,
    breaker: CircuitBreaker,
    protocol: McpProtocol,
    transport: Arc<dyn Transport>,
    validator: SchemaValidator,
    active_traces: DashMap<String, ActiveTrace>,
    remote_tools: DashMap<String, HashMap<String, Tool>>,
    callbacks: broadcast::Sender<CallbackEvent>,
}

/// MCP agent client; cheap to clone
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl McpClient {
    /// Create a client delivering through `transport`
    pub fn new(
        config: ClientConfig,
        protocol_config: ProtocolConfig,
        breaker_config: CircuitBreakerConfig,
        registry_config: RegistryConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        ReplyTo::new(config.agent_id.clone(), config.callback_tool.clone())?;
        if config.call_timeout.is_zero() {
            return Err(McpError::Configuration(
                "call_timeout must be greater than zero".to_string(),
            ));
        }

        let (callbacks, _) = broadcast::channel(config.callback_buffer.max(1));
        let inner = Arc::new(ClientInner {
            registry: ToolRegistry::new(registry_config),
            breaker: CircuitBreaker::new(breaker_config),
            protocol: McpProtocol::new(protocol_config)?,
            transport,
            validator: SchemaValidator::default(),
            active_traces: DashMap::new(),
            remote_tools: DashMap::new(),
            callbacks,
            config,
        });

        let handler: Arc<dyn MessageHandler> = Arc::new(InboundHandler {
            client: Arc::downgrade(&inner),
        });
        for kind in [
            MessageType::ToolCall,
            MessageType::Callback,
            MessageType::DiscoverTools,
            MessageType::Heartbeat,
        ] {
            inner.protocol.register_handler(kind, Arc::clone(&handler));
        }

        info!("Created MCP client {}", inner.config.agent_id);
        Ok(Self { inner })
    }

    /// Agent identity
    pub fn agent_id(&self) -> &str {
        &self.inner.config.agent_id
    }

    /// Address callees reply to: `mcp://<agent>/<callback_tool>`
    pub fn reply_to(&self) -> String {
        self.inner.reply_to()
    }

    /// Fresh headers for a new trace, replying to this client
    pub fn headers(&self, tenant_id: Option<&str>) -> Result<Headers> {
        self.inner.headers(tenant_id)
    }

    /// Breaker gating this client's outbound calls
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Tools this client serves
    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    /// Call `tool_name` on `target`.
    ///
    /// Arguments are checked against the tool's input schema when it is
    /// known (a local tool or one seen by [`McpClient::discover_tools`]);
    /// a mismatch fails before anything is sent. The trace stays active
    /// after an `ack` until the callback arrives.
    pub async fn call_tool(
        &self,
        target: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
        headers: Headers,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        if target.trim().is_empty() {
            return Err(McpError::validation("target must not be empty"));
        }
        if tool_name.trim().is_empty() {
            return Err(McpError::validation("tool_name must not be empty"));
        }
        self.inner.validate_arguments(target, tool_name, &arguments)?;

        let mut payload = Map::new();
        payload.insert("tool_name".to_string(), json!(tool_name));
        payload.insert("arguments".to_string(), Value::Object(arguments));
        payload.insert(TARGET_SERVER_KEY.to_string(), json!(target));
        let message = Message::new(MessageType::ToolCall, headers, payload)?;

        self.inner.send_tracked(target, tool_name, message, timeout).await
    }

    /// Post a `callback` carrying `result` to the agent named in `reply_to`
    pub async fn send_callback(
        &self,
        reply_to: &str,
        tool_name: &str,
        result: std::result::Result<Map<String, Value>, String>,
        headers: &Headers,
    ) -> Result<Response> {
        self.inner.send_callback(reply_to, tool_name, result, headers).await
    }

    /// Ask `target` for its tools; any failure yields an empty list
    pub async fn discover_tools(&self, target: &str) -> Vec<Tool> {
        self.discover_tools_tagged(target, &[]).await
    }

    /// Ask `target` for its tools carrying any of `tags`
    pub async fn discover_tools_tagged(&self, target: &str, tags: &[String]) -> Vec<Tool> {
        match self.inner.discover(target, tags).await {
            Ok(tools) => {
                debug!("Discovered {} tools on {}", tools.len(), target);
                let mut entry = self.inner.remote_tools.entry(target.to_string()).or_default();
                for tool in &tools {
                    entry.insert(tool.name.clone(), tool.clone());
                }
                tools
            }
            Err(e) => {
                warn!("Tool discovery on {} failed: {}", target, e);
                Vec::new()
            }
        }
    }

    /// Best-effort liveness check
    pub async fn heartbeat(&self, target: &str) -> bool {
        let message = match self
            .inner
            .headers(None)
            .and_then(|headers| {
                Message::new(MessageType::Heartbeat, headers, target_payload(target)).map_err(McpError::from)
            })
        {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to build heartbeat: {}", e);
                return false;
            }
        };
        match self.inner.send(target, message, None).await {
            Ok(response) => !response.is_error(),
            Err(e) => {
                debug!("Heartbeat to {} failed: {}", target, e);
                false
            }
        }
    }

    /// Number of calls still waiting for a callback
    pub fn active_traces(&self) -> usize {
        let now = Instant::now();
        self.inner.active_traces.retain(|_, trace| !trace.is_expired(now));
        self.inner.active_traces.len()
    }

    /// Whether `trace_id` is still waiting for a callback
    pub fn is_trace_active(&self, trace_id: &str) -> bool {
        self.inner
            .active_traces
            .get(trace_id)
            .is_some_and(|trace| !trace.is_expired(Instant::now()))
    }

    /// Subscribe to callbacks; subscribe before calling to not miss fast
    /// replies
    pub fn subscribe_callbacks(&self) -> CallbackSubscription {
        CallbackSubscription {
            rx: self.inner.callbacks.subscribe(),
        }
    }

    /// Serve a tool from this client
    pub fn register_tool(&self, tool: Tool, handler: Arc<dyn ToolHandler>) -> Result<()> {
        self.inner.registry.register(tool, handler)
    }

    /// Stop serving a tool
    pub fn unregister_tool(&self, name: &str) -> Option<Tool> {
        self.inner.registry.unregister(name)
    }

    /// Served tools, optionally filtered by tag
    pub fn list_tools(&self, tags: Option<&[String]>) -> Vec<Tool> {
        self.inner.registry.list_tools(tags)
    }

    /// Verify and dispatch an inbound message
    pub async fn handle_mcp_message(&self, message: Message) -> Response {
        self.inner.protocol.handle_incoming(message).await
    }

    /// Decode and dispatch an inbound frame
    pub async fn handle_frame(&self, bytes: &[u8]) -> Response {
        self.inner.protocol.handle_frame(bytes).await
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("agent_id", &self.inner.config.agent_id)
            .field("tools", &self.inner.registry.len())
            .field("active_traces", &self.inner.active_traces.len())
            .finish()
    }
}

fn target_payload(target: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(TARGET_SERVER_KEY.to_string(), json!(target));
    payload
}

impl ClientInner {
    fn reply_to(&self) -> String {
        format!("mcp://{}/{}", self.config.agent_id, self.config.callback_tool)
    }

    fn headers(&self, tenant_id: Option<&str>) -> Result<Headers> {
        let tenant = tenant_id.unwrap_or(&self.config.default_tenant);
        Ok(Headers::new(tenant, self.reply_to(), self.config.agent_id.clone())?)
    }

    fn validate_arguments(&self, target: &str, tool_name: &str, arguments: &Map<String, Value>) -> Result<()> {
        let data = Value::Object(arguments.clone());
        if target == self.config.agent_id {
            if self.registry.get_tool(tool_name).is_some() {
                return self.registry.validate_input(tool_name, &data);
            }
            return Ok(());
        }

        let schema = self
            .remote_tools
            .get(target)
            .and_then(|tools| tools.get(tool_name).and_then(|tool| tool.input_schema.clone()));
        match schema {
            Some(schema) => Ok(self.validator.validate(&schema, &data)?),
            None => Ok(()),
        }
    }

    /// Send with an active-trace entry recorded before delivery.
    ///
    /// After an `ack` the entry lives until its callback arrives or the
    /// call's timeout has passed, whichever comes first.
    async fn send_tracked(
        self: &Arc<Self>,
        target: &str,
        tool_name: &str,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let trace_id = message.trace_id().to_string();
        let started_at = Instant::now();
        let deadline = started_at.checked_add(timeout.unwrap_or(self.config.call_timeout));
        self.active_traces.insert(
            trace_id.clone(),
            ActiveTrace {
                target: target.to_string(),
                tool: tool_name.to_string(),
                started_at,
                deadline,
                reply_to: message.headers().reply_to().to_string(),
            },
        );

        match self.send(target, message, timeout).await {
            Ok(response) => {
                if !response.is_ack() {
                    self.active_traces.remove(&trace_id);
                } else if let Some(deadline) = deadline {
                    self.expire_trace_at(trace_id.clone(), deadline);
                }
                debug!("{} on {} answered {:?} for {}", tool_name, target, response.status, trace_id);
                Ok(response)
            }
            Err(e) => {
                self.active_traces.remove(&trace_id);
                Err(e)
            }
        }
    }

    fn expire_trace_at(self: &Arc<Self>, trace_id: String, deadline: Instant) {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if let Some(client) = client.upgrade() {
                if client.active_traces.remove(&trace_id).is_some() {
                    warn!("Trace {} expired without a callback", trace_id);
                }
            }
        });
    }

    /// Sign, gate and deliver one message
    async fn send(&self, target: &str, message: Message, timeout: Option<Duration>) -> Result<Response> {
        let message = self.protocol.prepare_outgoing(message)?;
        let frame = self.protocol.encode(&message)?;

        if !self.breaker.can_execute(target) {
            warn!("Circuit open for {}, rejecting {} {}", target, message.message_type(), message.trace_id());
            return Err(McpError::CircuitBreakerOpen {
                target: target.to_string(),
            });
        }

        let timeout = timeout.unwrap_or(self.config.call_timeout);
        match tokio::time::timeout(timeout, self.transport.deliver(target, frame)).await {
            Ok(Ok(response)) => {
                self.breaker.record_success(target);
                Ok(response)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(target);
                warn!("Delivery of {} to {} failed: {}", message.trace_id(), target, e);
                match e {
                    McpError::Communication(_) => Err(e),
                    other => Err(McpError::communication(other.to_string())),
                }
            }
            Err(_) => {
                self.breaker.record_failure(target);
                warn!("Delivery of {} to {} timed out", message.trace_id(), target);
                Err(McpError::Timeout {
                    operation: format!("{} to {}", message.message_type(), target),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn send_callback(
        &self,
        reply_to: &str,
        tool_name: &str,
        result: std::result::Result<Map<String, Value>, String>,
        headers: &Headers,
    ) -> Result<Response> {
        let reply: ReplyTo = reply_to.parse()?;
        let mut payload = Map::new();
        payload.insert("tool_name".to_string(), json!(tool_name));
        match result {
            Ok(data) => {
                payload.insert("status".to_string(), json!(CallbackStatus::Success));
                payload.insert("data".to_string(), Value::Object(data));
            }
            Err(error) => {
                payload.insert("status".to_string(), json!(CallbackStatus::Error));
                payload.insert("error".to_string(), json!(error));
            }
        }
        payload.insert("agent_id".to_string(), json!(self.config.agent_id));

        let reply_headers = Headers::builder(headers.tenant_id(), reply.to_string(), self.config.agent_id.clone())
            .trace_id(headers.trace_id())
            .conversation_id(headers.conversation_id())
            .build()?;
        let message = Message::new(MessageType::Callback, reply_headers, payload)?;
        self.send(&reply.agent, message, None).await
    }

    async fn discover(&self, target: &str, tags: &[String]) -> Result<Vec<Tool>> {
        let mut payload = target_payload(target);
        if !tags.is_empty() {
            payload.insert("tags".to_string(), json!(tags));
        }
        let message = Message::new(MessageType::DiscoverTools, self.headers(None)?, payload)?;
        let response = self.send(target, message, None).await?;
        if response.is_error() {
            return Err(McpError::communication(response.message));
        }
        let tools = response
            .data
            .and_then(|mut data| data.remove("tools"))
            .ok_or_else(|| McpError::validation("discover_tools response carries no tool list"))?;
        Ok(serde_json::from_value(tools)?)
    }

    fn handle_tool_call(self: &Arc<Self>, message: Message) -> Result<Response> {
        let trace_id = message.trace_id().to_string();
        let tool_name = message
            .payload_str("tool_name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| McpError::validation("tool_call payload is missing 'tool_name'"))?
            .to_string();
        let arguments = match message.payload().get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(McpError::validation("'arguments' must be a map")),
        };

        let (Some(tool), Some(handler)) = (
            self.registry.get_tool(&tool_name),
            self.registry.get_handler(&tool_name),
        ) else {
            warn!("Call to unknown tool {} on {}", tool_name, self.config.agent_id);
            return Ok(Response::error(
                ErrorCode::ToolNotFound,
                format!("Tool '{}' not found on {}", tool_name, self.config.agent_id),
            )
            .with_trace_id(trace_id));
        };

        if tool.requires_auth && !self.protocol.is_authenticated(&message) {
            warn!("Unsigned call to {} from {} rejected", tool_name, message.headers().caller());
            return Ok(Response::error(
                ErrorCode::AuthRequired,
                format!("Tool '{}' requires a signed call", tool_name),
            )
            .with_trace_id(trace_id));
        }

        if let Err(e) = self.registry.validate_input(&tool_name, &Value::Object(arguments.clone())) {
            return Ok(Response::error(ErrorCode::ValidationError, e.to_string()).with_trace_id(trace_id));
        }

        // only calls that will be acked occupy a window slot
        if !self.registry.check_rate_limit(&tool_name, message.headers().tenant_id()) {
            return Ok(Response::error(
                ErrorCode::RateLimited,
                format!("Rate limit exceeded for tool '{}'", tool_name),
            )
            .with_trace_id(trace_id));
        }

        let headers = message.headers();
        let ctx = ToolContext {
            tenant_id: headers.tenant_id().to_string(),
            trace_id: trace_id.clone(),
            conversation_id: headers.conversation_id().to_string(),
            caller: headers.caller().to_string(),
            metadata: message
                .payload()
                .iter()
                .filter(|(key, _)| !ENVELOPE_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };

        debug!("Accepted {} for {} ({})", tool_name, ctx.caller, trace_id);
        tokio::spawn(Arc::clone(self).execute_tool(tool, handler, arguments, ctx, headers.clone()));

        Ok(Response::ack(format!("Tool '{}' accepted, result follows as callback", tool_name))
            .with_trace_id(trace_id))
    }

    async fn execute_tool(
        self: Arc<Self>,
        tool: Tool,
        handler: Arc<dyn ToolHandler>,
        arguments: Map<String, Value>,
        ctx: ToolContext,
        headers: Headers,
    ) {
        let timeout = Duration::from_secs(tool.timeout);
        let result = match tokio::time::timeout(timeout, handler.call(arguments, ctx)).await {
            Ok(Ok(value)) => {
                let data = match value {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("result".to_string(), other);
                        map
                    }
                };
                self.registry
                    .validate_output(&tool.name, &Value::Object(data.clone()))
                    .map(|_| data)
                    .map_err(|e| format!("Output validation failed: {}", e))
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("Tool '{}' timed out after {}s", tool.name, tool.timeout)),
        };

        if let Err(e) = &result {
            warn!("Tool {} failed for {}: {}", tool.name, headers.trace_id(), e);
        }

        if let Err(e) = self
            .send_callback(headers.reply_to(), &tool.name, result, &headers)
            .await
        {
            error!(
                "Failed to deliver callback for {} to {}: {}",
                headers.trace_id(),
                headers.reply_to(),
                e
            );
        }
    }

    fn handle_callback(&self, message: Message) -> Result<Response> {
        let trace_id = message.trace_id().to_string();
        let trace = self
            .active_traces
            .remove(&trace_id)
            .map(|(_, trace)| trace)
            .filter(|trace| !trace.is_expired(Instant::now()));
        let Some(trace) = trace else {
            warn!(
                "Callback for unknown or expired trace {} from {}",
                trace_id,
                message.headers().caller()
            );
            return Ok(Response::error(
                ErrorCode::UnknownTrace,
                format!("No active trace '{}'", trace_id),
            )
            .with_trace_id(trace_id));
        };

        let payload = message.payload();
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("success") => CallbackStatus::Success,
            _ => CallbackStatus::Error,
        };
        let event = CallbackEvent {
            trace_id: trace_id.clone(),
            tool_name: message
                .payload_str("tool_name")
                .unwrap_or(trace.tool.as_str())
                .to_string(),
            status,
            data: payload.get("data").and_then(Value::as_object).cloned(),
            error: message.payload_str("error").map(str::to_string),
            agent_id: message
                .payload_str("agent_id")
                .unwrap_or(message.headers().caller())
                .to_string(),
            elapsed: trace.started_at.elapsed(),
        };

        debug!("Callback for {} from {} ({:?})", trace_id, event.agent_id, status);
        if self.callbacks.send(event).is_err() {
            debug!("No callback subscribers for {}", trace_id);
        }
        Ok(Response::success("Callback received").with_trace_id(trace_id))
    }

    fn handle_discover(&self, message: Message) -> Result<Response> {
        let tags: Option<Vec<String>> = message
            .payload()
            .get("tags")
            .map(|tags| serde_json::from_value(tags.clone()))
            .transpose()
            .map_err(|e| McpError::validation(format!("'tags' must be a list of strings: {}", e)))?;
        let tools = self.registry.list_tools(tags.as_deref());

        let mut data = Map::new();
        data.insert("agent_id".to_string(), json!(self.config.agent_id));
        data.insert("tools".to_string(), serde_json::to_value(&tools)?);
        Ok(Response::success(format!("{} tools available", tools.len()))
            .with_data(data)
            .with_trace_id(message.trace_id()))
    }

    fn handle_heartbeat(&self, message: Message) -> Result<Response> {
        let mut data = Map::new();
        data.insert("agent_id".to_string(), json!(self.config.agent_id));
        data.insert("tools".to_string(), json!(self.registry.len()));
        data.insert("active_traces".to_string(), json!(self.active_traces.len()));
        data.insert("timestamp".to_string(), json!(Utc::now()));
        Ok(Response::success("alive").with_data(data).with_trace_id(message.trace_id()))
    }
}

/// Routes inbound messages of every served type into the client
struct InboundHandler {
    client: Weak<ClientInner>,
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle(&self, message: Message) -> Result<Response> {
        let client = self
            .client
            .upgrade()
            .ok_or_else(|| McpError::communication("client shut down"))?;
        match message.message_type() {
            MessageType::ToolCall => client.handle_tool_call(message),
            MessageType::Callback => client.handle_callback(message),
            MessageType::DiscoverTools => client.handle_discover(message),
            MessageType::Heartbeat => client.handle_heartbeat(message),
            MessageType::Error => Ok(Response::error(
                ErrorCode::NoHandler,
                "No handler registered for message type 'error'",
            )),
        }
    }
}

#[async_trait]
impl RoutedServer for McpClient {
    fn name(&self) -> &str {
        self.agent_id()
    }

    async fn call_tool(&self, tool_name: &str, arguments: Map<String, Value>, headers: &Headers) -> Result<Response> {
        let mut payload = target_payload(self.agent_id());
        payload.insert("tool_name".to_string(), json!(tool_name));
        payload.insert("arguments".to_string(), Value::Object(arguments));
        let message = Message::new(MessageType::ToolCall, headers.clone(), payload)?;
        Ok(self.inner.protocol.handle_incoming(message).await)
    }

    async fn handle_mcp_message(&self, message: Message) -> Result<Response> {
        Ok(self.inner.protocol.handle_incoming(message).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tool_fn;
    use agentmesh_core::{ResponseStatus, Schema, SchemaType};
    use mockall::mock;

    mock! {
        pub Transport {}

        #[async_trait]
        impl Transport for Transport {
            async fn deliver(&self, target: &str, frame: Vec<u8>) -> Result<Response>;
        }
    }

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn deliver(&self, target: &str, _frame: Vec<u8>) -> Result<Response> {
            Err(McpError::communication(format!("{} unreachable", target)))
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl Transport for Slow {
        async fn deliver(&self, _target: &str, _frame: Vec<u8>) -> Result<Response> {
            tokio::time::sleep(self.0).await;
            Ok(Response::ack("late"))
        }
    }

    fn client_over(transport: Arc<dyn Transport>) -> McpClient {
        McpClient::new(
            ClientConfig {
                agent_id: "agent-a".to_string(),
                ..ClientConfig::default()
            },
            ProtocolConfig::default(),
            CircuitBreakerConfig::default(),
            RegistryConfig::default(),
            transport,
        )
        .unwrap()
    }

    fn client_with(transport: MockTransport) -> McpClient {
        client_over(Arc::new(transport))
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_open_breaker_never_touches_transport() {
        let mut transport = MockTransport::new();
        transport
            .expect_deliver()
            .withf(|target, _| target == "agent-b")
            .times(5)
            .returning(|_, _| Err(McpError::communication("connection refused")));

        let client = client_with(transport);
        for _ in 0..5 {
            let headers = client.headers(None).unwrap();
            let err = client
                .call_tool("agent-b", "echo", args(json!({"text": "hi"})), headers, None)
                .await
                .unwrap_err();
            assert!(matches!(err, McpError::Communication(_)));
        }

        // Sixth call: the mock would panic on a sixth delivery
        let headers = client.headers(None).unwrap();
        let err = client
            .call_tool("agent-b", "echo", args(json!({"text": "hi"})), headers, None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::CircuitBreakerOpen { ref target } if target == "agent-b"));
        assert_eq!(client.active_traces(), 0);
    }

    #[tokio::test]
    async fn test_trace_kept_only_after_ack() {
        let mut transport = MockTransport::new();
        transport
            .expect_deliver()
            .times(1)
            .returning(|_, _| Ok(Response::ack("accepted")));
        transport
            .expect_deliver()
            .times(1)
            .returning(|_, _| Ok(Response::error(ErrorCode::ToolNotFound, "nope")));

        let client = client_with(transport);
        let headers = client.headers(None).unwrap();
        let trace_id = headers.trace_id().to_string();
        let response = client.call_tool("agent-b", "slow", Map::new(), headers, None).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Ack);
        assert!(client.is_trace_active(&trace_id));

        let headers = client.headers(None).unwrap();
        let response = client.call_tool("agent-b", "missing", Map::new(), headers, None).await.unwrap();
        assert_eq!(response.error_code, Some(ErrorCode::ToolNotFound));
        assert_eq!(client.active_traces(), 1);
    }

    #[tokio::test]
    async fn test_timeout_clears_trace() {
        let client = client_over(Arc::new(Slow(Duration::from_millis(200))));
        let headers = client.headers(None).unwrap();
        let trace_id = headers.trace_id().to_string();
        let err = client
            .call_tool("agent-b", "echo", Map::new(), headers, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert!(err.is_retryable());
        assert!(!client.is_trace_active(&trace_id));
        assert_eq!(client.circuit_breaker().snapshot("agent-b").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_acked_trace_expires_and_late_callback_is_refused() {
        let mut transport = MockTransport::new();
        transport
            .expect_deliver()
            .returning(|_, _| Ok(Response::ack("accepted")));

        let client = client_with(transport);
        let headers = client.headers(None).unwrap();
        let trace_id = headers.trace_id().to_string();
        let response = client
            .call_tool("agent-b", "slow", Map::new(), headers, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(response.is_ack());
        assert!(client.is_trace_active(&trace_id));

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Removed by the expiry task, not only hidden by the deadline check
        assert!(!client.inner.active_traces.contains_key(&trace_id));
        assert!(!client.is_trace_active(&trace_id));
        assert_eq!(client.active_traces(), 0);

        let mut callbacks = client.subscribe_callbacks();
        let late_headers = Headers::builder("default", client.reply_to(), "agent-b")
            .trace_id(trace_id.clone())
            .build()
            .unwrap();
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("success"));
        payload.insert("data".to_string(), json!({"result": "too late"}));
        let late = Message::new(MessageType::Callback, late_headers, payload).unwrap();

        let response = client.handle_mcp_message(late).await;
        assert_eq!(response.error_code, Some(ErrorCode::UnknownTrace));
        assert!(callbacks.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_schema_checked_before_send() {
        let mut transport = MockTransport::new();
        transport.expect_deliver().never();

        let client = client_with(transport);
        client
            .register_tool(
                Tool::new("echo", "").with_input_schema(
                    Schema::object().required_property("text", Schema::of(SchemaType::String)),
                ),
                tool_fn(|args, _| async move { Ok(Value::Object(args)) }),
            )
            .unwrap();

        let headers = client.headers(None).unwrap();
        let err = client.call_tool("agent-a", "echo", Map::new(), headers, None).await.unwrap_err();
        assert!(matches!(err, McpError::Validation(_)));
        assert_eq!(client.active_traces(), 0);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_empty() {
        let mut transport = MockTransport::new();
        transport
            .expect_deliver()
            .returning(|_, _| Err(McpError::communication("down")));
        let client = client_with(transport);
        assert!(client.discover_tools("agent-b").await.is_empty());
        assert!(!client.heartbeat("agent-b").await);
    }

    #[tokio::test]
    async fn test_inbound_rejections() {
        let client = client_over(Arc::new(Offline));
        client
            .register_tool(
                Tool::new("secure", "").requiring_auth(),
                tool_fn(|_, _| async { Ok(json!("ok")) }),
            )
            .unwrap();
        client
            .register_tool(
                Tool::new("limited", "").with_rate_limit(1),
                tool_fn(|_, _| async { Ok(json!("ok")) }),
            )
            .unwrap();
        client
            .register_tool(
                Tool::new("checked", "")
                    .with_rate_limit(1)
                    .with_input_schema(Schema::object().required_property("text", Schema::of(SchemaType::String))),
                tool_fn(|_, _| async { Ok(json!("ok")) }),
            )
            .unwrap();

        let headers = Headers::new("t", "mcp://agent-z/receive_callback", "agent-z").unwrap();
        let missing = client.call_tool_local("ghost", &headers).await;
        assert_eq!(missing.error_code, Some(ErrorCode::ToolNotFound));

        let unsigned = client.call_tool_local("secure", &headers).await;
        assert_eq!(unsigned.error_code, Some(ErrorCode::AuthRequired));

        assert_eq!(client.call_tool_local("limited", &headers).await.status, ResponseStatus::Ack);
        let limited = client.call_tool_local("limited", &headers).await;
        assert_eq!(limited.error_code, Some(ErrorCode::RateLimited));

        // Invalid arguments are refused without spending the quota
        let mut bad_args = Map::new();
        bad_args.insert("text".to_string(), json!(5));
        let invalid = client.call_tool_with(&headers, "checked", bad_args).await;
        assert_eq!(invalid.error_code, Some(ErrorCode::ValidationError));
        let invalid = client.call_tool_with(&headers, "checked", Map::new()).await;
        assert_eq!(invalid.error_code, Some(ErrorCode::ValidationError));
        let mut good_args = Map::new();
        good_args.insert("text".to_string(), json!("hi"));
        let accepted = client.call_tool_with(&headers, "checked", good_args.clone()).await;
        assert_eq!(accepted.status, ResponseStatus::Ack);
        let limited = client.call_tool_with(&headers, "checked", good_args).await;
        assert_eq!(limited.error_code, Some(ErrorCode::RateLimited));

        let callback = Message::new(MessageType::Callback, headers.clone(), Map::new()).unwrap();
        let response = client.handle_mcp_message(callback).await;
        assert_eq!(response.error_code, Some(ErrorCode::UnknownTrace));

        let error = Message::new(MessageType::Error, headers.clone(), Map::new()).unwrap();
        assert_eq!(client.handle_mcp_message(error).await.status, ResponseStatus::Error);
    }

    #[tokio::test]
    async fn test_discover_and_heartbeat_handlers() {
        let client = client_over(Arc::new(Offline));
        client
            .register_tool(Tool::new("risk", "").with_tags(["finance"]), tool_fn(|_, _| async { Ok(json!(1)) }))
            .unwrap();
        client
            .register_tool(Tool::new("notes", "").with_tags(["meetings"]), tool_fn(|_, _| async { Ok(json!(1)) }))
            .unwrap();

        let headers = Headers::new("t", "mcp://agent-z/receive_callback", "agent-z").unwrap();
        let mut payload = Map::new();
        payload.insert("tags".to_string(), json!(["finance"]));
        let discover = Message::new(MessageType::DiscoverTools, headers.clone(), payload).unwrap();
        let response = client.handle_mcp_message(discover).await;
        let tools: Vec<Tool> = serde_json::from_value(response.data.unwrap()["tools"].clone()).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "risk");

        let heartbeat = Message::new(MessageType::Heartbeat, headers, Map::new()).unwrap();
        let response = client.handle_mcp_message(heartbeat).await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.data.unwrap()["tools"], 2);
    }

    impl McpClient {
        async fn call_tool_local(&self, tool_name: &str, headers: &Headers) -> Response {
            RoutedServer::call_tool(self, tool_name, Map::new(), headers).await.unwrap()
        }

        async fn call_tool_with(&self, headers: &Headers, tool_name: &str, arguments: Map<String, Value>) -> Response {
            RoutedServer::call_tool(self, tool_name, arguments, headers).await.unwrap()
        }
    }
}
