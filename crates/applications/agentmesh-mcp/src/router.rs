//! Multi-server router: point-to-point routing, broadcast and ordered
//! cross-system workflows.

use crate::error::{McpError, Result};
use crate::hub::UiHub;
use crate::workflow::{StepResult, Workflow, WorkflowConfig, WorkflowStatus, WorkflowStep};
use agentmesh_core::{
    ErrorCode, Headers, Message, MessageSigner, MessageType, ReplyTo, Response, TARGET_SERVER_KEY,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tool name step callbacks are addressed to on the initiator
pub const WORKFLOW_STEP_TOOL: &str = "workflow_step";

/// Hub server key for messages that name no target
pub const UNRESOLVED_TARGET: &str = "<unresolved>";

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Caller name on messages the router originates
    pub router_id: String,
    /// Key used to re-sign broadcast copies and workflow steps
    pub signing_key: Option<String>,
    /// How long an acknowledged workflow step may take to call back
    #[serde(rename = "step_timeout_ms", with = "crate::config::duration_ms")]
    pub step_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            router_id: "router".to_string(),
            signing_key: None,
            step_timeout: Duration::from_secs(30),
        }
    }
}

/// A server the router can deliver to
#[async_trait]
pub trait RoutedServer: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Invoke a tool directly
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
        headers: &Headers,
    ) -> Result<Response>;

    /// Handle a routed message.
    ///
    /// The default turns a `tool_call` into [`RoutedServer::call_tool`] and
    /// answers `NO_HANDLER` to everything else.
    async fn handle_mcp_message(&self, message: Message) -> Result<Response> {
        match message.message_type() {
            MessageType::ToolCall => {
                let tool_name = message
                    .payload_str("tool_name")
                    .ok_or_else(|| McpError::validation("tool_call payload is missing 'tool_name'"))?
                    .to_string();
                let arguments = message
                    .payload()
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.call_tool(&tool_name, arguments, message.headers()).await
            }
            other => Ok(Response::error(
                ErrorCode::NoHandler,
                format!("{} does not handle '{}' messages", self.name(), other),
            )
            .with_trace_id(message.trace_id())),
        }
    }
}

/// Result of routing one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOutcome {
    /// Server the message was addressed to
    pub target: String,
    /// The server answered with a non-error response
    pub success: bool,
    /// The server's response, when it was reached
    pub response: Option<Response>,
    /// Why the route failed
    pub error: Option<String>,
    /// Wall time spent routing
    pub duration_ms: u64,
}

impl RouteOutcome {
    fn failed(target: &str, error: String, started: Instant) -> Self {
        Self {
            target: target.to_string(),
            success: false,
            response: None,
            error: Some(error),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

struct WorkflowEntry {
    state: RwLock<Workflow>,
    // held for the whole of a step so steps of one workflow never overlap
    step_gate: tokio::sync::Mutex<()>,
}

/// Routes messages between registered servers
pub struct Router {
    config: RouterConfig,
    signer: Option<MessageSigner>,
    servers: RwLock<BTreeMap<String, Arc<dyn RoutedServer>>>,
    workflows: DashMap<Uuid, Arc<WorkflowEntry>>,
    // acknowledged workflow steps waiting for their callback, by trace id
    pending_steps: DashMap<String, oneshot::Sender<Message>>,
    hub: Option<Arc<UiHub>>,
}

impl Router {
    /// Create a router, optionally reporting to a UI hub
    pub fn new(config: RouterConfig, hub: Option<Arc<UiHub>>) -> Result<Self> {
        let signer = match &config.signing_key {
            Some(key) => Some(MessageSigner::new(key)?),
            None => None,
        };
        ReplyTo::new(config.router_id.clone(), WORKFLOW_STEP_TOOL)?;

        Ok(Self {
            config,
            signer,
            servers: RwLock::new(BTreeMap::new()),
            workflows: DashMap::new(),
            pending_steps: DashMap::new(),
            hub,
        })
    }

    /// Register a server under `name`, replacing any previous one
    pub fn register_server(&self, name: impl Into<String>, server: Arc<dyn RoutedServer>) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(McpError::validation("server name must not be empty"));
        }
        if self.servers.write().insert(name.clone(), server).is_some() {
            warn!("Server {} re-registered, previous handle replaced", name);
        } else {
            info!("Registered server {} with router {}", name, self.config.router_id);
        }
        Ok(())
    }

    /// Remove a server; returns whether it was registered
    pub fn unregister_server(&self, name: &str) -> bool {
        let removed = self.servers.write().remove(name).is_some();
        if removed {
            info!("Unregistered server {}", name);
        }
        removed
    }

    /// Registered server names, sorted
    pub fn server_names(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    /// Handle of a registered server
    pub fn get_server(&self, name: &str) -> Option<Arc<dyn RoutedServer>> {
        self.servers.read().get(name).cloned()
    }

    /// Remove every server
    pub fn clear_servers(&self) {
        let mut servers = self.servers.write();
        info!("Router {} releasing {} servers", self.config.router_id, servers.len());
        servers.clear();
    }

    /// Route to the server the message names (see [`Message::target_server`])
    pub async fn route_mcp_message(&self, message: Message) -> RouteOutcome {
        match message.target_server() {
            Some(target) => self.route_to(&target, message).await,
            None => {
                let error = format!(
                    "Message {} names no target server. Available servers: [{}]",
                    message.trace_id(),
                    self.server_names().join(", ")
                );
                warn!("{}", error);
                if let Some(hub) = &self.hub {
                    hub.notify_mcp_error(UNRESOLVED_TARGET, &message, &error);
                }
                RouteOutcome::failed(UNRESOLVED_TARGET, error, Instant::now())
            }
        }
    }

    /// Deliver `message` to `target` and report the outcome to the hub.
    ///
    /// Callbacks of acknowledged workflow steps are taken by the router
    /// itself instead of being delivered.
    pub async fn route_to(&self, target: &str, message: Message) -> RouteOutcome {
        let started = Instant::now();
        if message.message_type() == MessageType::Callback
            && self.pending_steps.contains_key(message.trace_id())
        {
            return self.accept_step_callback(target, message, started);
        }
        let Some(server) = self.get_server(target) else {
            let error = format!(
                "Unknown target server '{}'. Available servers: [{}]",
                target,
                self.server_names().join(", ")
            );
            warn!("{}", error);
            if let Some(hub) = &self.hub {
                hub.notify_mcp_error(target, &message, &error);
            }
            return RouteOutcome::failed(target, error, started);
        };

        debug!("Routing {} {} to {}", message.message_type(), message.trace_id(), target);
        let result = server.handle_mcp_message(message.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                if let Some(hub) = &self.hub {
                    hub.notify_mcp_result(target, &message, &response, duration_ms);
                }
                let success = !response.is_error();
                RouteOutcome {
                    target: target.to_string(),
                    success,
                    error: (!success).then(|| response.message.clone()),
                    response: Some(response),
                    duration_ms,
                }
            }
            Err(e) => {
                warn!("Server {} failed on {}: {}", target, message.trace_id(), e);
                if let Some(hub) = &self.hub {
                    hub.notify_mcp_error(target, &message, &e.to_string());
                }
                RouteOutcome {
                    target: target.to_string(),
                    success: false,
                    response: None,
                    error: Some(e.to_string()),
                    duration_ms,
                }
            }
        }
    }

    /// Send an independent copy of `message` to every server not in
    /// `exclude`, concurrently.
    ///
    /// Each copy is traced as `<trace>:<server>`. One failing server never
    /// affects the others.
    pub async fn broadcast_to_all_servers(
        &self,
        message: Message,
        exclude: &[String],
    ) -> BTreeMap<String, RouteOutcome> {
        let targets: Vec<String> = self
            .server_names()
            .into_iter()
            .filter(|name| !exclude.contains(name))
            .collect();
        debug!("Broadcasting {} to {} servers", message.trace_id(), targets.len());

        let deliveries = targets.into_iter().map(|target| {
            let copy = self.broadcast_copy(&message, &target);
            async move {
                let outcome = match copy {
                    Ok(copy) => self.route_to(&target, copy).await,
                    Err(e) => RouteOutcome::failed(&target, e.to_string(), Instant::now()),
                };
                (target, outcome)
            }
        });

        join_all(deliveries).await.into_iter().collect()
    }

    fn accept_step_callback(&self, target: &str, message: Message, started: Instant) -> RouteOutcome {
        let trace_id = message.trace_id().to_string();
        let forged = message.headers().auth_signature().is_some()
            && self.signer.as_ref().is_some_and(|signer| !signer.verify(&message));

        let mut waiter = None;
        let response = if forged {
            warn!("Workflow step callback {} from {} has an invalid signature", trace_id, target);
            Response::error(
                ErrorCode::InvalidSignature,
                format!("Invalid signature on workflow step callback {}", trace_id),
            )
        } else {
            waiter = self.pending_steps.remove(&trace_id).map(|(_, waiter)| waiter);
            match waiter {
                Some(_) => Response::success("Workflow step result recorded"),
                None => Response::error(ErrorCode::UnknownTrace, format!("No pending workflow step '{}'", trace_id)),
            }
        }
        .with_trace_id(trace_id.clone());

        let duration_ms = started.elapsed().as_millis() as u64;
        if let Some(hub) = &self.hub {
            hub.notify_mcp_result(target, &message, &response, duration_ms);
        }
        if let Some(waiter) = waiter {
            if waiter.send(message).is_err() {
                debug!("Workflow step {} stopped waiting before its callback", trace_id);
            }
        }

        let success = !response.is_error();
        RouteOutcome {
            target: target.to_string(),
            success,
            error: (!success).then(|| response.message.clone()),
            response: Some(response),
            duration_ms,
        }
    }

    fn broadcast_copy(&self, message: &Message, target: &str) -> Result<Message> {
        let copy = message
            .clone()
            .with_trace_id(format!("{}:{}", message.trace_id(), target))?;
        self.sign(copy)
    }

    fn sign(&self, message: Message) -> Result<Message> {
        match &self.signer {
            Some(signer) => Ok(signer.sign_message(message)?),
            None => Ok(message),
        }
    }

    /// Create a running workflow
    pub fn start_cross_system_workflow(&self, config: WorkflowConfig) -> Result<Uuid> {
        if config.name.trim().is_empty() {
            return Err(McpError::validation("workflow name must not be empty"));
        }
        if config.tenant_id.trim().is_empty() {
            return Err(McpError::validation("workflow tenant_id must not be empty"));
        }
        ReplyTo::new(config.initiator.clone(), WORKFLOW_STEP_TOOL)?;

        let workflow = Workflow::new(config);
        let id = workflow.id;
        info!("Started workflow {} ({})", workflow.config.name, id);
        if let Some(hub) = &self.hub {
            hub.notify_workflow_update(&workflow);
        }
        self.workflows.insert(
            id,
            Arc::new(WorkflowEntry {
                state: RwLock::new(workflow),
                step_gate: tokio::sync::Mutex::new(()),
            }),
        );
        Ok(id)
    }

    /// Run one step and append its result.
    ///
    /// Steps of one workflow run one at a time in submission order; the
    /// payload carries the workflow id, step number, shared context and the
    /// previous step's result. A step answered with `ack` completes when its
    /// callback arrives, or fails after `step_timeout`.
    pub async fn execute_workflow_step(&self, workflow_id: Uuid, step: WorkflowStep) -> Result<StepResult> {
        let entry = self
            .workflows
            .get(&workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| McpError::NotFound(format!("workflow {}", workflow_id)))?;
        let _gate = entry.step_gate.lock().await;

        let (config, step_number, previous_result) = {
            let workflow = entry.state.read();
            if !workflow.is_running() {
                return Err(McpError::validation(format!(
                    "workflow {} is {:?}, no further steps accepted",
                    workflow_id, workflow.status
                )));
            }
            (workflow.config.clone(), workflow.next_step_number(), workflow.previous_result())
        };

        let headers = Headers::builder(
            config.tenant_id.clone(),
            format!("mcp://{}/{}", config.initiator, WORKFLOW_STEP_TOOL),
            self.config.router_id.clone(),
        )
        .conversation_id(workflow_id.to_string())
        .build()?;

        let mut payload = Map::new();
        payload.insert("tool_name".to_string(), json!(step.tool));
        payload.insert("arguments".to_string(), Value::Object(step.arguments));
        payload.insert(TARGET_SERVER_KEY.to_string(), json!(step.target_server));
        payload.insert("workflow_id".to_string(), json!(workflow_id));
        payload.insert("step_number".to_string(), json!(step_number));
        payload.insert("context".to_string(), Value::Object(config.context));
        payload.insert("previous_result".to_string(), previous_result);
        let message = self.sign(Message::new(MessageType::ToolCall, headers, payload)?)?;

        let trace_id = message.trace_id().to_string();
        let (waiter, callback) = oneshot::channel();
        self.pending_steps.insert(trace_id.clone(), waiter);

        debug!("Workflow {} step {} -> {}/{}", workflow_id, step_number, step.target_server, step.tool);
        let outcome = self.route_to(&step.target_server, message).await;
        let (success, result, error) = match outcome.response {
            Some(response) if response.is_ack() => self.await_step_callback(&trace_id, callback).await,
            response => (
                outcome.success,
                response.and_then(|response| response.data).map(Value::Object),
                outcome.error,
            ),
        };
        self.pending_steps.remove(&trace_id);

        let result = StepResult {
            step_number,
            target_server: step.target_server,
            tool: step.tool,
            success,
            result,
            error,
            timestamp: Utc::now(),
        };

        let snapshot = {
            let mut workflow = entry.state.write();
            workflow.steps.push(result.clone());
            workflow.updated_at = result.timestamp;
            workflow.clone()
        };
        if let Some(hub) = &self.hub {
            hub.notify_workflow_update(&snapshot);
        }
        Ok(result)
    }

    async fn await_step_callback(
        &self,
        trace_id: &str,
        callback: oneshot::Receiver<Message>,
    ) -> (bool, Option<Value>, Option<String>) {
        match tokio::time::timeout(self.config.step_timeout, callback).await {
            Ok(Ok(callback)) => {
                let success = callback.payload_str("status") == Some("success");
                let result = callback.payload().get("data").cloned();
                let error = callback.payload_str("error").map(str::to_string);
                (success, result, error)
            }
            Ok(Err(_)) => (false, None, Some(format!("Workflow step {} was abandoned", trace_id))),
            Err(_) => {
                warn!("Workflow step {} sent no callback within {:?}", trace_id, self.config.step_timeout);
                (
                    false,
                    None,
                    Some(format!(
                        "No callback for step {} within {}ms",
                        trace_id,
                        self.config.step_timeout.as_millis()
                    )),
                )
            }
        }
    }

    /// Close a workflow as completed or failed
    pub fn complete_workflow(&self, workflow_id: Uuid, success: bool) -> Result<Workflow> {
        let entry = self
            .workflows
            .get(&workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| McpError::NotFound(format!("workflow {}", workflow_id)))?;

        let snapshot = {
            let mut workflow = entry.state.write();
            if !workflow.is_running() {
                return Err(McpError::validation(format!(
                    "workflow {} already finished",
                    workflow_id
                )));
            }
            workflow.status = if success {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Failed
            };
            workflow.updated_at = Utc::now();
            workflow.clone()
        };

        info!("Workflow {} finished as {:?}", workflow_id, snapshot.status);
        if let Some(hub) = &self.hub {
            hub.notify_workflow_update(&snapshot);
        }
        Ok(snapshot)
    }

    /// Current state of a workflow
    pub fn get_workflow(&self, workflow_id: Uuid) -> Option<Workflow> {
        self.workflows
            .get(&workflow_id)
            .map(|entry| entry.state.read().clone())
    }

    /// All workflows, oldest first
    pub fn list_workflows(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self
            .workflows
            .iter()
            .map(|entry| entry.state.read().clone())
            .collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("router_id", &self.config.router_id)
            .field("servers", &self.server_names())
            .field("workflows", &self.workflows.len())
            .finish()
    }
}
