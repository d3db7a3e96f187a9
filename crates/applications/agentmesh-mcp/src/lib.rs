//! # AgentMesh MCP
//!
//! Runtime layer of the AgentMesh inter-agent RPC substrate.
//!
//! Agents expose named tools and call each other's tools through a router.
//! A call is answered immediately with an `ack`; the tool runs in the
//! background and its result comes back later as a `callback` correlated by
//! trace id.
//!
//! - [`McpClient`]: an agent, both caller and callee
//! - [`Router`]: named servers, broadcast and ordered workflows
//! - [`UiHub`]: activity log, per-server metrics and live observers
//! - [`McpContext`]: wires one process together
//!
//! ```rust,no_run
//! use agentmesh_mcp::{tool_fn, McpContext, MeshConfig};
//! use agentmesh_core::Tool;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> agentmesh_mcp::Result<()> {
//! let ctx = McpContext::new(MeshConfig::default())?;
//! let caller = ctx.spawn_agent("agent-a")?;
//! let callee = ctx.spawn_agent("agent-b")?;
//! callee.register_tool(
//!     Tool::new("echo", "Echo the input"),
//!     tool_fn(|args, _ctx| async move { Ok(json!({"result": args["text"].clone()})) }),
//! )?;
//!
//! let mut callbacks = caller.subscribe_callbacks();
//! let headers = caller.headers(None)?;
//! let trace_id = headers.trace_id().to_string();
//! let arguments = json!({"text": "hi"}).as_object().cloned().unwrap_or_default();
//! let ack = caller.call_tool("agent-b", "echo", arguments, headers, None).await?;
//! assert!(ack.is_ack());
//!
//! let event = callbacks.wait_for(&trace_id, Duration::from_secs(5)).await?;
//! assert_eq!(event.data.unwrap()["result"], "hi");
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod transport;
pub mod workflow;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerState, CircuitState,
};
pub use client::{
    ActiveTrace, CallbackEvent, CallbackStatus, CallbackSubscription, ClientConfig, McpClient,
};
pub use config::MeshConfig;
pub use context::McpContext;
pub use error::{McpError, Result};
pub use hub::{Activity, ActivityType, DashboardData, HubConfig, HubEvent, ServerMetrics, SubscriberId, UiHub};
pub use observability::{init_json_tracing, init_tracing};
pub use protocol::{McpProtocol, MessageHandler, ProtocolConfig};
pub use registry::{tool_fn, RegistryConfig, ToolContext, ToolHandler, ToolRegistry};
pub use router::{RouteOutcome, RoutedServer, Router, RouterConfig, UNRESOLVED_TARGET, WORKFLOW_STEP_TOOL};
pub use transport::{RouterTransport, Transport};
pub use workflow::{StepResult, Workflow, WorkflowConfig, WorkflowStatus, WorkflowStep};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
