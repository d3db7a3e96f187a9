//! Agents talking through one mesh context: ack first, result by callback

use agentmesh_core::{ErrorCode, ResponseStatus, Schema, SchemaType, Tool};
use agentmesh_mcp::{
    tool_fn, ActivityType, CallbackStatus, McpClient, McpContext, McpError, MeshConfig, Result,
};
use serde_json::{json, Map, Value};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn echo_tool() -> Tool {
    Tool::new("echo", "Echo the given text")
        .with_input_schema(Schema::object().required_property("text", Schema::of(SchemaType::String)))
        .with_tags(["demo"])
}

fn register_echo(agent: &McpClient) -> Result<()> {
    agent.register_tool(
        echo_tool(),
        tool_fn(|args, _ctx| async move {
            let text = args.get("text").cloned().unwrap_or(Value::Null);
            Ok(text)
        }),
    )
}

#[tokio::test]
async fn test_echo_ack_then_callback() -> Result<()> {
    let ctx = McpContext::new(MeshConfig::default())?;
    let caller = ctx.spawn_agent("agent-a")?;
    let callee = ctx.spawn_agent("agent-b")?;
    register_echo(&callee)?;

    let discovered = caller.discover_tools("agent-b").await;
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].name, "echo");

    let mut callbacks = caller.subscribe_callbacks();
    let headers = caller.headers(Some("tenant-1"))?;
    let trace_id = headers.trace_id().to_string();
    let response = caller
        .call_tool("agent-b", "echo", args(json!({"text": "hi"})), headers, None)
        .await?;
    assert_eq!(response.status, ResponseStatus::Ack);
    assert_eq!(response.trace_id.as_deref(), Some(trace_id.as_str()));

    let event = callbacks.wait_for(&trace_id, WAIT).await?;
    assert_eq!(event.status, CallbackStatus::Success);
    assert_eq!(event.tool_name, "echo");
    assert_eq!(event.agent_id, "agent-b");
    assert_eq!(event.data.unwrap()["result"], "hi");
    assert!(!caller.is_trace_active(&trace_id));
    Ok(())
}

#[tokio::test]
async fn test_missing_field_fails_before_sending() -> Result<()> {
    let ctx = McpContext::new(MeshConfig::default())?;
    let caller = ctx.spawn_agent("agent-a")?;
    let callee = ctx.spawn_agent("agent-b")?;
    register_echo(&callee)?;
    caller.discover_tools("agent-b").await;

    let before = ctx.hub().get_dashboard_data().total_activities;
    let err = caller
        .call_tool("agent-b", "echo", Map::new(), caller.headers(None)?, None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Validation(ref m) if m.contains("text")));
    assert_eq!(caller.active_traces(), 0);
    // Nothing reached the router
    assert_eq!(ctx.hub().get_dashboard_data().total_activities, before);
    Ok(())
}

#[tokio::test]
async fn test_callee_rejects_invalid_arguments_without_discovery() -> Result<()> {
    let ctx = McpContext::new(MeshConfig::default())?;
    let caller = ctx.spawn_agent("agent-a")?;
    let callee = ctx.spawn_agent("agent-b")?;
    register_echo(&callee)?;

    let response = caller
        .call_tool("agent-b", "echo", args(json!({"text": 5})), caller.headers(None)?, None)
        .await?;
    assert_eq!(response.error_code, Some(ErrorCode::ValidationError));
    assert_eq!(caller.active_traces(), 0);

    let response = caller
        .call_tool("agent-b", "nope", Map::new(), caller.headers(None)?, None)
        .await?;
    assert_eq!(response.error_code, Some(ErrorCode::ToolNotFound));
    Ok(())
}

#[tokio::test]
async fn test_handler_failure_arrives_as_error_callback() -> Result<()> {
    let ctx = McpContext::new(MeshConfig::default())?;
    let caller = ctx.spawn_agent("agent-a")?;
    let callee = ctx.spawn_agent("agent-b")?;
    callee.register_tool(
        Tool::new("explode", "Always fails"),
        tool_fn(|_, _| async { Err(McpError::handler("provider unavailable")) }),
    )?;
    callee.register_tool(
        Tool::new("sleepy", "Too slow").with_timeout(0),
        tool_fn(|_, _| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!("late"))
        }),
    )?;

    let mut callbacks = caller.subscribe_callbacks();

    let headers = caller.headers(None)?;
    let trace_id = headers.trace_id().to_string();
    let ack = caller.call_tool("agent-b", "explode", Map::new(), headers, None).await?;
    assert!(ack.is_ack());
    let event = callbacks.wait_for(&trace_id, WAIT).await?;
    assert_eq!(event.status, CallbackStatus::Error);
    assert!(event.error.unwrap().contains("provider unavailable"));

    let headers = caller.headers(None)?;
    let trace_id = headers.trace_id().to_string();
    caller.call_tool("agent-b", "sleepy", Map::new(), headers, None).await?;
    let event = callbacks.wait_for(&trace_id, WAIT).await?;
    assert_eq!(event.status, CallbackStatus::Error);
    assert!(event.error.unwrap().contains("timed out"));
    Ok(())
}

#[tokio::test]
async fn test_output_schema_violation_reported() -> Result<()> {
    let ctx = McpContext::new(MeshConfig::default())?;
    let caller = ctx.spawn_agent("agent-a")?;
    let callee = ctx.spawn_agent("agent-b")?;
    callee.register_tool(
        Tool::new("summarize", "Summarize a transcript")
            .with_output_schema(Schema::object().required_property("summary", Schema::of(SchemaType::String))),
        tool_fn(|_, _| async { Ok(json!({"words": 3})) }),
    )?;

    let mut callbacks = caller.subscribe_callbacks();
    let headers = caller.headers(None)?;
    let trace_id = headers.trace_id().to_string();
    caller.call_tool("agent-b", "summarize", Map::new(), headers, None).await?;

    let event = callbacks.wait_for(&trace_id, WAIT).await?;
    assert_eq!(event.status, CallbackStatus::Error);
    assert!(event.error.unwrap().contains("summary"));
    Ok(())
}

#[tokio::test]
async fn test_late_callback_is_unknown_trace() -> Result<()> {
    let ctx = McpContext::new(MeshConfig::default())?;
    let caller = ctx.spawn_agent("agent-a")?;
    let other = ctx.spawn_agent("agent-b")?;

    let headers = caller.headers(None)?;
    let response = other
        .send_callback(&caller.reply_to(), "echo", Ok(Map::new()), &headers)
        .await?;
    assert_eq!(response.error_code, Some(ErrorCode::UnknownTrace));

    let err = other
        .send_callback("http://bad", "echo", Ok(Map::new()), &headers)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn test_signed_mesh_enforces_auth() -> Result<()> {
    let mut config = MeshConfig::default();
    config.protocol.signing_key = Some("shared-secret".to_string());
    config.router.signing_key = Some("shared-secret".to_string());
    config.protocol.require_signatures = true;
    let ctx = McpContext::new(config)?;

    let caller = ctx.spawn_agent("agent-a")?;
    let callee = ctx.spawn_agent("agent-b")?;
    callee.register_tool(
        Tool::new("ledger", "Read the ledger").requiring_auth(),
        tool_fn(|_, _| async { Ok(json!({"balance": 10})) }),
    )?;

    let mut callbacks = caller.subscribe_callbacks();
    let headers = caller.headers(None)?;
    let trace_id = headers.trace_id().to_string();
    let ack = caller.call_tool("agent-b", "ledger", Map::new(), headers, None).await?;
    assert!(ack.is_ack());
    let event = callbacks.wait_for(&trace_id, WAIT).await?;
    assert_eq!(event.data.unwrap()["balance"], 10);

    // An unsigned frame injected straight into the callee is refused
    let unsigned = agentmesh_core::Message::new(
        agentmesh_core::MessageType::Heartbeat,
        caller.headers(None)?,
        Map::new(),
    )?;
    let response = callee.handle_mcp_message(unsigned).await;
    assert_eq!(response.error_code, Some(ErrorCode::InvalidSignature));
    Ok(())
}

#[tokio::test]
async fn test_hub_sees_every_route() -> Result<()> {
    let ctx = McpContext::new(MeshConfig::default())?;
    let (_id, mut events) = ctx.hub().subscribe();
    let caller = ctx.spawn_agent("agent-a")?;
    let callee = ctx.spawn_agent("agent-b")?;
    register_echo(&callee)?;

    let mut callbacks = caller.subscribe_callbacks();
    let headers = caller.headers(None)?;
    let trace_id = headers.trace_id().to_string();
    caller
        .call_tool("agent-b", "echo", args(json!({"text": "hi"})), headers, None)
        .await?;
    callbacks.wait_for(&trace_id, WAIT).await?;

    // tool_call routed to agent-b, callback routed back to agent-a; the
    // callback is recorded once agent-a's handler has returned
    let deadline = tokio::time::Instant::now() + WAIT;
    while !ctx.hub().get_server_metrics().contains_key("agent-a") {
        assert!(tokio::time::Instant::now() < deadline, "callback never recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let metrics = ctx.hub().get_server_metrics();
    assert_eq!(metrics["agent-b"].successful_requests, 1);
    assert_eq!(metrics["agent-a"].successful_requests, 1);

    let first = events.recv().await.expect("hub event");
    assert!(matches!(
        first,
        agentmesh_mcp::HubEvent::Activity(ref activity) if activity.activity_type == ActivityType::McpResult
    ));
    Ok(())
}
