//! UI hub: rolling activity log, per-server metrics and live observers.
//!
//! Every notification is synchronous and infallible for the caller. Slow
//! or disconnected observers are dropped instead of applying back-pressure.

use crate::workflow::{Workflow, WorkflowStatus};
use agentmesh_core::{Message, Response};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

/// UI hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Activities retained in the ring buffer
    pub max_activities: usize,
    /// Activities included in dashboard data
    pub recent_activity_limit: usize,
    /// Buffered events per observer before it is dropped
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_activities: 1000,
            recent_activity_limit: 50,
            subscriber_buffer: 64,
        }
    }
}

/// Kind of recorded activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    /// A server answered a routed message
    McpResult,
    /// A routed message failed or was answered with an error
    McpError,
    /// A workflow changed state
    WorkflowUpdate,
}

/// One entry of the activity log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Unique activity id
    pub id: Uuid,
    /// When the activity was recorded
    pub timestamp: DateTime<Utc>,
    /// What kind of event this is
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    /// Message type for MCP traffic, `workflow` for workflow updates
    pub category: String,
    /// Human-readable summary
    pub message: String,
    /// Server, trace, status and timing fields
    pub details: Map<String, Value>,
    /// Workflow the activity belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
}

/// Rolling request counters for one server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMetrics {
    /// Messages routed to the server
    pub total_requests: u64,
    /// Answered with a non-error response
    pub successful_requests: u64,
    /// Undeliverable or answered with an error
    pub failed_requests: u64,
    /// `successful_requests / total_requests`
    pub success_rate: f64,
    /// Time of the last routed message
    pub last_activity: Option<DateTime<Utc>>,
}

impl ServerMetrics {
    fn record(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.success_rate = self.successful_requests as f64 / self.total_requests as f64;
        self.last_activity = Some(Utc::now());
    }
}

/// Event pushed to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum HubEvent {
    /// New activity
    Activity(Activity),
    /// New workflow state
    Workflow(Workflow),
}

/// Handle identifying one observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// Read-only dashboard projection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardData {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Activities currently buffered
    pub total_activities: usize,
    /// Newest first
    pub recent_activities: Vec<Activity>,
    /// Counters per server name
    pub server_metrics: BTreeMap<String, ServerMetrics>,
    /// Workflows still running
    pub active_workflows: usize,
    /// Oldest first
    pub workflows: Vec<Workflow>,
    /// Connected observers
    pub subscriber_count: usize,
}

/// Observability sink fed by the router
pub struct UiHub {
    config: HubConfig,
    activities: Mutex<VecDeque<Activity>>,
    metrics: RwLock<HashMap<String, ServerMetrics>>,
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<HubEvent>>>,
    next_subscriber: AtomicU64,
}

impl UiHub {
    /// Create an empty hub
    pub fn new(config: HubConfig) -> Self {
        Self {
            activities: Mutex::new(VecDeque::with_capacity(config.max_activities.min(1024))),
            metrics: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            config,
        }
    }

    /// Register an observer
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<HubEvent>) {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        self.subscribers.lock().insert(id, tx);
        debug!("UI hub observer {} subscribed", id);
        (id, rx)
    }

    /// Remove an observer; returns whether it was subscribed
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    /// Number of connected observers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Record a response delivered by `server`
    pub fn notify_mcp_result(&self, server: &str, message: &Message, response: &Response, duration_ms: u64) {
        let success = !response.is_error();
        let mut details = message_details(server, message);
        details.insert("status".to_string(), json!(response.status));
        details.insert("duration_ms".to_string(), json!(duration_ms));
        if let Some(code) = response.error_code {
            details.insert("error_code".to_string(), json!(code));
        }

        let activity_type = if success {
            ActivityType::McpResult
        } else {
            ActivityType::McpError
        };
        let text = format!("{} {} on {}: {}", message.message_type(), tool_label(message), server, response.message);
        self.metrics.write().entry(server.to_string()).or_default().record(success);
        self.record(activity_type, message.message_type().as_str(), text, details, workflow_ref(message));
    }

    /// Record a message that could not be delivered to `server`
    pub fn notify_mcp_error(&self, server: &str, message: &Message, error: &str) {
        let mut details = message_details(server, message);
        details.insert("error".to_string(), json!(error));

        let text = format!("{} {} to {} failed: {}", message.message_type(), tool_label(message), server, error);
        self.metrics.write().entry(server.to_string()).or_default().record(false);
        self.record(ActivityType::McpError, message.message_type().as_str(), text, details, workflow_ref(message));
    }

    /// Store and publish a workflow's latest state
    pub fn notify_workflow_update(&self, workflow: &Workflow) {
        self.workflows.write().insert(workflow.id, workflow.clone());

        let mut details = Map::new();
        details.insert("name".to_string(), json!(workflow.config.name));
        details.insert("status".to_string(), json!(workflow.status));
        details.insert("steps".to_string(), json!(workflow.steps.len()));
        let text = format!(
            "Workflow '{}' {:?} after {} steps",
            workflow.config.name,
            workflow.status,
            workflow.steps.len()
        );
        self.record(ActivityType::WorkflowUpdate, "workflow", text, details, Some(workflow.id));
        self.broadcast(HubEvent::Workflow(workflow.clone()));
    }

    /// Dashboard snapshot
    pub fn get_dashboard_data(&self) -> DashboardData {
        let (total_activities, recent_activities) = {
            let activities = self.activities.lock();
            let recent = activities
                .iter()
                .rev()
                .take(self.config.recent_activity_limit)
                .cloned()
                .collect();
            (activities.len(), recent)
        };

        let mut workflows: Vec<Workflow> = self.workflows.read().values().cloned().collect();
        workflows.sort_by_key(|w| w.created_at);

        DashboardData {
            timestamp: Utc::now(),
            total_activities,
            recent_activities,
            server_metrics: self.get_server_metrics(),
            active_workflows: workflows
                .iter()
                .filter(|w| w.status == WorkflowStatus::Running)
                .count(),
            workflows,
            subscriber_count: self.subscriber_count(),
        }
    }

    /// Latest known state of a workflow
    pub fn get_workflow_status(&self, id: Uuid) -> Option<Workflow> {
        self.workflows.read().get(&id).cloned()
    }

    /// Metrics of every server seen so far
    pub fn get_server_metrics(&self) -> BTreeMap<String, ServerMetrics> {
        self.metrics
            .read()
            .iter()
            .map(|(name, metrics)| (name.clone(), metrics.clone()))
            .collect()
    }

    /// Up to `limit` activities, newest first
    pub fn recent_activities(&self, limit: usize) -> Vec<Activity> {
        self.activities.lock().iter().rev().take(limit).cloned().collect()
    }

    fn record(
        &self,
        activity_type: ActivityType,
        category: &str,
        message: String,
        details: Map<String, Value>,
        workflow_id: Option<Uuid>,
    ) {
        let activity = Activity {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            activity_type,
            category: category.to_string(),
            message,
            details,
            workflow_id,
        };

        {
            let mut activities = self.activities.lock();
            activities.push_back(activity.clone());
            while activities.len() > self.config.max_activities {
                activities.pop_front();
            }
        }

        self.broadcast(HubEvent::Activity(activity));
    }

    fn broadcast(&self, event: HubEvent) {
        self.subscribers.lock().retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Dropping slow UI hub observer {}", id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("UI hub observer {} disconnected", id);
                false
            }
        });
    }
}

impl Default for UiHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

fn message_details(server: &str, message: &Message) -> Map<String, Value> {
    let headers = message.headers();
    let mut details = Map::new();
    details.insert("server".to_string(), json!(server));
    details.insert("trace_id".to_string(), json!(headers.trace_id()));
    details.insert("tenant_id".to_string(), json!(headers.tenant_id()));
    details.insert("caller".to_string(), json!(headers.caller()));
    if let Some(tool) = message.payload_str("tool_name") {
        details.insert("tool_name".to_string(), json!(tool));
    }
    details
}

fn tool_label(message: &Message) -> String {
    message
        .payload_str("tool_name")
        .map(|tool| format!("'{}'", tool))
        .unwrap_or_default()
}

fn workflow_ref(message: &Message) -> Option<Uuid> {
    message
        .payload_str("workflow_id")
        .and_then(|id| Uuid::parse_str(id).ok())
}
