//! Cross-system workflow records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Parameters of a new workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow name
    pub name: String,
    /// What the workflow does
    #[serde(default)]
    pub description: String,
    /// Tenant every step runs under
    pub tenant_id: String,
    /// Agent that owns the workflow; step callbacks go to it
    pub initiator: String,
    /// Shared context handed to every step
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl WorkflowConfig {
    /// Config with an empty context
    pub fn new(
        name: impl Into<String>,
        tenant_id: impl Into<String>,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tenant_id: tenant_id.into(),
            initiator: initiator.into(),
            context: Map::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a shared context entry
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// One step to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Server that runs the step
    pub target_server: String,
    /// Tool to call on it
    pub tool: String,
    /// Tool arguments
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl WorkflowStep {
    /// Step calling `tool` on `target_server`
    pub fn new(
        target_server: impl Into<String>,
        tool: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            target_server: target_server.into(),
            tool: tool.into(),
            arguments,
        }
    }
}

/// Workflow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Accepting steps
    Running,
    /// Finished successfully
    Completed,
    /// Finished with a failure
    Failed,
}

/// Recorded outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// 1-based position in the workflow
    pub step_number: u32,
    /// Server that ran the step
    pub target_server: String,
    /// Tool that was called
    pub tool: String,
    /// Whether the route succeeded
    pub success: bool,
    /// Response data of a successful step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error of a failed step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the step finished
    pub timestamp: DateTime<Utc>,
}

/// Ordered multi-step run across servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow id
    pub id: Uuid,
    /// Creation parameters
    pub config: WorkflowConfig,
    /// Lifecycle state
    pub status: WorkflowStatus,
    /// Step results in submission order
    pub steps: Vec<StepResult>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last change
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub(crate) fn new(config: WorkflowConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            config,
            status: WorkflowStatus::Running,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether steps may still be added
    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::Running
    }

    /// Number the next step will get
    pub fn next_step_number(&self) -> u32 {
        self.steps.len() as u32 + 1
    }

    /// Result, or error text, of the last step
    pub fn previous_result(&self) -> Value {
        match self.steps.last() {
            Some(step) => match (&step.result, &step.error) {
                (Some(result), _) => result.clone(),
                (None, Some(error)) => Value::String(error.clone()),
                (None, None) => Value::Null,
            },
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_numbering_and_previous_result() {
        let mut workflow = Workflow::new(WorkflowConfig::new("review", "t", "agent-a"));
        assert_eq!(workflow.next_step_number(), 1);
        assert_eq!(workflow.previous_result(), Value::Null);

        workflow.steps.push(StepResult {
            step_number: 1,
            target_server: "finance".into(),
            tool: "risk".into(),
            success: true,
            result: Some(json!({"score": 3})),
            error: None,
            timestamp: Utc::now(),
        });
        assert_eq!(workflow.next_step_number(), 2);
        assert_eq!(workflow.previous_result(), json!({"score": 3}));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(WorkflowStatus::Running).unwrap(), json!("running"));
        let config = WorkflowConfig::new("w", "t", "a").with_context("quarter", json!("Q3"));
        let wire = serde_json::to_value(&config).unwrap();
        assert_eq!(wire["context"]["quarter"], "Q3");
    }
}
