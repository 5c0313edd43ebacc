/// Runtime (scheduler-side) workflow model
///
/// The normalized view of what the scheduler currently runs. It reuses the declared
/// task and edge types so both copies diff against each other directly; the extra
/// pieces here are the rename plan and the issues collected during a sync attempt.

use crate::workflow::types::{Edge, Task, TaskCode, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A task as read from the scheduler
pub type RuntimeTaskDefinition = Task;

/// An explicit dependency as read from the scheduler
pub type RuntimeTaskEdge = Edge;

/// Normalized scheduler export, rebuilt on every sync attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeWorkflowDefinition {
    /// Definition with unique task names and explicit edges
    pub definition: WorkflowDefinition,
    pub rename_plan: Vec<RenamePlanEntry>,
    /// Export exactly as the scheduler returned it
    pub raw_definition: Value,
}

/// One task renamed to keep display names unique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenamePlanEntry {
    pub task_code: TaskCode,
    pub original_name: String,
    pub resolved_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Error,
    Warning,
}

/// Finding reported while previewing or executing a sync
///
/// Any ERROR issue blocks the commit; warnings are informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncIssue {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_code: Option<TaskCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// Offending raw value, e.g. an unresolved table name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_name: Option<String>,
}

impl SyncIssue {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warning, message)
    }

    fn new(code: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity,
            message: message.into(),
            workflow_code: None,
            workflow_name: None,
            task_code: None,
            task_name: None,
            node_type: None,
            raw_name: None,
        }
    }

    pub fn with_workflow(mut self, definition: &WorkflowDefinition) -> Self {
        self.workflow_code = Some(definition.workflow_code);
        self.workflow_name = Some(definition.name.clone());
        self
    }

    pub fn with_task(mut self, task: &Task) -> Self {
        self.task_code = Some(task.task_code);
        self.task_name = Some(task.name.clone());
        self.node_type = Some(task.node_type.to_string());
        self
    }

    pub fn with_raw_name(mut self, raw_name: impl Into<String>) -> Self {
        self.raw_name = Some(raw_name.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Datasource as listed by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceInfo {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}
