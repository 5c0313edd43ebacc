/// Core workflow type definitions
///
/// Declared workflow structure shared by the platform copy and the normalized
/// scheduler copy: tasks keyed by stable integer codes, dependency edges between
/// those codes, and an optional schedule. These types are plain values; every
/// algorithm in the crate consumes them by reference and never mutates a
/// committed copy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Stable task identity assigned once by the scheduler
pub type TaskCode = i64;

/// Upstream code of a workflow entry edge
pub const ENTRY_SENTINEL: TaskCode = 0;

/// Node types that are carried through sync without lineage analysis
const GENERIC_NODE_TYPES: &[&str] = &[
    "PYTHON",
    "PROCEDURE",
    "HTTP",
    "DEPENDENT",
    "SUB_PROCESS",
    "SUB_WORKFLOW",
    "CONDITIONS",
    "SWITCH",
    "DATAX",
    "SPARK",
    "FLINK",
    "HIVECLI",
    "MR",
];

/// Task node type
///
/// SQL tasks take part in lineage inference. SHELL and the generic scheduler types
/// are synced as opaque steps. Anything else is rejected during normalization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum NodeType {
    Sql,
    Shell,
    Generic(String),
}

impl NodeType {
    /// Map an external node type string, `None` when unrecognized
    pub fn parse(raw: &str) -> Option<NodeType> {
        let upper = raw.trim().to_ascii_uppercase();
        match upper.as_str() {
            "SQL" => Some(NodeType::Sql),
            "SHELL" => Some(NodeType::Shell),
            other if GENERIC_NODE_TYPES.contains(&other) => Some(NodeType::Generic(upper)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Sql => "SQL",
            NodeType::Shell => "SHELL",
            NodeType::Generic(name) => name,
        }
    }

    pub fn is_sql(&self) -> bool {
        matches!(self, NodeType::Sql)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<NodeType> for String {
    fn from(node_type: NodeType) -> Self {
        node_type.as_str().to_string()
    }
}

impl TryFrom<String> for NodeType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NodeType::parse(&value).ok_or_else(|| format!("unsupported node type '{}'", value))
    }
}

/// Scheduler task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Highest,
    High,
    Medium,
    Low,
    Lowest,
}

impl TaskPriority {
    /// Normalize a priority given either by name or by number
    ///
    /// Numbers 0-4 are the scheduler's ordinal encoding. Larger numbers come from
    /// weight-style exports and are bucketed.
    pub fn normalize(raw: &str) -> Option<TaskPriority> {
        let trimmed = raw.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "HIGHEST" => return Some(TaskPriority::Highest),
            "HIGH" => return Some(TaskPriority::High),
            "MEDIUM" => return Some(TaskPriority::Medium),
            "LOW" => return Some(TaskPriority::Low),
            "LOWEST" => return Some(TaskPriority::Lowest),
            _ => {}
        }

        let value: i64 = trimmed.parse().ok()?;
        let priority = match value {
            0 => TaskPriority::Highest,
            1 => TaskPriority::High,
            2 => TaskPriority::Medium,
            3 => TaskPriority::Low,
            4 => TaskPriority::Lowest,
            v if v >= 9 => TaskPriority::Highest,
            v if v >= 7 => TaskPriority::High,
            v if v >= 5 => TaskPriority::Medium,
            _ => TaskPriority::Lowest,
        };
        Some(priority)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Highest => "HIGHEST",
            TaskPriority::High => "HIGH",
            TaskPriority::Medium => "MEDIUM",
            TaskPriority::Low => "LOW",
            TaskPriority::Lowest => "LOWEST",
        }
    }
}

/// Datasource a SQL task runs against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceRef {
    pub id: Option<i64>,
    pub name: Option<String>,
    /// Engine type reported by the scheduler (e.g. "MYSQL", "HIVE")
    pub kind: Option<String>,
}

/// Timeout and retry policy of a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub timeout_seconds: Option<i64>,
    pub retry_times: Option<i64>,
    pub retry_interval: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: Option<i64>,
    pub name: Option<String>,
}

/// A single task inside a workflow
///
/// Table identifiers are the lineage of the task: what it reads and what it writes.
/// They drive inferred dependency edges and take part in structural diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_code: TaskCode,
    #[serde(default)]
    pub version: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub node_type: NodeType,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub datasource: Option<DatasourceRef>,
    #[serde(default)]
    pub policy: RetryPolicy,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub task_group: Option<TaskGroup>,
    #[serde(default)]
    pub input_table_ids: BTreeSet<i64>,
    #[serde(default)]
    pub output_table_ids: BTreeSet<i64>,
}

impl Task {
    pub fn new(task_code: TaskCode, name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            task_code,
            version: None,
            name: name.into(),
            description: None,
            node_type,
            sql: None,
            datasource: None,
            policy: RetryPolicy::default(),
            priority: None,
            task_group: None,
            input_table_ids: BTreeSet::new(),
            output_table_ids: BTreeSet::new(),
        }
    }

    /// SQL task with normalized text and no datasource attached
    pub fn sql(task_code: TaskCode, name: impl Into<String>, sql: impl Into<String>) -> Self {
        let mut task = Task::new(task_code, name, NodeType::Sql);
        task.sql = normalize_sql(Some(&sql.into()));
        task
    }

    /// `name(code)`, the label used in human-readable reports
    pub fn label(&self) -> String {
        format!("{}({})", self.name, self.task_code)
    }

    /// Fields compared by the structural diff, in report order
    pub fn diff_fields(&self) -> Vec<(&'static str, Option<String>)> {
        let datasource = self.datasource.clone().unwrap_or_default();
        let group = self.task_group.clone().unwrap_or_default();
        vec![
            ("name", Some(self.name.clone())),
            ("version", self.version.map(|v| v.to_string())),
            ("description", self.description.clone()),
            ("node_type", Some(self.node_type.to_string())),
            ("sql", normalize_sql(self.sql.as_deref())),
            ("datasource_id", datasource.id.map(|v| v.to_string())),
            ("datasource_name", datasource.name),
            ("datasource_type", datasource.kind),
            ("timeout_seconds", self.policy.timeout_seconds.map(|v| v.to_string())),
            ("retry_times", self.policy.retry_times.map(|v| v.to_string())),
            ("retry_interval", self.policy.retry_interval.map(|v| v.to_string())),
            ("priority", self.priority.map(|p| p.as_str().to_string())),
            ("task_group_id", group.id.map(|v| v.to_string())),
            ("task_group_name", group.name),
            ("input_table_ids", join_ids(&self.input_table_ids)),
            ("output_table_ids", join_ids(&self.output_table_ids)),
        ]
    }
}

/// Directed dependency between two tasks
///
/// An upstream code of [`ENTRY_SENTINEL`] marks the downstream task as a workflow
/// entry; a downstream code of the sentinel marks the upstream task as an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub upstream: TaskCode,
    pub downstream: TaskCode,
}

impl Edge {
    pub fn new(upstream: TaskCode, downstream: TaskCode) -> Self {
        Self { upstream, downstream }
    }

    /// Set-membership key, `upstream->downstream`
    pub fn key(&self) -> String {
        format!("{}->{}", self.upstream, self.downstream)
    }

    /// True for entry or exit marker edges
    pub fn is_sentinel(&self) -> bool {
        self.upstream == ENTRY_SENTINEL || self.downstream == ENTRY_SENTINEL
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.upstream, self.downstream)
    }
}

/// Schedule attached to a workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: Option<i64>,
    pub release_state: Option<String>,
    pub crontab: Option<String>,
    pub timezone_id: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub failure_strategy: Option<String>,
    pub warning_type: Option<String>,
    pub warning_group_id: Option<i64>,
    pub process_instance_priority: Option<TaskPriority>,
    pub worker_group: Option<String>,
    pub tenant_code: Option<String>,
    pub environment_code: Option<i64>,
}

impl Schedule {
    pub fn diff_fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("schedule_id", self.schedule_id.map(|v| v.to_string())),
            ("release_state", self.release_state.clone()),
            ("crontab", self.crontab.clone()),
            ("timezone_id", self.timezone_id.clone()),
            ("start_time", self.start_time.clone()),
            ("end_time", self.end_time.clone()),
            ("failure_strategy", self.failure_strategy.clone()),
            ("warning_type", self.warning_type.clone()),
            ("warning_group_id", self.warning_group_id.map(|v| v.to_string())),
            (
                "process_instance_priority",
                self.process_instance_priority.map(|p| p.as_str().to_string()),
            ),
            ("worker_group", self.worker_group.clone()),
            ("tenant_code", self.tenant_code.clone()),
            ("environment_code", self.environment_code.map(|v| v.to_string())),
        ]
    }
}

/// A complete workflow definition
///
/// Owns its tasks and edges exclusively. Serialized as JSON into version snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub project_code: i64,
    pub workflow_code: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub release_state: Option<String>,
    /// Global parameters as the scheduler exports them
    #[serde(default)]
    pub global_params: Option<Value>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

impl WorkflowDefinition {
    pub fn new(project_code: i64, workflow_code: i64, name: impl Into<String>) -> Self {
        Self {
            project_code,
            workflow_code,
            name: name.into(),
            description: None,
            release_state: None,
            global_params: None,
            tasks: Vec::new(),
            edges: Vec::new(),
            schedule: None,
        }
    }

    /// Order-independent form: tasks sorted by code, edges sorted and deduplicated,
    /// SQL text normalized. Two definitions with the same content have equal
    /// canonical forms whatever order their collections came in.
    pub fn canonical(&self) -> WorkflowDefinition {
        let mut canonical = self.clone();
        canonical.tasks.sort_by_key(|task| task.task_code);
        for task in &mut canonical.tasks {
            task.sql = normalize_sql(task.sql.as_deref());
        }
        canonical.edges.sort();
        canonical.edges.dedup();
        if canonical.schedule.as_ref() == Some(&Schedule::default()) {
            canonical.schedule = None;
        }
        canonical
    }

    pub fn task(&self, task_code: TaskCode) -> Option<&Task> {
        self.tasks.iter().find(|task| task.task_code == task_code)
    }

    pub fn task_codes(&self) -> BTreeSet<TaskCode> {
        self.tasks.iter().map(|task| task.task_code).collect()
    }

    /// Edges between real tasks, without entry/exit markers
    pub fn dependency_edges(&self) -> BTreeSet<Edge> {
        self.edges.iter().filter(|edge| !edge.is_sentinel()).copied().collect()
    }

    /// Workflow-level scalar fields compared by the structural diff
    pub fn diff_fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("project_code", Some(self.project_code.to_string())),
            ("workflow_code", Some(self.workflow_code.to_string())),
            ("name", Some(self.name.clone())),
            ("description", self.description.clone()),
            ("release_state", self.release_state.clone()),
            (
                "global_params",
                self.global_params
                    .as_ref()
                    .filter(|params| !params.is_null())
                    .map(|params| params.to_string()),
            ),
        ]
    }

    /// `name(code)` for a task code, or the entry label for the sentinel
    pub fn task_label(&self, task_code: TaskCode) -> String {
        if task_code == ENTRY_SENTINEL {
            return "entry(0)".to_string();
        }
        match self.task(task_code) {
            Some(task) => task.label(),
            None => format!("task_{}({})", task_code, task_code),
        }
    }
}

/// CRLF to LF, trimmed, empty becomes `None`
pub fn normalize_sql(sql: Option<&str>) -> Option<String> {
    let text = sql?.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn join_ids(ids: &BTreeSet<i64>) -> Option<String> {
    if ids.is_empty() {
        return None;
    }
    Some(ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(","))
}
