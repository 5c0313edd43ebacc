/// Scheduler export normalization
///
/// Turns the scheduler's export JSON into a [`RuntimeWorkflowDefinition`]. Exports
/// come in a few shapes depending on scheduler version: nested definitions may be
/// objects or JSON strings, fields go by several aliases, and the export may be
/// wrapped in a single-element array. Everything is folded into the declared model
/// here so the rest of the engine only sees one shape.

use crate::error::{Result, SyncError};
use crate::runtime::types::{RenamePlanEntry, RuntimeTaskDefinition, RuntimeTaskEdge, RuntimeWorkflowDefinition};
use crate::workflow::types::{
    normalize_sql, DatasourceRef, Edge, NodeType, RetryPolicy, Schedule, Task, TaskCode, TaskGroup, TaskPriority,
    WorkflowDefinition, ENTRY_SENTINEL,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

const MAX_TASK_NAME_LEN: usize = 100;
const RENAME_REASON: &str = "task name conflict, auto-renamed";

const TASK_LIST_KEYS: &[&str] = &["taskDefinitionJson", "taskDefinitionList", "taskList", "tasks"];
const RELATION_LIST_KEYS: &[&str] = &[
    "taskRelationJson",
    "taskRelationList",
    "processTaskRelationList",
    "workflowTaskRelationList",
    "edges",
];

pub struct RuntimeDefinitionNormalizer;

impl RuntimeDefinitionNormalizer {
    /// Normalize one export for the requested workflow
    ///
    /// The requested codes are authoritative: an export describing a different
    /// workflow is rejected rather than silently relabelled.
    pub fn normalize(raw: &Value, project_code: i64, workflow_code: i64) -> Result<RuntimeWorkflowDefinition> {
        let root = unwrap_root(raw)?;
        let definition_node = unwrap_definition(&root);

        if let Some(exported) = read_long(&definition_node, &["code", "workflowCode", "processDefinitionCode"]) {
            if exported > 0 && exported != workflow_code {
                return Err(SyncError::DefinitionFormat(format!(
                    "export describes workflow {} but {} was requested",
                    exported, workflow_code
                )));
            }
        }

        let name = read_text(&definition_node, &["name", "workflowName"])
            .unwrap_or_else(|| format!("workflow_{}", workflow_code));
        let mut definition = WorkflowDefinition::new(project_code, workflow_code, name);
        definition.description = read_text(&definition_node, &["description", "desc"]);
        definition.release_state = read_text(&definition_node, &["releaseState", "publishStatus", "scheduleReleaseState"]);
        definition.global_params = json_field(definition_node.get("globalParams"));
        definition.schedule = parse_schedule(&root, &definition_node);

        let task_nodes = task_list(&root, &definition_node)
            .ok_or_else(|| SyncError::DefinitionFormat("export carries no task definition list".into()))?;
        definition.tasks = parse_tasks(&task_nodes)?;

        let relation_nodes = relation_list(&root, &definition_node).unwrap_or_default();
        definition.edges = parse_edges(&relation_nodes, &definition.task_codes())?;

        let rename_plan = resolve_task_names(&mut definition.tasks, workflow_code);
        if !rename_plan.is_empty() {
            tracing::info!(
                "Workflow {} export: {} tasks renamed to keep names unique",
                workflow_code,
                rename_plan.len()
            );
        }

        Ok(RuntimeWorkflowDefinition {
            definition,
            rename_plan,
            raw_definition: raw.clone(),
        })
    }
}

fn unwrap_root(raw: &Value) -> Result<Value> {
    let root = match raw {
        Value::Array(items) => items
            .first()
            .cloned()
            .ok_or_else(|| SyncError::DefinitionFormat("export array is empty".into()))?,
        Value::String(text) => serde_json::from_str(text)
            .map_err(|e| SyncError::DefinitionFormat(format!("export is not valid JSON: {}", e)))?,
        other => other.clone(),
    };
    if !root.is_object() {
        return Err(SyncError::DefinitionFormat("export is not a JSON object".into()));
    }
    Ok(root)
}

/// Nested definition object, or the root itself for flat exports
fn unwrap_definition(root: &Value) -> Value {
    normalize_node(read_node(root, &["workflowDefinition", "processDefinition"]))
        .filter(Value::is_object)
        .or_else(|| normalize_node(read_node(root, &["processDefinitionJson"])).filter(Value::is_object))
        .unwrap_or_else(|| root.clone())
}

fn task_list(root: &Value, definition: &Value) -> Option<Vec<Value>> {
    let from_root = list_node(read_node(root, &["taskDefinitionList"]), TASK_LIST_KEYS);
    match from_root {
        Some(items) if !items.is_empty() => Some(items),
        _ => list_node(read_node(definition, TASK_LIST_KEYS), TASK_LIST_KEYS).or(from_root),
    }
}

fn relation_list(root: &Value, definition: &Value) -> Option<Vec<Value>> {
    let from_root = list_node(
        read_node(root, &["workflowTaskRelationList", "processTaskRelationList"]),
        RELATION_LIST_KEYS,
    );
    match from_root {
        Some(items) if !items.is_empty() => Some(items),
        _ => list_node(read_node(definition, RELATION_LIST_KEYS), RELATION_LIST_KEYS).or(from_root),
    }
}

/// Array behind a node that may be a JSON string or a wrapper object
fn list_node(node: Option<&Value>, inner_keys: &[&str]) -> Option<Vec<Value>> {
    let mut normalized = normalize_node(node)?;
    if normalized.is_object() {
        if let Some(inner) = normalize_node(read_node(&normalized, inner_keys)) {
            normalized = inner;
        }
    }
    match normalized {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

fn parse_tasks(nodes: &[Value]) -> Result<Vec<RuntimeTaskDefinition>> {
    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(nodes.len());

    for item in nodes.iter().filter(|item| !item.is_null()) {
        let task_code = match read_long(item, &["code", "taskCode"]) {
            Some(code) if code > 0 => code,
            _ => {
                return Err(SyncError::DefinitionFormat(format!(
                    "task without a positive code: {}",
                    item
                )))
            }
        };
        if !seen.insert(task_code) {
            return Err(SyncError::TaskCodeDuplicate(task_code));
        }

        let raw_type = read_text(item, &["taskType", "nodeType", "type"]).unwrap_or_default();
        let node_type = NodeType::parse(&raw_type).ok_or_else(|| SyncError::UnsupportedNodeType {
            task_code,
            node_type: raw_type.clone(),
        })?;

        let name = read_text(item, &["name", "taskName"]).unwrap_or_default();
        let mut task = Task::new(task_code, name, node_type);
        task.version = read_long(item, &["version", "taskVersion"]);
        task.description = read_text(item, &["description", "taskDesc"]);
        task.policy = RetryPolicy {
            timeout_seconds: read_long(item, &["timeout", "timeoutSeconds"]),
            retry_times: read_long(item, &["failRetryTimes", "retryTimes"]),
            retry_interval: read_long(item, &["failRetryInterval", "retryInterval"]),
        };
        task.priority = read_text(item, &["taskPriority", "priority"]).and_then(|raw| TaskPriority::normalize(&raw));

        let group_id = read_long(item, &["taskGroupId"]).filter(|id| *id > 0);
        let group_name = read_text(item, &["taskGroupName"]);
        if group_id.is_some() || group_name.is_some() {
            task.task_group = Some(TaskGroup {
                id: group_id,
                name: group_name,
            });
        }

        let datasource = match normalize_node(item.get("taskParams")).filter(Value::is_object) {
            Some(params) => {
                task.sql = normalize_sql(read_text(&params, &["sql", "rawScript"]).as_deref());
                DatasourceRef {
                    id: read_long(&params, &["datasource", "datasourceId"]),
                    name: read_text(&params, &["datasourceName"]),
                    kind: read_text(&params, &["type", "datasourceType"]),
                }
            }
            None => {
                task.sql = normalize_sql(read_text(item, &["sql", "rawScript"]).as_deref());
                DatasourceRef {
                    id: read_long(item, &["datasourceId"]),
                    name: read_text(item, &["datasourceName"]),
                    kind: read_text(item, &["datasourceType"]),
                }
            }
        };
        if datasource != DatasourceRef::default() {
            task.datasource = Some(datasource);
        }

        task.input_table_ids = read_id_list(item, "inputTableIds");
        task.output_table_ids = read_id_list(item, "outputTableIds");
        tasks.push(task);
    }

    Ok(tasks)
}

/// Explicit edges; entry edges (upstream 0) are kept
fn parse_edges(nodes: &[Value], task_codes: &BTreeSet<TaskCode>) -> Result<Vec<RuntimeTaskEdge>> {
    let mut edges = BTreeSet::new();
    for relation in nodes.iter().filter(|relation| !relation.is_null()) {
        let upstream = read_long(relation, &["preTaskCode", "preTask", "upstreamTaskCode"]);
        let downstream = read_long(relation, &["postTaskCode", "postTask", "downstreamTaskCode"]);
        let (upstream, downstream) = match (upstream, downstream) {
            (Some(up), Some(down)) if up >= 0 && down > 0 => (up, down),
            _ => continue,
        };

        for code in [upstream, downstream] {
            if code != ENTRY_SENTINEL && !task_codes.contains(&code) {
                return Err(SyncError::DefinitionFormat(format!(
                    "relation {}->{} references task {} missing from the export",
                    upstream, downstream, code
                )));
            }
        }
        edges.insert(Edge::new(upstream, downstream));
    }
    Ok(edges.into_iter().collect())
}

fn parse_schedule(root: &Value, definition: &Value) -> Option<Schedule> {
    let node = normalize_node(read_node(root, &["schedule"]))
        .filter(Value::is_object)
        .or_else(|| normalize_node(read_node(definition, &["schedule"])).filter(Value::is_object))?;

    let mut schedule = Schedule {
        schedule_id: read_long(&node, &["id", "scheduleId"]),
        release_state: read_text(&node, &["releaseState"]),
        crontab: read_text(&node, &["crontab", "cron"]),
        timezone_id: read_text(&node, &["timezoneId", "timezone"]),
        start_time: read_text(&node, &["startTime"]),
        end_time: read_text(&node, &["endTime"]),
        failure_strategy: read_text(&node, &["failureStrategy"]),
        warning_type: read_text(&node, &["warningType"]),
        warning_group_id: read_long(&node, &["warningGroupId"]),
        process_instance_priority: read_text(&node, &["processInstancePriority"])
            .and_then(|raw| TaskPriority::normalize(&raw)),
        worker_group: read_text(&node, &["workerGroup"]),
        tenant_code: read_text(&node, &["tenantCode"]),
        environment_code: read_long(&node, &["environmentCode"]),
    };
    // An empty schedule object means the workflow is not scheduled
    if schedule == Schedule::default() {
        return None;
    }
    if schedule.release_state.is_none() {
        schedule.release_state = read_text(definition, &["scheduleReleaseState", "releaseState"]);
    }
    Some(schedule)
}

/// Give every task a unique, non-empty name
///
/// Tasks are visited in task-code order, so the lowest code keeps a contested
/// name whatever order the export listed them in; the others get a workflow- and
/// task-scoped suffix. Names are capped at [`MAX_TASK_NAME_LEN`] characters with
/// the suffix always preserved.
fn resolve_task_names(tasks: &mut [RuntimeTaskDefinition], workflow_code: i64) -> Vec<RenamePlanEntry> {
    for task in tasks.iter_mut() {
        let trimmed = task.name.trim().to_string();
        task.name = if trimmed.is_empty() {
            format!("task_{}", task.task_code)
        } else {
            trimmed
        };
    }

    let original_names: HashSet<String> = tasks.iter().map(|task| task.name.clone()).collect();
    let mut taken: HashSet<String> = HashSet::new();
    let mut plan = Vec::new();

    let mut order: Vec<usize> = (0..tasks.len()).collect();
    order.sort_by_key(|&index| tasks[index].task_code);

    for index in order {
        let task = &mut tasks[index];
        if taken.insert(task.name.clone()) {
            continue;
        }

        let base_suffix = format!("__ds_{}_{}", workflow_code, task.task_code);
        let mut candidate = fit_task_name(&task.name, &base_suffix);
        let mut counter = 2;
        while taken.contains(&candidate) || original_names.contains(&candidate) {
            candidate = fit_task_name(&task.name, &format!("{}_{}", base_suffix, counter));
            counter += 1;
        }

        plan.push(RenamePlanEntry {
            task_code: task.task_code,
            original_name: task.name.clone(),
            resolved_name: candidate.clone(),
            reason: RENAME_REASON.to_string(),
        });
        taken.insert(candidate.clone());
        task.name = candidate;
    }

    plan
}

fn fit_task_name(name: &str, suffix: &str) -> String {
    let suffix_len = suffix.chars().count();
    if suffix_len >= MAX_TASK_NAME_LEN {
        return suffix.chars().take(MAX_TASK_NAME_LEN).collect();
    }
    let prefix: String = name.chars().take(MAX_TASK_NAME_LEN - suffix_len).collect();
    format!("{}{}", prefix, suffix)
}

fn read_node<'a>(node: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|key| node.get(*key)).find(|value| !value.is_null())
}

/// Parse JSON carried as a string; blank or invalid text is treated as absent
fn normalize_node(node: Option<&Value>) -> Option<Value> {
    match node? {
        Value::Null => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => serde_json::from_str(text).ok(),
        other => Some(other.clone()),
    }
}

fn json_field(node: Option<&Value>) -> Option<Value> {
    match node? {
        Value::Null => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))),
        other => Some(other.clone()),
    }
}

fn read_text(node: &Value, keys: &[&str]) -> Option<String> {
    let text = match read_node(node, keys)? {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn read_long(node: &Value, keys: &[&str]) -> Option<i64> {
    match read_node(node, keys)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn read_id_list(node: &Value, key: &str) -> BTreeSet<i64> {
    let items = match normalize_node(node.get(key)) {
        Some(Value::Array(items)) => items,
        _ => return BTreeSet::new(),
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        })
        .collect()
}
