/// SQL lineage boundary and task-level edge inference
///
/// SQL parsing is delegated to an external capability that reports which table
/// names a statement reads and writes. Those names are resolved against the
/// registered table catalog here, unioned with any table ids the task already
/// declares, and folded into task-level dependency edges: A -> B whenever A writes
/// a table that B reads.

use crate::runtime::types::SyncIssue;
use crate::workflow::registry::{TableCatalog, TableMatch};
use crate::workflow::types::{Edge, TaskCode, WorkflowDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const SQL_TABLE_AMBIGUOUS: &str = "SQL_TABLE_AMBIGUOUS";
pub const SQL_TABLE_UNMATCHED: &str = "SQL_TABLE_UNMATCHED";
pub const SQL_LINEAGE_INCOMPLETE: &str = "SQL_LINEAGE_INCOMPLETE";

/// Table names referenced by one SQL statement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlTables {
    #[serde(default, alias = "inputs")]
    pub input_tables: Vec<String>,
    #[serde(default, alias = "outputs")]
    pub output_tables: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineageError {
    #[error("SQL could not be analyzed: {0}")]
    Incomplete(String),

    #[error("lineage service unavailable: {0}")]
    Unavailable(String),
}

impl LineageError {
    pub fn code(&self) -> &'static str {
        match self {
            LineageError::Incomplete(_) => SQL_LINEAGE_INCOMPLETE,
            LineageError::Unavailable(_) => "LINEAGE_UNAVAILABLE",
        }
    }
}

/// SQL lineage capability
#[async_trait]
pub trait LineageInferencer: Send + Sync {
    /// Tables read and written by `sql`; `catalog` lists the candidate tables
    async fn extract_tables(&self, sql: &str, catalog: &TableCatalog) -> Result<SqlTables, LineageError>;
}

/// Lineage capability served over HTTP
pub struct HttpLineageInferencer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLineageInferencer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LineageInferencer for HttpLineageInferencer {
    async fn extract_tables(&self, sql: &str, catalog: &TableCatalog) -> Result<SqlTables, LineageError> {
        let candidates: Vec<String> = catalog.tables().map(|table| table.qualified_name()).collect();
        let body = serde_json::json!({
            "sql": sql,
            "candidateTables": candidates,
        });

        tracing::debug!("🔍 Lineage request to {} ({} candidate tables)", self.endpoint, candidates.len());
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| LineageError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let text = response.text().await.unwrap_or_default();
            return Err(LineageError::Incomplete(text));
        }
        if !status.is_success() {
            return Err(LineageError::Unavailable(format!("lineage service answered {}", status)));
        }

        response
            .json::<SqlTables>()
            .await
            .map_err(|e| LineageError::Unavailable(format!("malformed lineage response: {}", e)))
    }
}

/// Resolved read/write table ids of one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableLineage {
    pub input_table_ids: BTreeSet<i64>,
    pub output_table_ids: BTreeSet<i64>,
}

/// Lineage of a whole workflow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineageReport {
    pub tables: BTreeMap<TaskCode, TableLineage>,
    pub issues: Vec<SyncIssue>,
    pub inferred_edges: BTreeSet<Edge>,
}

impl LineageReport {
    /// Write the resolved table ids back into the definition's tasks
    pub fn apply_to(&self, definition: &mut WorkflowDefinition) {
        for task in &mut definition.tasks {
            if let Some(lineage) = self.tables.get(&task.task_code) {
                task.input_table_ids = lineage.input_table_ids.clone();
                task.output_table_ids = lineage.output_table_ids.clone();
            }
        }
    }
}

const DEFAULT_LINEAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Aggregates per-task lineage into task-level edges
#[derive(Clone)]
pub struct LineageEdgeInferencer {
    inferencer: Arc<dyn LineageInferencer>,
    timeout: Duration,
}

impl LineageEdgeInferencer {
    pub fn new(inferencer: Arc<dyn LineageInferencer>) -> Self {
        Self {
            inferencer,
            timeout: DEFAULT_LINEAGE_TIMEOUT,
        }
    }

    /// Upper bound for a single `extract_tables` call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded_extract(&self, sql: &str, catalog: &TableCatalog) -> Result<SqlTables, LineageError> {
        match tokio::time::timeout(self.timeout, self.inferencer.extract_tables(sql, catalog)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("⏱️ Lineage service did not answer within {:?}", self.timeout);
                Err(LineageError::Unavailable(format!(
                    "lineage service did not answer within {:?}",
                    self.timeout
                )))
            }
        }
    }

    /// Resolve lineage for every SQL task and infer edges between tasks
    ///
    /// Failures never abort the pass; each one becomes an ERROR issue on the
    /// task so the caller sees every problem at once.
    pub async fn aggregate(&self, definition: &WorkflowDefinition, catalog: &TableCatalog) -> LineageReport {
        let mut report = LineageReport::default();
        let mut tasks: Vec<_> = definition.tasks.iter().collect();
        tasks.sort_by_key(|task| task.task_code);

        for task in tasks {
            let mut lineage = TableLineage {
                input_table_ids: task.input_table_ids.clone(),
                output_table_ids: task.output_table_ids.clone(),
            };

            if task.node_type.is_sql() {
                let issue = |code: &str, message: String| {
                    SyncIssue::error(code, message).with_workflow(definition).with_task(task)
                };

                match task.sql.as_deref() {
                    None => report
                        .issues
                        .push(issue(SQL_LINEAGE_INCOMPLETE, "SQL task has no statement".to_string())),
                    Some(sql) => match self.bounded_extract(sql, catalog).await {
                        Err(err) => report.issues.push(issue(err.code(), err.to_string())),
                        Ok(tables) => {
                            let inputs = resolve_names(&tables.input_tables, catalog);
                            let outputs = resolve_names(&tables.output_tables, catalog);
                            lineage.input_table_ids.extend(&inputs.ids);
                            lineage.output_table_ids.extend(&outputs.ids);

                            let ambiguous: Vec<String> =
                                inputs.ambiguous.into_iter().chain(outputs.ambiguous).collect();
                            let unmatched: Vec<String> =
                                inputs.unmatched.into_iter().chain(outputs.unmatched).collect();

                            if !ambiguous.is_empty() {
                                let names = ambiguous.join(", ");
                                report.issues.push(
                                    issue(SQL_TABLE_AMBIGUOUS, format!("table reference is ambiguous: {}", names))
                                        .with_raw_name(names),
                                );
                            }
                            if !unmatched.is_empty() {
                                let names = unmatched.join(", ");
                                report.issues.push(
                                    issue(SQL_TABLE_UNMATCHED, format!("table is not registered: {}", names))
                                        .with_raw_name(names),
                                );
                            }
                            if lineage.output_table_ids.is_empty() {
                                report.issues.push(issue(
                                    SQL_LINEAGE_INCOMPLETE,
                                    "no output table could be determined".to_string(),
                                ));
                            }
                        }
                    },
                }
            }

            report.tables.insert(task.task_code, lineage);
        }

        report.inferred_edges = infer_edges(&report.tables);
        tracing::debug!(
            "Lineage for workflow {}: {} inferred edges, {} issues",
            definition.workflow_code,
            report.inferred_edges.len(),
            report.issues.len()
        );
        report
    }
}

/// A -> B for every pair where A writes a table B reads; no self-edges
pub fn infer_edges(tables: &BTreeMap<TaskCode, TableLineage>) -> BTreeSet<Edge> {
    let mut edges = BTreeSet::new();
    for (&downstream, reader) in tables {
        if reader.input_table_ids.is_empty() {
            continue;
        }
        for (&upstream, writer) in tables {
            if upstream == downstream {
                continue;
            }
            if !writer.output_table_ids.is_disjoint(&reader.input_table_ids) {
                edges.insert(Edge::new(upstream, downstream));
            }
        }
    }
    edges
}

#[derive(Default)]
struct ResolvedNames {
    ids: BTreeSet<i64>,
    ambiguous: Vec<String>,
    unmatched: Vec<String>,
}

fn resolve_names(names: &[String], catalog: &TableCatalog) -> ResolvedNames {
    let mut resolved = ResolvedNames::default();
    for name in names {
        match catalog.resolve(name) {
            TableMatch::Unique(id) => {
                resolved.ids.insert(id);
            }
            TableMatch::Ambiguous(_) => resolved.ambiguous.push(name.clone()),
            TableMatch::Unmatched => resolved.unmatched.push(name.clone()),
        }
    }
    resolved
}
