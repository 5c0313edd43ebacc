/// Runtime sync orchestration
///
/// Drives one reconciliation attempt of a scheduler workflow into the platform's
/// declared copy:
///
/// FETCHING -> NORMALIZING -> DIFFING -> (CLEAN | NEEDS_CONFIRMATION | BLOCKED)
///          -> COMMITTING -> (SUCCEEDED | FAILED)
///
/// Previews run the same pipeline up to the decision and never write. Executes
/// write exactly one sync record per attempt, and only move the current-version
/// pointer through the store's optimistic append.

use crate::error::{Result, SyncError};
use crate::runtime::lineage::LineageEdgeInferencer;
use crate::runtime::normalizer::RuntimeDefinitionNormalizer;
use crate::runtime::reconcile::{EdgeMismatchDetail, EdgeReconciler, RelationCompareDetail};
use crate::runtime::source::RuntimeSource;
use crate::runtime::types::{DatasourceInfo, RenamePlanEntry, SyncIssue};
use crate::workflow::diff::{DiffSummary, StructuralDiffEngine};
use crate::workflow::registry::CatalogRegistry;
use crate::workflow::store::{CommitReceipt, NewSyncRecord, SyncRecord, SyncRecordId, SyncStatus, WorkflowBinding};
use crate::workflow::topology::{TopologyAnalyzer, TopologyResult};
use crate::workflow::types::WorkflowDefinition;
use crate::workflow::version::{NewVersion, TriggerSource, VersionManager, VersionSnapshot, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

pub const DATASOURCE_NOT_FOUND: &str = "DATASOURCE_NOT_FOUND";
pub const WORKFLOW_BINDING_CONFLICT: &str = "WORKFLOW_BINDING_CONFLICT";

/// Stage of a sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    Fetching,
    Normalizing,
    Diffing,
    Committing,
    Succeeded,
    Failed,
}

/// Gate reached after diffing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDecision {
    Clean,
    NeedsConfirmation,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub enabled: bool,
    /// Workflow codes excluded from sync
    pub disabled_workflows: BTreeSet<i64>,
    pub fetch_timeout: Duration,
    /// Extra commit attempts after losing a version race
    pub commit_retry_budget: u32,
    pub default_operator: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_workflows: BTreeSet::new(),
            fetch_timeout: Duration::from_secs(10),
            commit_retry_budget: 2,
            default_operator: "runtime-sync".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub project_code: i64,
    pub workflow_code: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub project_code: i64,
    pub workflow_code: i64,
    #[serde(default)]
    pub confirm_edge_mismatch: bool,
    /// Recorded as the author of the version; the configured default when absent
    #[serde(default)]
    pub operator: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub can_sync: bool,
    pub decision: SyncDecision,
    pub relation_decision_required: bool,
    pub workflow_id: Option<WorkflowId>,
    pub baseline_version_no: Option<u32>,
    pub diff_summary: Option<DiffSummary>,
    pub edge_mismatch_detail: Option<EdgeMismatchDetail>,
    pub relation_compare: Option<RelationCompareDetail>,
    pub rename_plan: Vec<RenamePlanEntry>,
    pub topology: Option<TopologyResult>,
    pub issues: Vec<SyncIssue>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    pub attempt_id: String,
    pub phase: SyncPhase,
    /// Stage the attempt stopped in, set on failure
    pub failed_phase: Option<SyncPhase>,
    pub decision: Option<SyncDecision>,
    pub workflow_id: Option<WorkflowId>,
    pub version_id: Option<i64>,
    pub version_no: Option<u32>,
    pub sync_record_id: SyncRecordId,
    pub diff_summary: Option<DiffSummary>,
    pub edge_mismatch_detail: Option<EdgeMismatchDetail>,
    pub rename_plan: Vec<RenamePlanEntry>,
    pub issues: Vec<SyncIssue>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl ExecuteResponse {
    fn new(attempt_id: String) -> Self {
        Self {
            success: false,
            attempt_id,
            phase: SyncPhase::Fetching,
            failed_phase: None,
            decision: None,
            workflow_id: None,
            version_id: None,
            version_no: None,
            sync_record_id: 0,
            diff_summary: None,
            edge_mismatch_detail: None,
            rename_plan: Vec::new(),
            issues: Vec::new(),
            error_code: None,
            error_message: None,
        }
    }
}

/// Everything computed up to the decision gate
struct SyncPlan {
    definition: WorkflowDefinition,
    rename_plan: Vec<RenamePlanEntry>,
    binding: Option<WorkflowBinding>,
    baseline: Option<VersionSnapshot>,
    diff: DiffSummary,
    relation: RelationCompareDetail,
    mismatch: Option<EdgeMismatchDetail>,
    requires_confirmation: bool,
    topology: Option<TopologyResult>,
    issues: Vec<SyncIssue>,
    decision: SyncDecision,
}

/// A pipeline failure before the decision gate
struct PlanFailure {
    phase: SyncPhase,
    binding: Option<WorkflowBinding>,
    error: SyncError,
}

/// Code, user message and audit detail of a failed attempt
struct Failure {
    phase: SyncPhase,
    code: String,
    message: String,
    detail: String,
}

impl Failure {
    fn from_error(phase: SyncPhase, error: &SyncError) -> Self {
        Self {
            phase,
            code: error.code().to_string(),
            message: error.external_message(),
            detail: error.detail(),
        }
    }
}

/// Top-level sync state machine
#[derive(Clone)]
pub struct RuntimeSyncOrchestrator {
    source: Arc<dyn RuntimeSource>,
    lineage: LineageEdgeInferencer,
    catalog: Arc<CatalogRegistry>,
    versions: VersionManager,
    settings: SyncSettings,
}

impl RuntimeSyncOrchestrator {
    pub fn new(
        source: Arc<dyn RuntimeSource>,
        lineage: LineageEdgeInferencer,
        catalog: Arc<CatalogRegistry>,
        versions: VersionManager,
        settings: SyncSettings,
    ) -> Self {
        Self {
            source,
            lineage,
            catalog,
            versions,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Read-only dry run; failures come back as BLOCKED with an issue
    pub async fn preview(&self, project_code: i64, workflow_code: i64) -> PreviewResponse {
        let span = tracing::info_span!("runtime_sync_preview", project_code, workflow_code);
        match self.plan(project_code, workflow_code).instrument(span).await {
            Ok(plan) => PreviewResponse {
                can_sync: plan.decision != SyncDecision::Blocked,
                decision: plan.decision,
                relation_decision_required: plan.requires_confirmation,
                workflow_id: plan.binding.as_ref().map(|binding| binding.id),
                baseline_version_no: plan.baseline.as_ref().map(|version| version.version_no),
                diff_summary: Some(plan.diff),
                edge_mismatch_detail: plan.mismatch,
                relation_compare: Some(plan.relation),
                rename_plan: plan.rename_plan,
                topology: plan.topology,
                issues: plan.issues,
            },
            Err(failure) => PreviewResponse {
                can_sync: false,
                decision: SyncDecision::Blocked,
                relation_decision_required: false,
                workflow_id: failure.binding.as_ref().map(|binding| binding.id),
                baseline_version_no: failure.binding.as_ref().map(|binding| binding.current_version_no),
                diff_summary: None,
                edge_mismatch_detail: None,
                relation_compare: None,
                rename_plan: Vec::new(),
                topology: None,
                issues: vec![SyncIssue::error(failure.error.code(), failure.error.external_message())],
            },
        }
    }

    /// Run one sync attempt and record its outcome
    ///
    /// Declined and failed attempts come back as `Ok` with `success = false`; an
    /// `Err` means the outcome itself could not be recorded.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        let attempt_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "runtime_sync",
            attempt = %attempt_id,
            project_code = request.project_code,
            workflow_code = request.workflow_code
        );
        self.execute_attempt(request, attempt_id).instrument(span).await
    }

    pub async fn list_sync_records(&self, workflow_id: WorkflowId) -> Result<Vec<SyncRecord>> {
        let store = self.versions.store();
        if store.get_workflow(workflow_id).await?.is_none() {
            return Err(SyncError::WorkflowNotFound(workflow_id));
        }
        store.list_sync_records(workflow_id).await
    }

    pub async fn get_sync_record(&self, record_id: SyncRecordId) -> Result<SyncRecord> {
        self.versions
            .store()
            .get_sync_record(record_id)
            .await?
            .ok_or(SyncError::SyncRecordNotFound(record_id))
    }

    async fn execute_attempt(&self, request: ExecuteRequest, attempt_id: String) -> Result<ExecuteResponse> {
        let operator = request
            .operator
            .as_deref()
            .map(str::trim)
            .filter(|operator| !operator.is_empty())
            .unwrap_or(self.settings.default_operator.as_str())
            .to_string();
        let mut response = ExecuteResponse::new(attempt_id);
        let mut record = NewSyncRecord {
            project_code: request.project_code,
            workflow_code: request.workflow_code,
            operator: operator.clone(),
            ..NewSyncRecord::default()
        };

        let plan = match self.plan(request.project_code, request.workflow_code).await {
            Ok(plan) => plan,
            Err(failure) => {
                record.workflow_id = failure.binding.as_ref().map(|binding| binding.id);
                response.workflow_id = record.workflow_id;
                let failure = Failure::from_error(failure.phase, &failure.error);
                return self.fail(response, record, failure).await;
            }
        };

        record.workflow_id = plan.binding.as_ref().map(|binding| binding.id);
        record.snapshot_hash = Some(plan.diff.current_hash.clone());
        record.snapshot_json = StructuralDiffEngine::snapshot_json(&plan.definition).ok();
        record.diff_json = serde_json::to_string(&plan.diff).ok();
        response.workflow_id = record.workflow_id;
        response.decision = Some(plan.decision);
        response.diff_summary = Some(plan.diff.clone());
        response.edge_mismatch_detail = plan.mismatch.clone();
        response.rename_plan = plan.rename_plan.clone();
        response.issues = plan.issues.clone();

        match plan.decision {
            SyncDecision::Blocked => {
                let errors: Vec<&SyncIssue> = plan.issues.iter().filter(|issue| issue.is_error()).collect();
                let code = errors.first().map_or("SYNC_BLOCKED", |issue| issue.code.as_str()).to_string();
                let message = format!(
                    "sync blocked by {} issue(s): {}",
                    errors.len(),
                    errors.iter().map(|issue| issue.message.as_str()).collect::<Vec<_>>().join("; ")
                );
                let failure = Failure {
                    phase: SyncPhase::Diffing,
                    code,
                    message: message.clone(),
                    detail: message,
                };
                return self.fail(response, record, failure).await;
            }
            SyncDecision::NeedsConfirmation if !request.confirm_edge_mismatch => {
                let failure = Failure::from_error(SyncPhase::Diffing, &SyncError::EdgeMismatchConfirmRequired);
                return self.fail(response, record, failure).await;
            }
            _ => {}
        }

        if let (false, Some(baseline)) = (plan.diff.changed, plan.baseline.as_ref()) {
            tracing::info!("✅ Workflow {} already matches v{}", request.workflow_code, baseline.version_no);
            record.status = SyncStatus::Success;
            record.version_id = Some(baseline.id);
            let stored = self
                .versions
                .store()
                .append_sync_record(record)
                .await
                .map_err(SyncError::internal)?;
            response.success = true;
            response.phase = SyncPhase::Succeeded;
            response.version_id = Some(baseline.id);
            response.version_no = Some(baseline.version_no);
            response.sync_record_id = stored.id;
            return Ok(response);
        }

        tracing::info!("💾 COMMITTING workflow {}", request.workflow_code);
        match self.commit(&plan, record.clone()).await {
            Ok(receipt) => {
                let record_id = receipt
                    .sync_record
                    .as_ref()
                    .map(|stored| stored.id)
                    .ok_or_else(|| SyncError::internal(anyhow::anyhow!("commit returned no sync record")))?;
                tracing::info!(
                    "✅ Workflow {} synced as v{}",
                    request.workflow_code,
                    receipt.version.version_no
                );
                response.success = true;
                response.phase = SyncPhase::Succeeded;
                response.workflow_id = Some(receipt.version.workflow_id);
                response.version_id = Some(receipt.version.id);
                response.version_no = Some(receipt.version.version_no);
                response.sync_record_id = record_id;
                Ok(response)
            }
            Err((binding_id, error)) => {
                record.workflow_id = binding_id.or(record.workflow_id);
                response.workflow_id = record.workflow_id;
                let error = match error {
                    conflict @ SyncError::VersionConflict { .. } => conflict,
                    other => SyncError::internal(other),
                };
                self.fail(response, record, Failure::from_error(SyncPhase::Committing, &error))
                    .await
            }
        }
    }

    /// Fetch, normalize and analyze; stops at the decision gate
    async fn plan(&self, project_code: i64, workflow_code: i64) -> std::result::Result<SyncPlan, PlanFailure> {
        let fail = |phase: SyncPhase, binding: Option<WorkflowBinding>, error: SyncError| PlanFailure {
            phase,
            binding,
            error,
        };

        if !self.settings.enabled || self.settings.disabled_workflows.contains(&workflow_code) {
            return Err(fail(SyncPhase::Fetching, None, SyncError::SyncDisabled(workflow_code)));
        }

        // The baseline is pinned before fetching; commits guard against it moving
        let store = self.versions.store();
        let binding = store
            .find_workflow(project_code, workflow_code)
            .await
            .map_err(|e| fail(SyncPhase::Fetching, None, e))?;
        let baseline = match &binding {
            Some(binding) => store
                .current_version(binding.id)
                .await
                .map_err(|e| fail(SyncPhase::Fetching, Some(binding.clone()), e))?,
            None => None,
        };
        let baseline_definition = baseline
            .as_ref()
            .map(VersionSnapshot::definition)
            .transpose()
            .map_err(|e| fail(SyncPhase::Diffing, binding.clone(), e))?;

        tracing::info!("📥 FETCHING workflow {} from project {}", workflow_code, project_code);
        let raw = self
            .with_fetch_timeout(self.source.fetch_definition(project_code, workflow_code))
            .await
            .map_err(|e| fail(SyncPhase::Fetching, binding.clone(), e))?;

        tracing::info!("🔧 NORMALIZING workflow {}", workflow_code);
        let runtime = RuntimeDefinitionNormalizer::normalize(&raw, project_code, workflow_code)
            .map_err(|e| fail(SyncPhase::Normalizing, binding.clone(), e))?;
        let mut definition = runtime.definition;
        let mut issues = Vec::new();

        if definition.tasks.iter().any(|task| task.node_type.is_sql()) {
            let datasources = self
                .with_fetch_timeout(self.source.list_datasources())
                .await
                .map_err(|e| fail(SyncPhase::Fetching, binding.clone(), e))?;
            resolve_datasources(&mut definition, &datasources, &mut issues);
        }

        let task_codes: Vec<_> = definition.task_codes().into_iter().collect();
        let owners = store
            .task_owners(&task_codes)
            .await
            .map_err(|e| fail(SyncPhase::Diffing, binding.clone(), e))?;
        let own_id = binding.as_ref().map(|binding| binding.id);
        for task in &definition.tasks {
            if let Some(&owner) = owners.get(&task.task_code) {
                if Some(owner) != own_id {
                    issues.push(
                        SyncIssue::error(
                            WORKFLOW_BINDING_CONFLICT,
                            format!("task {} already belongs to platform workflow {}", task.task_code, owner),
                        )
                        .with_workflow(&definition)
                        .with_task(task),
                    );
                }
            }
        }

        tracing::info!("🔍 DIFFING workflow {}", workflow_code);
        let catalog = self.catalog.snapshot();
        let lineage = self.lineage.aggregate(&definition, &catalog).await;
        lineage.apply_to(&mut definition);
        issues.extend(lineage.issues.iter().cloned());

        let reconciliation = EdgeReconciler::reconcile(&definition, &lineage.inferred_edges);
        issues.extend(reconciliation.issues.iter().cloned());

        let topology = match TopologyAnalyzer::analyze_definition(&definition) {
            Ok(topology) => Some(topology),
            Err(e) => {
                issues.push(SyncIssue::error(e.code(), e.to_string()).with_workflow(&definition));
                None
            }
        };

        let diff = StructuralDiffEngine::diff(baseline_definition.as_ref(), &definition)
            .map_err(|e| fail(SyncPhase::Diffing, binding.clone(), e))?;

        let decision = if issues.iter().any(SyncIssue::is_error) {
            SyncDecision::Blocked
        } else if reconciliation.requires_confirmation {
            SyncDecision::NeedsConfirmation
        } else {
            SyncDecision::Clean
        };
        tracing::info!(
            "Workflow {} decision {:?}: {}, {} issues",
            workflow_code,
            decision,
            diff.describe(),
            issues.len()
        );

        Ok(SyncPlan {
            definition,
            rename_plan: runtime.rename_plan,
            binding,
            baseline,
            diff,
            relation: reconciliation.relation,
            mismatch: reconciliation.mismatch,
            requires_confirmation: reconciliation.requires_confirmation,
            topology,
            issues,
            decision,
        })
    }

    /// Append the plan's definition as the next version
    ///
    /// On a lost race the head is re-read: if it already holds this content the
    /// attempt is a conflict; otherwise the diff is recomputed against the new head
    /// and the append retried within the budget.
    async fn commit(
        &self,
        plan: &SyncPlan,
        record: NewSyncRecord,
    ) -> std::result::Result<CommitReceipt, (Option<WorkflowId>, SyncError)> {
        let store = self.versions.store();
        let binding = match &plan.binding {
            Some(binding) => binding.clone(),
            None => store
                .ensure_workflow(plan.definition.project_code, plan.definition.workflow_code, &plan.definition.name)
                .await
                .map_err(|e| (None, e))?,
        };
        let with_binding = |error: SyncError| (Some(binding.id), error);

        let mut expected = plan.baseline.as_ref().map_or(0, |version| version.version_no);
        let mut diff = plan.diff.clone();
        let mut retries = 0;

        loop {
            let version = NewVersion::from_definition(
                binding.id,
                &plan.definition,
                TriggerSource::RuntimeSync,
                Some(diff.describe()),
                &record.operator,
            )
            .map_err(with_binding)?;
            let mut success = record.clone();
            success.status = SyncStatus::Success;
            success.diff_json = serde_json::to_string(&diff).ok();

            match self.versions.commit_expected(version, expected, Some(success)).await {
                Ok(receipt) => return Ok(receipt),
                Err(SyncError::VersionConflict { actual, .. }) => {
                    let head = store.current_version(binding.id).await.map_err(with_binding)?;
                    let conflict = SyncError::VersionConflict {
                        workflow_id: binding.id,
                        expected,
                        actual,
                    };
                    let head = match head {
                        Some(head) if head.content_hash != diff.current_hash && retries < self.settings.commit_retry_budget => head,
                        _ => {
                            tracing::warn!("⚠️ Workflow {} moved to v{} during commit", binding.id, actual);
                            return Err(with_binding(conflict));
                        }
                    };

                    retries += 1;
                    tracing::warn!(
                        "Version race on workflow {} (expected v{}, head v{}), re-diffing, retry {}/{}",
                        binding.id,
                        expected,
                        head.version_no,
                        retries,
                        self.settings.commit_retry_budget
                    );
                    let head_definition = head.definition().map_err(with_binding)?;
                    diff = StructuralDiffEngine::diff(Some(&head_definition), &plan.definition).map_err(with_binding)?;
                    expected = head.version_no;
                }
                Err(e) => return Err(with_binding(e)),
            }
        }
    }

    async fn fail(&self, mut response: ExecuteResponse, mut record: NewSyncRecord, failure: Failure) -> Result<ExecuteResponse> {
        tracing::warn!("❌ Sync attempt failed during {:?}: [{}] {}", failure.phase, failure.code, failure.detail);
        record.status = SyncStatus::Failed;
        record.version_id = None;
        record.error_code = Some(failure.code.clone());
        record.error_message = Some(failure.detail);

        let stored = self
            .versions
            .store()
            .append_sync_record(record)
            .await
            .map_err(SyncError::internal)?;

        response.success = false;
        response.phase = SyncPhase::Failed;
        response.failed_phase = Some(failure.phase);
        response.sync_record_id = stored.id;
        response.error_code = Some(failure.code);
        response.error_message = Some(failure.message);
        Ok(response)
    }

    async fn with_fetch_timeout<T>(&self, fetch: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.settings.fetch_timeout;
        tokio::time::timeout(limit, fetch)
            .await
            .map_err(|_| SyncError::FetchTimeout(limit))?
    }
}

/// SQL tasks must run on a datasource the scheduler knows; fill in its name and type
fn resolve_datasources(
    definition: &mut WorkflowDefinition,
    datasources: &[DatasourceInfo],
    issues: &mut Vec<SyncIssue>,
) {
    let by_id: HashMap<i64, _> = datasources.iter().map(|datasource| (datasource.id, datasource)).collect();
    let mut missing = Vec::new();

    for task in definition.tasks.iter_mut().filter(|task| task.node_type.is_sql()) {
        let known = task
            .datasource
            .as_ref()
            .and_then(|datasource| datasource.id)
            .and_then(|id| by_id.get(&id));
        match (known, task.datasource.as_mut()) {
            (Some(info), Some(datasource)) => {
                datasource.name = Some(info.name.clone());
                if datasource.kind.is_none() {
                    datasource.kind = Some(info.kind.clone());
                }
            }
            _ => missing.push(task.task_code),
        }
    }

    for task_code in missing {
        if let Some(task) = definition.task(task_code) {
            issues.push(
                SyncIssue::error(DATASOURCE_NOT_FOUND, "datasource is not known to the scheduler")
                    .with_workflow(definition)
                    .with_task(task),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::lineage::tests::{catalog, StalledLineage, StaticLineage};
    use crate::workflow::store::{MemoryStore, WorkflowStore};
    use crate::workflow::types::Task;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Barrier;

    const CLEAN_SQL: &str = "insert into dwd.orders select * from ods.orders";
    const AGGREGATE_SQL: &str = "insert into dws.order_daily select * from dwd.orders";
    const REPORT_SQL: &str = "insert into ads.order_report select * from dws.order_daily";
    const AMBIGUOUS_SQL: &str = "insert into dwd.orders select * from orders";

    struct StubSource {
        export: Option<Value>,
        datasources: Vec<DatasourceInfo>,
        barrier: Option<Arc<Barrier>>,
        delay: Option<Duration>,
    }

    impl StubSource {
        fn new(export: Value) -> Self {
            Self {
                export: Some(export),
                datasources: vec![DatasourceInfo {
                    id: 5,
                    name: "warehouse".to_string(),
                    kind: "MYSQL".to_string(),
                }],
                barrier: None,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl RuntimeSource for StubSource {
        async fn fetch_definition(&self, project_code: i64, workflow_code: i64) -> Result<Value> {
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.export.clone().ok_or(SyncError::RuntimeWorkflowNotFound {
                project_code,
                workflow_code,
            })
        }

        async fn list_datasources(&self) -> Result<Vec<DatasourceInfo>> {
            Ok(self.datasources.clone())
        }
    }

    fn export(tasks: &[(i64, &str, &str)], relations: &[(i64, i64)]) -> Value {
        let tasks: Vec<Value> = tasks
            .iter()
            .map(|(code, name, sql)| {
                json!({
                    "code": code,
                    "name": name,
                    "taskType": "SQL",
                    "taskParams": { "sql": sql, "datasource": 5 }
                })
            })
            .collect();
        let relations: Vec<Value> = relations
            .iter()
            .map(|(pre, post)| json!({ "preTaskCode": pre, "postTaskCode": post }))
            .collect();
        json!({
            "workflowDefinition": { "code": 100, "name": "orders_daily" },
            "taskDefinitionList": tasks,
            "workflowTaskRelationList": relations
        })
    }

    fn chain_export(extra_relations: &[(i64, i64)]) -> Value {
        let mut relations = vec![(0, 11), (11, 12), (12, 13)];
        relations.extend_from_slice(extra_relations);
        export(
            &[(11, "T1", CLEAN_SQL), (12, "T2", AGGREGATE_SQL), (13, "T3", REPORT_SQL)],
            &relations,
        )
    }

    fn lineage() -> StaticLineage {
        StaticLineage::default()
            .with(CLEAN_SQL, &["ods.orders"], &["dwd.orders"])
            .with(AGGREGATE_SQL, &["dwd.orders"], &["dws.order_daily"])
            .with(REPORT_SQL, &["dws.order_daily"], &["ads.order_report"])
            .with(AMBIGUOUS_SQL, &["orders"], &["dwd.orders"])
    }

    fn orchestrator_with(source: StubSource, store: Arc<MemoryStore>, settings: SyncSettings) -> RuntimeSyncOrchestrator {
        RuntimeSyncOrchestrator::new(
            Arc::new(source),
            LineageEdgeInferencer::new(Arc::new(lineage())),
            Arc::new(CatalogRegistry::new(catalog())),
            VersionManager::new(store, settings.commit_retry_budget),
            settings,
        )
    }

    fn orchestrator(source: StubSource, store: Arc<MemoryStore>) -> RuntimeSyncOrchestrator {
        orchestrator_with(source, store, SyncSettings::default())
    }

    fn execute_request(confirm: bool) -> ExecuteRequest {
        ExecuteRequest {
            project_code: 1,
            workflow_code: 100,
            confirm_edge_mismatch: confirm,
            operator: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn test_matching_edges_preview_clean() {
        let store = Arc::new(MemoryStore::new());
        let preview = orchestrator(StubSource::new(chain_export(&[])), store.clone())
            .preview(1, 100)
            .await;

        assert!(preview.can_sync, "{:?}", preview.issues);
        assert_eq!(preview.decision, SyncDecision::Clean);
        assert!(!preview.relation_decision_required);
        assert!(preview.edge_mismatch_detail.is_none());
        assert!(preview.diff_summary.as_ref().unwrap().changed);
        assert_eq!(preview.topology.as_ref().unwrap().entry_task_ids, BTreeSet::from([11]));

        // Previews never write
        assert!(store.find_workflow(1, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extra_declared_edge_requires_decision() {
        let store = Arc::new(MemoryStore::new());
        let preview = orchestrator(StubSource::new(chain_export(&[(11, 13)])), store)
            .preview(1, 100)
            .await;

        assert_eq!(preview.relation_compare.as_ref().unwrap().only_in_declared, vec!["11->13"]);
        assert!(preview.relation_decision_required);
        assert_eq!(preview.decision, SyncDecision::NeedsConfirmation);
        assert_eq!(
            preview.edge_mismatch_detail.unwrap().only_in_explicit_display,
            vec!["T1(11) -> T3(13) [11->13]"]
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_mismatch_is_declined_and_recorded() {
        let store = Arc::new(MemoryStore::new());
        let sync = orchestrator(StubSource::new(chain_export(&[(11, 13)])), store.clone());

        let declined = sync.execute(execute_request(false)).await.unwrap();
        assert!(!declined.success);
        assert_eq!(declined.error_code.as_deref(), Some("EDGE_MISMATCH_CONFIRM_REQUIRED"));
        assert!(declined.edge_mismatch_detail.is_some());
        let record = sync.get_sync_record(declined.sync_record_id).await.unwrap();
        assert_eq!(record.status, SyncStatus::Failed);

        let confirmed = sync.execute(execute_request(true)).await.unwrap();
        assert!(confirmed.success);
        assert_eq!(confirmed.version_no, Some(1));
        let record = sync.get_sync_record(confirmed.sync_record_id).await.unwrap();
        assert_eq!(record.status, SyncStatus::Success);
        assert_eq!(record.version_id, confirmed.version_id);
        assert_eq!(record.operator, "alice");
    }

    #[tokio::test]
    async fn test_execute_commits_and_then_reports_no_change() {
        let store = Arc::new(MemoryStore::new());
        let sync = orchestrator(StubSource::new(chain_export(&[])), store.clone());

        let first = sync.execute(execute_request(false)).await.unwrap();
        assert!(first.success, "{:?}", first.error_message);
        assert_eq!(first.version_no, Some(1));

        let workflow_id = first.workflow_id.unwrap();
        let committed = store.current_version(workflow_id).await.unwrap().unwrap();
        assert_eq!(committed.trigger_source, TriggerSource::RuntimeSync);
        let definition = committed.definition().unwrap();
        assert_eq!(definition.task(12).unwrap().input_table_ids, BTreeSet::from([2]));
        assert_eq!(
            definition.task(11).unwrap().datasource.as_ref().unwrap().name.as_deref(),
            Some("warehouse")
        );

        let second = sync.execute(execute_request(false)).await.unwrap();
        assert!(second.success);
        assert_eq!(second.version_no, Some(1));
        assert!(!second.diff_summary.unwrap().changed);
        assert_eq!(store.list_versions(workflow_id).await.unwrap().len(), 1);

        let records = sync.list_sync_records(workflow_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, second.sync_record_id);
    }

    #[tokio::test]
    async fn test_concurrent_executes_commit_once() {
        let store = Arc::new(MemoryStore::new());
        let binding = store.ensure_workflow(1, 100, "orders_daily").await.unwrap();
        let manager = VersionManager::new(store.clone(), 0);
        for i in 1..=5 {
            let mut definition = WorkflowDefinition::new(1, 100, "orders_daily");
            definition.tasks = vec![Task::sql(11, "T1", format!("select {}", i))];
            manager
                .commit(binding.id, &definition, TriggerSource::Manual, None, "bob")
                .await
                .unwrap();
        }

        let mut source = StubSource::new(chain_export(&[]));
        source.barrier = Some(Arc::new(Barrier::new(2)));
        let sync = orchestrator(source, store.clone());

        let (left, right) = tokio::join!(sync.execute(execute_request(false)), sync.execute(execute_request(false)));
        let outcomes = [left.unwrap(), right.unwrap()];

        let winners: Vec<_> = outcomes.iter().filter(|outcome| outcome.success).collect();
        let losers: Vec<_> = outcomes.iter().filter(|outcome| !outcome.success).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].version_no, Some(6));
        assert_eq!(losers[0].error_code.as_deref(), Some("VERSION_CONFLICT"));
        assert_eq!(losers[0].failed_phase, Some(SyncPhase::Committing));

        let head = store.current_version(binding.id).await.unwrap().unwrap();
        assert_eq!(head.version_no, 6);
        assert_eq!(store.list_versions(binding.id).await.unwrap().len(), 6);
        assert_eq!(store.list_sync_records(binding.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_colliding_names_produce_rename_plan() {
        let raw = export(&[(11, "load", CLEAN_SQL), (12, "load", AGGREGATE_SQL)], &[(0, 11), (11, 12)]);
        let preview = orchestrator(StubSource::new(raw), Arc::new(MemoryStore::new()))
            .preview(1, 100)
            .await;

        assert_eq!(preview.rename_plan.len(), 1);
        assert_eq!(preview.rename_plan[0].task_code, 12);
        assert_ne!(preview.rename_plan[0].resolved_name, "load");
    }

    #[tokio::test]
    async fn test_ambiguous_table_blocks_sync() {
        let store = Arc::new(MemoryStore::new());
        let raw = export(&[(11, "T1", AMBIGUOUS_SQL)], &[(0, 11)]);
        let sync = orchestrator(StubSource::new(raw), store.clone());

        let preview = sync.preview(1, 100).await;
        assert_eq!(preview.decision, SyncDecision::Blocked);
        assert!(!preview.can_sync);
        assert!(preview.issues.iter().any(|issue| issue.code == "SQL_TABLE_AMBIGUOUS"));

        let outcome = sync.execute(execute_request(true)).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.decision, Some(SyncDecision::Blocked));
        assert_eq!(outcome.error_code.as_deref(), Some("SQL_TABLE_AMBIGUOUS"));
        assert!(store.find_workflow(1, 100).await.unwrap().is_none());
        assert_eq!(
            sync.get_sync_record(outcome.sync_record_id).await.unwrap().error_code.as_deref(),
            Some("SQL_TABLE_AMBIGUOUS")
        );
    }

    #[tokio::test]
    async fn test_unknown_datasource_blocks_sync() {
        let mut source = StubSource::new(chain_export(&[]));
        source.datasources.clear();

        let preview = orchestrator(source, Arc::new(MemoryStore::new())).preview(1, 100).await;

        assert_eq!(preview.decision, SyncDecision::Blocked);
        let missing = preview.issues.iter().filter(|issue| issue.code == DATASOURCE_NOT_FOUND).count();
        assert_eq!(missing, 3);
    }

    #[tokio::test]
    async fn test_task_owned_by_other_workflow_blocks_sync() {
        let store = Arc::new(MemoryStore::new());
        let other = store.ensure_workflow(1, 200, "other").await.unwrap();
        let mut definition = WorkflowDefinition::new(1, 200, "other");
        definition.tasks = vec![Task::sql(12, "T2", "select 1")];
        VersionManager::new(store.clone(), 0)
            .commit(other.id, &definition, TriggerSource::Import, None, "bob")
            .await
            .unwrap();

        let preview = orchestrator(StubSource::new(chain_export(&[])), store).preview(1, 100).await;

        assert_eq!(preview.decision, SyncDecision::Blocked);
        let conflict = preview
            .issues
            .iter()
            .find(|issue| issue.code == WORKFLOW_BINDING_CONFLICT)
            .unwrap();
        assert_eq!(conflict.task_code, Some(12));
    }

    #[tokio::test]
    async fn test_disabled_workflow_is_recorded() {
        let store = Arc::new(MemoryStore::new());
        let settings = SyncSettings {
            disabled_workflows: BTreeSet::from([100]),
            ..SyncSettings::default()
        };
        let sync = orchestrator_with(StubSource::new(chain_export(&[])), store, settings);

        let outcome = sync.execute(execute_request(false)).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.error_code.as_deref(), Some("RUNTIME_SYNC_DISABLED"));
        assert_eq!(outcome.failed_phase, Some(SyncPhase::Fetching));
        assert!(sync.get_sync_record(outcome.sync_record_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_runtime_workflow() {
        let mut source = StubSource::new(Value::Null);
        source.export = None;
        let sync = orchestrator(source, Arc::new(MemoryStore::new()));

        let preview = sync.preview(1, 100).await;
        assert_eq!(preview.issues[0].code, "RUNTIME_WORKFLOW_NOT_FOUND");

        let outcome = sync.execute(execute_request(false)).await.unwrap();
        assert_eq!(outcome.error_code.as_deref(), Some("RUNTIME_WORKFLOW_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_slow_scheduler_times_out() {
        let mut source = StubSource::new(chain_export(&[]));
        source.delay = Some(Duration::from_secs(5));
        let settings = SyncSettings {
            fetch_timeout: Duration::from_millis(50),
            ..SyncSettings::default()
        };
        let sync = orchestrator_with(source, Arc::new(MemoryStore::new()), settings);

        let outcome = sync.execute(execute_request(false)).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.error_code.as_deref(), Some("RUNTIME_FETCH_TIMEOUT"));
        assert!(outcome.diff_summary.is_none());
    }

    #[tokio::test]
    async fn test_stalled_lineage_blocks_preview() {
        let settings = SyncSettings {
            fetch_timeout: Duration::from_millis(100),
            ..SyncSettings::default()
        };
        let sync = RuntimeSyncOrchestrator::new(
            Arc::new(StubSource::new(chain_export(&[]))),
            LineageEdgeInferencer::new(Arc::new(StalledLineage)).with_timeout(settings.fetch_timeout),
            Arc::new(CatalogRegistry::new(catalog())),
            VersionManager::new(Arc::new(MemoryStore::new()), settings.commit_retry_budget),
            settings,
        );

        let preview = tokio::time::timeout(Duration::from_secs(2), sync.preview(1, 100))
            .await
            .expect("preview should not wait on a stalled lineage service");

        assert!(!preview.can_sync);
        assert_eq!(preview.decision, SyncDecision::Blocked);
        assert!(preview.issues.iter().any(|issue| issue.code == "LINEAGE_UNAVAILABLE"));
    }

    #[tokio::test]
    async fn test_unsupported_node_type_is_terminal() {
        let mut raw = chain_export(&[]);
        raw["taskDefinitionList"][0]["taskType"] = json!("QUANTUM");
        let store = Arc::new(MemoryStore::new());
        let sync = orchestrator(StubSource::new(raw), store.clone());

        let outcome = sync.execute(execute_request(true)).await.unwrap();

        assert_eq!(outcome.error_code.as_deref(), Some("UNSUPPORTED_NODE_TYPE"));
        assert_eq!(outcome.failed_phase, Some(SyncPhase::Normalizing));
        assert!(store.find_workflow(1, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_record_lookups() {
        let sync = orchestrator(StubSource::new(chain_export(&[])), Arc::new(MemoryStore::new()));

        assert_eq!(sync.get_sync_record(42).await.unwrap_err().code(), "SYNC_RECORD_NOT_FOUND");
        assert_eq!(sync.list_sync_records(42).await.unwrap_err().code(), "WORKFLOW_NOT_FOUND");
    }
}
