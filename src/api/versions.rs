/// Version history endpoints

use super::AppState;
use crate::error::SyncError;
use crate::workflow::version::{RollbackOutcome, VersionCompare, VersionId};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareRequest {
    #[serde(default)]
    pub left_version_id: Option<VersionId>,
    #[serde(default)]
    pub right_version_id: Option<VersionId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn create_version_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/versions", get(list_versions))
        .route("/api/workflows/{id}/versions/compare", post(compare_versions))
        .route("/api/workflows/{id}/versions/{version_id}/rollback", post(rollback_version))
}

/// GET /api/workflows/{id}/versions
async fn list_versions(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> Result<Json<Value>, SyncError> {
    let versions = state.versions.list(workflow_id).await?;
    Ok(Json(json!({ "workflow_id": workflow_id, "versions": versions })))
}

/// POST /api/workflows/{id}/versions/compare
/// Body: { "leftVersionId": 3, "rightVersionId": 5 }
async fn compare_versions(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(request): Json<CompareRequest>,
) -> Result<Json<VersionCompare>, SyncError> {
    let compare = state
        .versions
        .compare(workflow_id, request.left_version_id, request.right_version_id)
        .await?;
    Ok(Json(compare))
}

/// POST /api/workflows/{id}/versions/{version_id}/rollback
/// Body: { "operator": "alice", "reason": "bad deploy" }
async fn rollback_version(
    State(state): State<AppState>,
    Path((workflow_id, version_id)): Path<(i64, VersionId)>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<RollbackOutcome>, SyncError> {
    let operator = request
        .operator
        .as_deref()
        .map(str::trim)
        .filter(|operator| !operator.is_empty())
        .unwrap_or(state.orchestrator.settings().default_operator.as_str());
    let outcome = state
        .versions
        .rollback(workflow_id, version_id, operator, request.reason.as_deref())
        .await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        HttpLineageInferencer, LineageEdgeInferencer, RuntimeSyncOrchestrator, SchedulerClient, SyncSettings,
    };
    use crate::workflow::registry::{CatalogRegistry, TableCatalog};
    use crate::workflow::store::{MemoryStore, WorkflowStore};
    use crate::workflow::types::{Edge, Task, WorkflowDefinition};
    use crate::workflow::version::TriggerSource;
    use crate::workflow::VersionManager;
    use std::sync::Arc;

    async fn state_with_versions(default_operator: &str) -> (AppState, i64, VersionId) {
        let store = Arc::new(MemoryStore::new());
        let binding = store.ensure_workflow(1, 100, "orders").await.unwrap();
        let settings = SyncSettings {
            default_operator: default_operator.to_string(),
            ..SyncSettings::default()
        };
        let versions = VersionManager::new(store, settings.commit_retry_budget);

        let mut definition = WorkflowDefinition::new(1, 100, "orders");
        definition.tasks = vec![Task::sql(11, "load", "select 1")];
        definition.edges = vec![Edge::new(0, 11)];
        let first = versions
            .commit(binding.id, &definition, TriggerSource::Manual, None, "alice")
            .await
            .unwrap();
        definition.tasks = vec![Task::sql(11, "load", "select 2")];
        versions
            .commit(binding.id, &definition, TriggerSource::Manual, None, "alice")
            .await
            .unwrap();

        // Rollback never reaches the scheduler or the lineage service
        let catalog = Arc::new(CatalogRegistry::new(TableCatalog::default()));
        let orchestrator = RuntimeSyncOrchestrator::new(
            Arc::new(SchedulerClient::new("http://127.0.0.1:9", None)),
            LineageEdgeInferencer::new(Arc::new(HttpLineageInferencer::new("http://127.0.0.1:9/lineage"))),
            Arc::clone(&catalog),
            versions.clone(),
            settings,
        );
        let state = AppState {
            orchestrator: Arc::new(orchestrator),
            versions,
            catalog,
        };
        (state, binding.id, first.id)
    }

    #[tokio::test]
    async fn test_rollback_without_operator_uses_configured_default() {
        let (state, workflow_id, target) = state_with_versions("ops-bot").await;

        let Json(outcome) = rollback_version(
            State(state.clone()),
            Path((workflow_id, target)),
            Json(RollbackRequest {
                operator: Some("  ".to_string()),
                reason: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(outcome.new_version_no, 3);
        let current = state.versions.current(workflow_id).await.unwrap().unwrap();
        assert_eq!(current.created_by, "ops-bot");
    }

    #[tokio::test]
    async fn test_rollback_keeps_explicit_operator() {
        let (state, workflow_id, target) = state_with_versions("ops-bot").await;

        rollback_version(
            State(state.clone()),
            Path((workflow_id, target)),
            Json(RollbackRequest {
                operator: Some("carol".to_string()),
                reason: Some("bad deploy".to_string()),
            }),
        )
        .await
        .unwrap();

        let current = state.versions.current(workflow_id).await.unwrap().unwrap();
        assert_eq!(current.created_by, "carol");
    }
}
