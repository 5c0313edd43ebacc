/// Runtime sync endpoints
///
/// Preview and execute one workflow, and query the audit trail of attempts.

use super::AppState;
use crate::error::SyncError;
use crate::runtime::sync::{ExecuteRequest, ExecuteResponse, PreviewRequest, PreviewResponse};
use crate::workflow::store::SyncRecord;
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

pub fn create_sync_routes() -> Router<AppState> {
    Router::new()
        .route("/api/runtime-sync/preview", post(preview_sync))
        .route("/api/runtime-sync/execute", post(execute_sync))
        .route("/api/workflows/{id}/sync-records", get(list_sync_records))
        .route("/api/sync-records/{id}", get(get_sync_record))
}

fn require_codes(project_code: i64, workflow_code: i64) -> Result<(), SyncError> {
    if project_code <= 0 || workflow_code <= 0 {
        return Err(SyncError::Validation(
            "projectCode and workflowCode must be positive".to_string(),
        ));
    }
    Ok(())
}

/// POST /api/runtime-sync/preview
/// Body: { "projectCode": 1, "workflowCode": 100 }
async fn preview_sync(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<PreviewResponse>, SyncError> {
    require_codes(request.project_code, request.workflow_code)?;
    let preview = state
        .orchestrator
        .preview(request.project_code, request.workflow_code)
        .await;
    Ok(Json(preview))
}

/// POST /api/runtime-sync/execute
/// Body: { "projectCode": 1, "workflowCode": 100, "confirmEdgeMismatch": false, "operator": "alice" }
async fn execute_sync(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, SyncError> {
    require_codes(request.project_code, request.workflow_code)?;
    let outcome = state.orchestrator.execute(request).await?;
    Ok(Json(outcome))
}

/// GET /api/workflows/{id}/sync-records
async fn list_sync_records(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> Result<Json<Value>, SyncError> {
    let records = state.orchestrator.list_sync_records(workflow_id).await?;
    Ok(Json(json!({ "workflow_id": workflow_id, "records": records })))
}

/// GET /api/sync-records/{id}
async fn get_sync_record(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
) -> Result<Json<SyncRecord>, SyncError> {
    Ok(Json(state.orchestrator.get_sync_record(record_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_must_be_positive() {
        assert!(require_codes(1, 100).is_ok());
        assert_eq!(require_codes(0, 100).unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(require_codes(1, -5).unwrap_err().code(), "VALIDATION_ERROR");
    }
}
