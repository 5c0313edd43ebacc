/// Error taxonomy for the reconciliation engine
///
/// Every failure carries a stable code for programmatic handling and a kind that
/// decides how callers react to it. Internal failures keep their full cause for the
/// audit trail but only expose a generic message to users.

use crate::workflow::types::TaskCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    ExternalDependency,
    Disabled,
    Internal,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unsupported definition format: {0}")]
    DefinitionFormat(String),

    #[error("task {task_code} has unsupported node type '{node_type}'")]
    UnsupportedNodeType { task_code: TaskCode, node_type: String },

    #[error("task code {0} appears more than once in the export")]
    TaskCodeDuplicate(TaskCode),

    #[error("edge {upstream}->{downstream} references a task outside the workflow")]
    UnknownTask {
        upstream: TaskCode,
        downstream: TaskCode,
    },

    #[error("dependency cycle detected through edge {upstream}->{downstream}")]
    GraphCycle {
        upstream: TaskCode,
        downstream: TaskCode,
    },

    #[error("workflow {workflow_code} not found in scheduler project {project_code}")]
    RuntimeWorkflowNotFound { project_code: i64, workflow_code: i64 },

    #[error("runtime sync is disabled for workflow {0}")]
    SyncDisabled(i64),

    #[error("scheduler did not answer within {0:?}")]
    FetchTimeout(Duration),

    #[error("scheduler request failed: {0}")]
    Scheduler(String),

    #[error("edge mismatch between declared and inferred dependencies must be confirmed")]
    EdgeMismatchConfirmRequired,

    #[error("workflow {0} not found")]
    WorkflowNotFound(i64),

    #[error("version {0} not found")]
    VersionNotFound(i64),

    #[error("invalid version comparison: {0}")]
    VersionCompareInvalid(String),

    #[error("snapshot of version {version_id} cannot be read: {reason}")]
    VersionSnapshotUnsupported { version_id: i64, reason: String },

    #[error("rollback to version {version_id} failed: {reason}")]
    RollbackFailed { version_id: i64, reason: String },

    #[error("workflow {workflow_id} moved from version {expected} to {actual} during commit")]
    VersionConflict {
        workflow_id: i64,
        expected: u32,
        actual: u32,
    },

    #[error("sync record {0} not found")]
    SyncRecordNotFound(i64),

    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("sync failed: {0}")]
    Internal(#[source] anyhow::Error),
}

impl SyncError {
    /// Stable code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "VALIDATION_ERROR",
            SyncError::DefinitionFormat(_) => "DEFINITION_FORMAT_UNSUPPORTED",
            SyncError::UnsupportedNodeType { .. } => "UNSUPPORTED_NODE_TYPE",
            SyncError::TaskCodeDuplicate(_) => "TASK_CODE_DUPLICATE",
            SyncError::UnknownTask { .. } => "GRAPH_UNKNOWN_TASK",
            SyncError::GraphCycle { .. } => "GRAPH_CYCLE",
            SyncError::RuntimeWorkflowNotFound { .. } => "RUNTIME_WORKFLOW_NOT_FOUND",
            SyncError::SyncDisabled(_) => "RUNTIME_SYNC_DISABLED",
            SyncError::FetchTimeout(_) => "RUNTIME_FETCH_TIMEOUT",
            SyncError::Scheduler(_) => "RUNTIME_FETCH_FAILED",
            SyncError::EdgeMismatchConfirmRequired => "EDGE_MISMATCH_CONFIRM_REQUIRED",
            SyncError::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            SyncError::VersionNotFound(_) => "VERSION_NOT_FOUND",
            SyncError::VersionCompareInvalid(_) => "VERSION_COMPARE_INVALID",
            SyncError::VersionSnapshotUnsupported { .. } => "VERSION_SNAPSHOT_UNSUPPORTED",
            SyncError::RollbackFailed { .. } => "VERSION_ROLLBACK_FAILED",
            SyncError::VersionConflict { .. } => "VERSION_CONFLICT",
            SyncError::SyncRecordNotFound(_) => "SYNC_RECORD_NOT_FOUND",
            SyncError::Storage(_) => "STORAGE_ERROR",
            SyncError::Internal(_) => "SYNC_FAILED",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_)
            | SyncError::DefinitionFormat(_)
            | SyncError::UnsupportedNodeType { .. }
            | SyncError::UnknownTask { .. }
            | SyncError::GraphCycle { .. }
            | SyncError::VersionCompareInvalid(_)
            | SyncError::VersionSnapshotUnsupported { .. } => ErrorKind::Validation,
            SyncError::RuntimeWorkflowNotFound { .. }
            | SyncError::WorkflowNotFound(_)
            | SyncError::VersionNotFound(_)
            | SyncError::SyncRecordNotFound(_) => ErrorKind::NotFound,
            SyncError::TaskCodeDuplicate(_)
            | SyncError::EdgeMismatchConfirmRequired
            | SyncError::VersionConflict { .. } => ErrorKind::Conflict,
            SyncError::FetchTimeout(_) | SyncError::Scheduler(_) => ErrorKind::ExternalDependency,
            SyncError::SyncDisabled(_) => ErrorKind::Disabled,
            SyncError::RollbackFailed { .. } | SyncError::Storage(_) | SyncError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Message safe to show to users
    ///
    /// Internal failures are redacted; the code still identifies them.
    pub fn external_message(&self) -> String {
        match self {
            SyncError::Storage(_) => "A storage error occurred".to_string(),
            SyncError::Internal(_) => "An internal error occurred while committing the sync".to_string(),
            SyncError::RollbackFailed { version_id, .. } => {
                format!("Rollback to version {} failed", version_id)
            }
            other => other.to_string(),
        }
    }

    /// Full message including the cause chain, kept in audit records
    pub fn detail(&self) -> String {
        match self {
            SyncError::Storage(cause) => format!("storage failure: {:#}", cause),
            SyncError::Internal(cause) => format!("sync failed: {:#}", cause),
            other => other.to_string(),
        }
    }

    /// Wrap any failure as an internal commit failure, keeping it as the cause
    pub fn internal(cause: impl Into<anyhow::Error>) -> Self {
        SyncError::Internal(cause.into())
    }

    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_are_redacted() {
        let err = SyncError::internal(anyhow::anyhow!("UNIQUE constraint failed: workflow_versions.version_no"));

        assert_eq!(err.code(), "SYNC_FAILED");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.external_message().contains("UNIQUE"));
        assert!(err.detail().contains("UNIQUE constraint failed"));
    }

    #[test]
    fn test_detail_keeps_cause_chain() {
        let cause = anyhow::anyhow!("disk full").context("insert sync record");
        let err = SyncError::Storage(cause);

        assert_eq!(err.detail(), "storage failure: insert sync record: disk full");
    }

    #[test]
    fn test_user_errors_keep_message() {
        let err = SyncError::VersionCompareInvalid("right version id is required".into());

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            err.external_message(),
            "invalid version comparison: right version id is required"
        );

        let json = err.to_external_json();
        assert_eq!(json["error"]["code"], "VERSION_COMPARE_INVALID");
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_conflict_kinds() {
        let conflict = SyncError::VersionConflict {
            workflow_id: 7,
            expected: 5,
            actual: 6,
        };
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert_eq!(conflict.code(), "VERSION_CONFLICT");
        assert_eq!(SyncError::TaskCodeDuplicate(3).kind(), ErrorKind::Conflict);
        assert_eq!(SyncError::SyncDisabled(1).kind(), ErrorKind::Disabled);
    }
}
