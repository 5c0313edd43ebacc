/// Version management for declared workflows
///
/// Versions are immutable snapshots numbered 1, 2, 3... per workflow. Every commit
/// appends one; rollback appends a copy of an older one. The store guards the append
/// with the expected current version number, and the manager retries a lost race a
/// bounded number of times.

use crate::error::{Result, SyncError};
use crate::workflow::diff::{unified_diff, DiffCounts, DiffSections, DiffSummary, StructuralDiffEngine};
use crate::workflow::store::{CommitReceipt, NewSyncRecord, WorkflowStore};
use crate::workflow::types::{TaskCode, WorkflowDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type WorkflowId = i64;
pub type VersionId = i64;

/// What caused a version to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Import,
    Rollback,
    RuntimeSync,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Import => "import",
            TriggerSource::Rollback => "rollback",
            TriggerSource::RuntimeSync => "runtime_sync",
        }
    }

    pub fn parse(value: &str) -> Option<TriggerSource> {
        match value {
            "manual" => Some(TriggerSource::Manual),
            "import" => Some(TriggerSource::Import),
            "rollback" => Some(TriggerSource::Rollback),
            "runtime_sync" => Some(TriggerSource::RuntimeSync),
            _ => None,
        }
    }
}

/// Immutable serialized copy of a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub id: VersionId,
    pub workflow_id: WorkflowId,
    pub version_no: u32,
    /// Canonical JSON of the definition
    pub structure_snapshot: String,
    pub content_hash: String,
    pub change_summary: Option<String>,
    pub trigger_source: TriggerSource,
    pub rollback_from_version_id: Option<VersionId>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl VersionSnapshot {
    /// Deserialize the stored definition
    pub fn definition(&self) -> Result<WorkflowDefinition> {
        serde_json::from_str(&self.structure_snapshot).map_err(|e| SyncError::VersionSnapshotUnsupported {
            version_id: self.id,
            reason: e.to_string(),
        })
    }
}

/// Version about to be appended; the store assigns id and number
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub workflow_id: WorkflowId,
    pub structure_snapshot: String,
    pub content_hash: String,
    pub change_summary: Option<String>,
    pub trigger_source: TriggerSource,
    pub rollback_from_version_id: Option<VersionId>,
    pub created_by: String,
    /// Task codes owned by the workflow once this version is current
    pub task_codes: Vec<TaskCode>,
}

impl NewVersion {
    pub fn from_definition(
        workflow_id: WorkflowId,
        definition: &WorkflowDefinition,
        trigger_source: TriggerSource,
        change_summary: Option<String>,
        created_by: &str,
    ) -> Result<Self> {
        Ok(Self {
            workflow_id,
            structure_snapshot: StructuralDiffEngine::snapshot_json(definition)?,
            content_hash: StructuralDiffEngine::content_hash(definition)?,
            change_summary,
            trigger_source,
            rollback_from_version_id: None,
            created_by: created_by.to_string(),
            task_codes: definition.task_codes().into_iter().collect(),
        })
    }
}

/// Structured comparison of two versions
#[derive(Debug, Clone, Serialize)]
pub struct VersionCompare {
    pub workflow_id: WorkflowId,
    pub left_version_id: Option<VersionId>,
    pub left_version_no: Option<u32>,
    pub right_version_id: VersionId,
    pub right_version_no: u32,
    pub changed: bool,
    pub summary: DiffCounts,
    pub sections: DiffSections,
    pub diff: DiffSummary,
    /// Unified line diff of the pretty snapshots
    pub raw_diff: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub workflow_id: WorkflowId,
    pub new_version_id: VersionId,
    pub new_version_no: u32,
    pub rollback_from_version_id: VersionId,
    pub rollback_from_version_no: u32,
}

/// Creates, compares and rolls back workflow versions
#[derive(Clone)]
pub struct VersionManager {
    store: Arc<dyn WorkflowStore>,
    /// Extra attempts after losing a commit race
    retry_budget: u32,
}

impl VersionManager {
    pub fn new(store: Arc<dyn WorkflowStore>, retry_budget: u32) -> Self {
        Self { store, retry_budget }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub async fn current(&self, workflow_id: WorkflowId) -> Result<Option<VersionSnapshot>> {
        self.store.current_version(workflow_id).await
    }

    pub async fn list(&self, workflow_id: WorkflowId) -> Result<Vec<VersionSnapshot>> {
        self.require_workflow(workflow_id).await?;
        self.store.list_versions(workflow_id).await
    }

    /// Commit a definition as the next version
    ///
    /// The content does not depend on the previous version, so a lost race is
    /// retried against the refreshed head.
    pub async fn commit(
        &self,
        workflow_id: WorkflowId,
        definition: &WorkflowDefinition,
        trigger_source: TriggerSource,
        change_summary: Option<String>,
        operator: &str,
    ) -> Result<VersionSnapshot> {
        self.require_workflow(workflow_id).await?;
        let version = NewVersion::from_definition(workflow_id, definition, trigger_source, change_summary, operator)?;
        self.append_with_retry(version).await
    }

    /// Append a version only if the head is still `expected_version_no`
    ///
    /// The sync record, when given, is written in the same atomic step.
    pub async fn commit_expected(
        &self,
        version: NewVersion,
        expected_version_no: u32,
        sync_record: Option<NewSyncRecord>,
    ) -> Result<CommitReceipt> {
        self.store.append_version(version, expected_version_no, sync_record).await
    }

    /// Compare two versions of one workflow
    ///
    /// The right version is mandatory; no left version compares against an empty
    /// baseline. When the left version is newer the sides are swapped.
    pub async fn compare(
        &self,
        workflow_id: WorkflowId,
        left_version_id: Option<VersionId>,
        right_version_id: Option<VersionId>,
    ) -> Result<VersionCompare> {
        let right_version_id = right_version_id
            .ok_or_else(|| SyncError::VersionCompareInvalid("right version id is required".to_string()))?;
        if left_version_id == Some(right_version_id) {
            return Err(SyncError::VersionCompareInvalid(
                "cannot compare a version with itself".to_string(),
            ));
        }

        let mut right = self.version_of(workflow_id, right_version_id).await?;
        let mut left = match left_version_id {
            Some(id) => Some(self.version_of(workflow_id, id).await?),
            None => None,
        };
        if let Some(newer) = left.as_ref().filter(|l| l.version_no > right.version_no).cloned() {
            left = Some(right);
            right = newer;
        }

        let right_definition = right.definition()?;
        let left_definition = left.as_ref().map(VersionSnapshot::definition).transpose()?;

        let diff = StructuralDiffEngine::diff(left_definition.as_ref(), &right_definition)?;
        let left_label = left
            .as_ref()
            .map(|l| format!("v{}", l.version_no))
            .unwrap_or_else(|| "empty".to_string());
        let raw_diff = unified_diff(
            &left_label,
            &StructuralDiffEngine::pretty_snapshot(left_definition.as_ref())?,
            &format!("v{}", right.version_no),
            &StructuralDiffEngine::pretty_snapshot(Some(&right_definition))?,
        );

        Ok(VersionCompare {
            workflow_id,
            left_version_id: left.as_ref().map(|l| l.id),
            left_version_no: left.as_ref().map(|l| l.version_no),
            right_version_id: right.id,
            right_version_no: right.version_no,
            changed: diff.changed,
            summary: diff.counts,
            sections: diff.sections(),
            diff,
            raw_diff,
        })
    }

    /// Create a new version whose content equals `target_version_id`
    pub async fn rollback(
        &self,
        workflow_id: WorkflowId,
        target_version_id: VersionId,
        operator: &str,
        reason: Option<&str>,
    ) -> Result<RollbackOutcome> {
        let target = self.version_of(workflow_id, target_version_id).await?;
        let definition = target.definition().map_err(|e| SyncError::RollbackFailed {
            version_id: target.id,
            reason: e.to_string(),
        })?;

        let summary = match reason.map(str::trim).filter(|r| !r.is_empty()) {
            Some(reason) => format!("rollback to v{}: {}", target.version_no, reason),
            None => format!("rollback to v{}", target.version_no),
        };
        let mut version = NewVersion::from_definition(
            workflow_id,
            &definition,
            TriggerSource::Rollback,
            Some(summary),
            operator,
        )?;
        version.rollback_from_version_id = Some(target.id);

        let created = self.append_with_retry(version).await?;
        tracing::info!(
            "⏪ Rolled back workflow {} to v{} as v{}",
            workflow_id,
            target.version_no,
            created.version_no
        );

        Ok(RollbackOutcome {
            workflow_id,
            new_version_id: created.id,
            new_version_no: created.version_no,
            rollback_from_version_id: target.id,
            rollback_from_version_no: target.version_no,
        })
    }

    async fn append_with_retry(&self, version: NewVersion) -> Result<VersionSnapshot> {
        let workflow_id = version.workflow_id;
        let mut attempt = 0;
        loop {
            let expected = self
                .store
                .current_version(workflow_id)
                .await?
                .map_or(0, |current| current.version_no);

            match self.store.append_version(version.clone(), expected, None).await {
                Ok(receipt) => {
                    tracing::debug!("Committed workflow {} v{}", workflow_id, receipt.version.version_no);
                    return Ok(receipt.version);
                }
                Err(SyncError::VersionConflict { expected, actual, .. }) if attempt < self.retry_budget => {
                    attempt += 1;
                    tracing::warn!(
                        "Version race on workflow {} (expected v{}, found v{}), retry {}/{}",
                        workflow_id,
                        expected,
                        actual,
                        attempt,
                        self.retry_budget
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn require_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        match self.store.get_workflow(workflow_id).await? {
            Some(_) => Ok(()),
            None => Err(SyncError::WorkflowNotFound(workflow_id)),
        }
    }

    async fn version_of(&self, workflow_id: WorkflowId, version_id: VersionId) -> Result<VersionSnapshot> {
        self.store
            .get_version(version_id)
            .await?
            .filter(|version| version.workflow_id == workflow_id)
            .ok_or(SyncError::VersionNotFound(version_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::store::MemoryStore;
    use crate::workflow::types::{Edge, Task};

    fn definition(sql: &str) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new(1, 100, "orders");
        definition.tasks = vec![Task::sql(1, "load", sql), Task::sql(2, "publish", "insert into b select * from a")];
        definition.edges = vec![Edge::new(0, 1), Edge::new(1, 2)];
        definition
    }

    async fn manager_with_workflow() -> (VersionManager, WorkflowId) {
        let store = Arc::new(MemoryStore::new());
        let binding = store.ensure_workflow(1, 100, "orders").await.unwrap();
        (VersionManager::new(store, 2), binding.id)
    }

    #[tokio::test]
    async fn test_commit_numbers_are_gapless() {
        let (manager, workflow_id) = manager_with_workflow().await;

        for n in 1..=3 {
            let version = manager
                .commit(workflow_id, &definition(&format!("select {}", n)), TriggerSource::Manual, None, "alice")
                .await
                .unwrap();
            assert_eq!(version.version_no, n);
        }

        let versions = manager.list(workflow_id).await.unwrap();
        let numbers: Vec<u32> = versions.iter().map(|v| v.version_no).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(manager.current(workflow_id).await.unwrap().unwrap().version_no, 3);
    }

    #[tokio::test]
    async fn test_commit_unknown_workflow() {
        let manager = VersionManager::new(Arc::new(MemoryStore::new()), 2);
        let err = manager
            .commit(42, &definition("select 1"), TriggerSource::Manual, None, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_compare_requires_right_version() {
        let (manager, workflow_id) = manager_with_workflow().await;
        let v1 = manager
            .commit(workflow_id, &definition("select 1"), TriggerSource::Manual, None, "alice")
            .await
            .unwrap();

        let err = manager.compare(workflow_id, Some(v1.id), None).await.unwrap_err();
        assert_eq!(err.code(), "VERSION_COMPARE_INVALID");

        let err = manager.compare(workflow_id, Some(v1.id), Some(v1.id)).await.unwrap_err();
        assert_eq!(err.code(), "VERSION_COMPARE_INVALID");

        let err = manager.compare(workflow_id, None, Some(999)).await.unwrap_err();
        assert_eq!(err.code(), "VERSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_compare_rejects_version_of_other_workflow() {
        let store = Arc::new(MemoryStore::new());
        let first = store.ensure_workflow(1, 100, "orders").await.unwrap();
        let second = store.ensure_workflow(1, 200, "users").await.unwrap();
        let manager = VersionManager::new(store, 2);
        let foreign = manager
            .commit(second.id, &definition("select 1"), TriggerSource::Manual, None, "alice")
            .await
            .unwrap();

        let err = manager.compare(first.id, None, Some(foreign.id)).await.unwrap_err();
        assert!(matches!(err, SyncError::VersionNotFound(id) if id == foreign.id));
    }

    #[tokio::test]
    async fn test_compare_against_empty_baseline_and_swap() {
        let (manager, workflow_id) = manager_with_workflow().await;
        let v1 = manager
            .commit(workflow_id, &definition("select 1"), TriggerSource::Manual, None, "alice")
            .await
            .unwrap();
        let v2 = manager
            .commit(workflow_id, &definition("select 2"), TriggerSource::Manual, None, "alice")
            .await
            .unwrap();

        let from_empty = manager.compare(workflow_id, None, Some(v1.id)).await.unwrap();
        assert!(from_empty.changed);
        assert_eq!(from_empty.sections.added.tasks.len(), 2);
        assert!(from_empty.raw_diff.starts_with("--- empty\n+++ v1"));

        // left newer than right gets swapped
        let swapped = manager.compare(workflow_id, Some(v2.id), Some(v1.id)).await.unwrap();
        assert_eq!(swapped.left_version_no, Some(1));
        assert_eq!(swapped.right_version_no, 2);
        assert_eq!(swapped.summary.modified, 1);
        assert_eq!(swapped.sections.modified.tasks, vec!["load(1): sql"]);
    }

    #[tokio::test]
    async fn test_rollback_round_trip() {
        let (manager, workflow_id) = manager_with_workflow().await;
        let v1 = manager
            .commit(workflow_id, &definition("select 1"), TriggerSource::Manual, None, "alice")
            .await
            .unwrap();
        manager
            .commit(workflow_id, &definition("select 2"), TriggerSource::Manual, None, "alice")
            .await
            .unwrap();

        let outcome = manager.rollback(workflow_id, v1.id, "bob", Some("bad deploy")).await.unwrap();
        assert_eq!(outcome.new_version_no, 3);
        assert_eq!(outcome.rollback_from_version_no, 1);

        let current = manager.current(workflow_id).await.unwrap().unwrap();
        assert_eq!(current.trigger_source, TriggerSource::Rollback);
        assert_eq!(current.rollback_from_version_id, Some(v1.id));
        assert_eq!(current.content_hash, v1.content_hash);
        assert_eq!(current.change_summary.as_deref(), Some("rollback to v1: bad deploy"));

        let compare = manager.compare(workflow_id, Some(current.id), Some(v1.id)).await.unwrap();
        assert!(!compare.changed);
    }

    #[tokio::test]
    async fn test_rollback_of_unreadable_snapshot_fails() {
        let store = Arc::new(MemoryStore::new());
        let binding = store.ensure_workflow(1, 100, "orders").await.unwrap();
        let broken = NewVersion {
            workflow_id: binding.id,
            structure_snapshot: "{not json".to_string(),
            content_hash: "x".to_string(),
            change_summary: None,
            trigger_source: TriggerSource::Import,
            rollback_from_version_id: None,
            created_by: "import".to_string(),
            task_codes: Vec::new(),
        };
        let receipt = store.append_version(broken, 0, None).await.unwrap();
        let manager = VersionManager::new(store, 2);

        let err = manager
            .rollback(binding.id, receipt.version.id, "bob", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VERSION_ROLLBACK_FAILED");
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let (manager, workflow_id) = manager_with_workflow().await;
        manager
            .commit(workflow_id, &definition("select 1"), TriggerSource::Manual, None, "alice")
            .await
            .unwrap();

        let stale = NewVersion::from_definition(
            workflow_id,
            &definition("select 9"),
            TriggerSource::RuntimeSync,
            None,
            "runtime-sync",
        )
        .unwrap();
        let err = manager.commit_expected(stale, 0, None).await.unwrap_err();

        assert!(matches!(err, SyncError::VersionConflict { expected: 0, actual: 1, .. }));
        assert_eq!(manager.current(workflow_id).await.unwrap().unwrap().version_no, 1);
    }
}
