/// Persistence interfaces for versions and sync records
///
/// Versions and sync records are append-only logs behind one narrow write path.
/// `append_version` is the only operation that moves a workflow's current-version
/// pointer, and it only does so when the caller's expected version number still
/// matches. This module also carries the in-process store used by tests and
/// single-node deployments; the SQLite store lives in `storage`.

use crate::error::{Result, SyncError};
use crate::workflow::types::TaskCode;
use crate::workflow::version::{NewVersion, VersionId, VersionSnapshot, WorkflowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

pub type SyncRecordId = i64;

/// Platform workflow bound to a scheduler workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowBinding {
    pub id: WorkflowId,
    pub project_code: i64,
    pub workflow_code: i64,
    pub name: String,
    /// 0 while the workflow has no version
    pub current_version_no: u32,
    pub current_version_id: Option<VersionId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    #[default]
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<SyncStatus> {
        match value {
            "success" => Some(SyncStatus::Success),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Audit entry of one execute attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: SyncRecordId,
    pub workflow_id: Option<WorkflowId>,
    pub project_code: i64,
    pub workflow_code: i64,
    pub status: SyncStatus,
    pub snapshot_hash: Option<String>,
    pub snapshot_json: Option<String>,
    pub diff_json: Option<String>,
    pub version_id: Option<VersionId>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub operator: String,
    pub created_at: DateTime<Utc>,
}

/// Sync record before the store assigns id and timestamp
#[derive(Debug, Clone, Default)]
pub struct NewSyncRecord {
    pub workflow_id: Option<WorkflowId>,
    pub project_code: i64,
    pub workflow_code: i64,
    pub status: SyncStatus,
    pub snapshot_hash: Option<String>,
    pub snapshot_json: Option<String>,
    pub diff_json: Option<String>,
    /// Filled by the store when written together with a version
    pub version_id: Option<VersionId>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub operator: String,
}

impl NewSyncRecord {
    fn into_record(self, id: SyncRecordId, created_at: DateTime<Utc>) -> SyncRecord {
        SyncRecord {
            id,
            workflow_id: self.workflow_id,
            project_code: self.project_code,
            workflow_code: self.workflow_code,
            status: self.status,
            snapshot_hash: self.snapshot_hash,
            snapshot_json: self.snapshot_json,
            diff_json: self.diff_json,
            version_id: self.version_id,
            error_code: self.error_code,
            error_message: self.error_message,
            operator: self.operator,
            created_at,
        }
    }
}

/// Result of an append: the new version and the record written with it
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub version: VersionSnapshot,
    pub sync_record: Option<SyncRecord>,
}

/// Storage behind the version manager and the sync orchestrator
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn find_workflow(&self, project_code: i64, workflow_code: i64) -> Result<Option<WorkflowBinding>>;

    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowBinding>>;

    /// Return the binding for (project, workflow code), creating it without a version
    async fn ensure_workflow(&self, project_code: i64, workflow_code: i64, name: &str) -> Result<WorkflowBinding>;

    async fn get_version(&self, version_id: VersionId) -> Result<Option<VersionSnapshot>>;

    async fn current_version(&self, workflow_id: WorkflowId) -> Result<Option<VersionSnapshot>>;

    /// Versions of a workflow, oldest first
    async fn list_versions(&self, workflow_id: WorkflowId) -> Result<Vec<VersionSnapshot>>;

    /// Append the next version if the head is still `expected_version_no`
    ///
    /// Fails with `VersionConflict` otherwise. The optional sync record is stored in
    /// the same atomic step with its `version_id` set to the new version.
    async fn append_version(
        &self,
        version: NewVersion,
        expected_version_no: u32,
        sync_record: Option<NewSyncRecord>,
    ) -> Result<CommitReceipt>;

    async fn append_sync_record(&self, record: NewSyncRecord) -> Result<SyncRecord>;

    /// Sync records of a workflow, newest first
    async fn list_sync_records(&self, workflow_id: WorkflowId) -> Result<Vec<SyncRecord>>;

    async fn get_sync_record(&self, record_id: SyncRecordId) -> Result<Option<SyncRecord>>;

    /// Workflow currently owning each of the given task codes
    async fn task_owners(&self, task_codes: &[TaskCode]) -> Result<BTreeMap<TaskCode, WorkflowId>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    workflows: BTreeMap<WorkflowId, WorkflowBinding>,
    workflow_index: HashMap<(i64, i64), WorkflowId>,
    versions: BTreeMap<VersionId, VersionSnapshot>,
    task_owners: BTreeMap<TaskCode, WorkflowId>,
    sync_records: BTreeMap<SyncRecordId, SyncRecord>,
    next_workflow_id: i64,
    next_version_id: i64,
    next_record_id: i64,
}

impl MemoryState {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }
}

/// In-process store
///
/// All state sits behind one mutex that is never held across an await, so the
/// check-and-append of a version is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Storage(anyhow::anyhow!("memory store lock poisoned")))
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn find_workflow(&self, project_code: i64, workflow_code: i64) -> Result<Option<WorkflowBinding>> {
        let state = self.state()?;
        Ok(state
            .workflow_index
            .get(&(project_code, workflow_code))
            .and_then(|id| state.workflows.get(id))
            .cloned())
    }

    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowBinding>> {
        Ok(self.state()?.workflows.get(&workflow_id).cloned())
    }

    async fn ensure_workflow(&self, project_code: i64, workflow_code: i64, name: &str) -> Result<WorkflowBinding> {
        let mut state = self.state()?;
        if let Some(binding) = state
            .workflow_index
            .get(&(project_code, workflow_code))
            .and_then(|id| state.workflows.get(id))
        {
            return Ok(binding.clone());
        }

        let id = MemoryState::next_id(&mut state.next_workflow_id);
        let binding = WorkflowBinding {
            id,
            project_code,
            workflow_code,
            name: name.to_string(),
            current_version_no: 0,
            current_version_id: None,
        };
        state.workflow_index.insert((project_code, workflow_code), id);
        state.workflows.insert(id, binding.clone());
        Ok(binding)
    }

    async fn get_version(&self, version_id: VersionId) -> Result<Option<VersionSnapshot>> {
        Ok(self.state()?.versions.get(&version_id).cloned())
    }

    async fn current_version(&self, workflow_id: WorkflowId) -> Result<Option<VersionSnapshot>> {
        let state = self.state()?;
        Ok(state
            .workflows
            .get(&workflow_id)
            .and_then(|binding| binding.current_version_id)
            .and_then(|id| state.versions.get(&id))
            .cloned())
    }

    async fn list_versions(&self, workflow_id: WorkflowId) -> Result<Vec<VersionSnapshot>> {
        let state = self.state()?;
        let mut versions: Vec<VersionSnapshot> = state
            .versions
            .values()
            .filter(|version| version.workflow_id == workflow_id)
            .cloned()
            .collect();
        versions.sort_by_key(|version| version.version_no);
        Ok(versions)
    }

    async fn append_version(
        &self,
        version: NewVersion,
        expected_version_no: u32,
        sync_record: Option<NewSyncRecord>,
    ) -> Result<CommitReceipt> {
        let mut state = self.state()?;
        let actual = state
            .workflows
            .get(&version.workflow_id)
            .map(|binding| binding.current_version_no)
            .ok_or(SyncError::WorkflowNotFound(version.workflow_id))?;
        if actual != expected_version_no {
            return Err(SyncError::VersionConflict {
                workflow_id: version.workflow_id,
                expected: expected_version_no,
                actual,
            });
        }

        let now = Utc::now();
        let id = MemoryState::next_id(&mut state.next_version_id);
        let snapshot = VersionSnapshot {
            id,
            workflow_id: version.workflow_id,
            version_no: actual + 1,
            structure_snapshot: version.structure_snapshot,
            content_hash: version.content_hash,
            change_summary: version.change_summary,
            trigger_source: version.trigger_source,
            rollback_from_version_id: version.rollback_from_version_id,
            created_by: version.created_by,
            created_at: now,
        };
        state.versions.insert(id, snapshot.clone());
        if let Some(binding) = state.workflows.get_mut(&version.workflow_id) {
            binding.current_version_no = snapshot.version_no;
            binding.current_version_id = Some(id);
        }

        state.task_owners.retain(|_, owner| *owner != version.workflow_id);
        for code in version.task_codes {
            state.task_owners.insert(code, version.workflow_id);
        }

        let sync_record = sync_record.map(|mut record| {
            record.version_id = Some(id);
            record.workflow_id = Some(version.workflow_id);
            let record_id = MemoryState::next_id(&mut state.next_record_id);
            let record = record.into_record(record_id, now);
            state.sync_records.insert(record_id, record.clone());
            record
        });

        Ok(CommitReceipt {
            version: snapshot,
            sync_record,
        })
    }

    async fn append_sync_record(&self, record: NewSyncRecord) -> Result<SyncRecord> {
        let mut state = self.state()?;
        let id = MemoryState::next_id(&mut state.next_record_id);
        let record = record.into_record(id, Utc::now());
        state.sync_records.insert(id, record.clone());
        Ok(record)
    }

    async fn list_sync_records(&self, workflow_id: WorkflowId) -> Result<Vec<SyncRecord>> {
        let state = self.state()?;
        Ok(state
            .sync_records
            .values()
            .rev()
            .filter(|record| record.workflow_id == Some(workflow_id))
            .cloned()
            .collect())
    }

    async fn get_sync_record(&self, record_id: SyncRecordId) -> Result<Option<SyncRecord>> {
        Ok(self.state()?.sync_records.get(&record_id).cloned())
    }

    async fn task_owners(&self, task_codes: &[TaskCode]) -> Result<BTreeMap<TaskCode, WorkflowId>> {
        let state = self.state()?;
        Ok(task_codes
            .iter()
            .filter_map(|code| state.task_owners.get(code).map(|owner| (*code, *owner)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::version::TriggerSource;

    fn new_version(workflow_id: WorkflowId, hash: &str, task_codes: Vec<TaskCode>) -> NewVersion {
        NewVersion {
            workflow_id,
            structure_snapshot: "{}".to_string(),
            content_hash: hash.to_string(),
            change_summary: None,
            trigger_source: TriggerSource::Manual,
            rollback_from_version_id: None,
            created_by: "alice".to_string(),
            task_codes,
        }
    }

    #[tokio::test]
    async fn test_ensure_workflow_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.ensure_workflow(1, 100, "orders").await.unwrap();
        let again = store.ensure_workflow(1, 100, "renamed").await.unwrap();

        assert_eq!(first, again);
        assert_eq!(store.find_workflow(1, 100).await.unwrap(), Some(first));
        assert_eq!(store.find_workflow(1, 101).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_moves_pointer_and_records_atomically() {
        let store = MemoryStore::new();
        let binding = store.ensure_workflow(1, 100, "orders").await.unwrap();
        let record = NewSyncRecord {
            project_code: 1,
            workflow_code: 100,
            status: SyncStatus::Success,
            operator: "runtime-sync".to_string(),
            ..NewSyncRecord::default()
        };

        let receipt = store
            .append_version(new_version(binding.id, "h1", vec![11, 12]), 0, Some(record))
            .await
            .unwrap();

        assert_eq!(receipt.version.version_no, 1);
        let record = receipt.sync_record.unwrap();
        assert_eq!(record.version_id, Some(receipt.version.id));
        assert_eq!(record.workflow_id, Some(binding.id));
        assert_eq!(
            store.current_version(binding.id).await.unwrap().unwrap().id,
            receipt.version.id
        );
        assert_eq!(store.list_sync_records(binding.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_leaves_state_untouched() {
        let store = MemoryStore::new();
        let binding = store.ensure_workflow(1, 100, "orders").await.unwrap();
        store.append_version(new_version(binding.id, "h1", vec![]), 0, None).await.unwrap();

        let err = store
            .append_version(new_version(binding.id, "h2", vec![]), 0, None)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::VersionConflict { expected: 0, actual: 1, .. }));
        assert_eq!(store.list_versions(binding.id).await.unwrap().len(), 1);
        assert_eq!(
            store.current_version(binding.id).await.unwrap().unwrap().content_hash,
            "h1"
        );
    }

    #[tokio::test]
    async fn test_task_owners_follow_current_version() {
        let store = MemoryStore::new();
        let orders = store.ensure_workflow(1, 100, "orders").await.unwrap();
        let users = store.ensure_workflow(1, 200, "users").await.unwrap();
        store.append_version(new_version(orders.id, "a", vec![1, 2]), 0, None).await.unwrap();
        store.append_version(new_version(users.id, "b", vec![3]), 0, None).await.unwrap();
        store.append_version(new_version(orders.id, "c", vec![2]), 1, None).await.unwrap();

        let owners = store.task_owners(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(owners.get(&1), None);
        assert_eq!(owners.get(&2), Some(&orders.id));
        assert_eq!(owners.get(&3), Some(&users.id));
        assert_eq!(owners.len(), 2);
    }

    #[tokio::test]
    async fn test_sync_records_newest_first() {
        let store = MemoryStore::new();
        let binding = store.ensure_workflow(1, 100, "orders").await.unwrap();
        for code in ["A", "B"] {
            store
                .append_sync_record(NewSyncRecord {
                    workflow_id: Some(binding.id),
                    project_code: 1,
                    workflow_code: 100,
                    status: SyncStatus::Failed,
                    error_code: Some(code.to_string()),
                    operator: "bob".to_string(),
                    ..NewSyncRecord::default()
                })
                .await
                .unwrap();
        }

        let records = store.list_sync_records(binding.id).await.unwrap();
        assert_eq!(records[0].error_code.as_deref(), Some("B"));
        assert_eq!(records[1].status, SyncStatus::Failed);
        assert!(store.get_sync_record(records[1].id).await.unwrap().is_some());
    }
}
