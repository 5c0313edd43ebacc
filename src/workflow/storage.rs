/// SQLite persistence layer for versions and sync records
///
/// Version snapshots are stored as canonical JSON. The current-version pointer lives
/// on the workflows row and is moved with a conditional UPDATE guarded by the
/// expected version number, inside the same transaction that inserts the version,
/// refreshes task ownership and writes the sync record.

use crate::error::{Result, SyncError};
use crate::workflow::store::{
    CommitReceipt, NewSyncRecord, SyncRecord, SyncRecordId, SyncStatus, WorkflowBinding, WorkflowStore,
};
use crate::workflow::types::TaskCode;
use crate::workflow::version::{NewVersion, TriggerSource, VersionId, VersionSnapshot, WorkflowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(err.into())
    }
}

const VERSION_COLUMNS: &str = "id, workflow_id, version_no, structure_snapshot, content_hash, change_summary, \
     trigger_source, rollback_from_version_id, created_by, created_at";

const RECORD_COLUMNS: &str = "id, workflow_id, project_code, workflow_code, status, snapshot_hash, snapshot_json, \
     diff_json, version_id, error_code, error_message, operator, created_at";

/// SQLite-backed workflow store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and initialize the schema
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Single-connection in-memory database
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes; safe to call repeatedly
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_code INTEGER NOT NULL,
                workflow_code INTEGER NOT NULL,
                name TEXT NOT NULL,
                current_version_no INTEGER NOT NULL DEFAULT 0,
                current_version_id INTEGER,
                created_at TEXT NOT NULL,
                UNIQUE(project_code, workflow_code)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER NOT NULL REFERENCES workflows(id),
                version_no INTEGER NOT NULL,
                structure_snapshot TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                change_summary TEXT,
                trigger_source TEXT NOT NULL,
                rollback_from_version_id INTEGER,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(workflow_id, version_no)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_task_bindings (
                task_code INTEGER PRIMARY KEY,
                workflow_id INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runtime_sync_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER,
                project_code INTEGER NOT NULL,
                workflow_code INTEGER NOT NULL,
                status TEXT NOT NULL,
                snapshot_hash TEXT,
                snapshot_json TEXT,
                diff_json TEXT,
                version_id INTEGER,
                error_code TEXT,
                error_message TEXT,
                operator TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sync_records_workflow
            ON runtime_sync_records(workflow_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| SyncError::Storage(anyhow::anyhow!("invalid timestamp '{}': {}", raw, e)))
}

fn version_no(raw: i64) -> Result<u32> {
    u32::try_from(raw).map_err(|_| SyncError::Storage(anyhow::anyhow!("invalid version number {}", raw)))
}

fn binding_from_row(row: &SqliteRow) -> Result<WorkflowBinding> {
    Ok(WorkflowBinding {
        id: row.get("id"),
        project_code: row.get("project_code"),
        workflow_code: row.get("workflow_code"),
        name: row.get("name"),
        current_version_no: version_no(row.get("current_version_no"))?,
        current_version_id: row.get("current_version_id"),
    })
}

fn version_from_row(row: &SqliteRow) -> Result<VersionSnapshot> {
    let trigger: String = row.get("trigger_source");
    let created_at: String = row.get("created_at");
    Ok(VersionSnapshot {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version_no: version_no(row.get("version_no"))?,
        structure_snapshot: row.get("structure_snapshot"),
        content_hash: row.get("content_hash"),
        change_summary: row.get("change_summary"),
        trigger_source: TriggerSource::parse(&trigger)
            .ok_or_else(|| SyncError::Storage(anyhow::anyhow!("unknown trigger source '{}'", trigger)))?,
        rollback_from_version_id: row.get("rollback_from_version_id"),
        created_by: row.get("created_by"),
        created_at: parse_time(&created_at)?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<SyncRecord> {
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    Ok(SyncRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        project_code: row.get("project_code"),
        workflow_code: row.get("workflow_code"),
        status: SyncStatus::parse(&status)
            .ok_or_else(|| SyncError::Storage(anyhow::anyhow!("unknown sync status '{}'", status)))?,
        snapshot_hash: row.get("snapshot_hash"),
        snapshot_json: row.get("snapshot_json"),
        diff_json: row.get("diff_json"),
        version_id: row.get("version_id"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        operator: row.get("operator"),
        created_at: parse_time(&created_at)?,
    })
}

async fn insert_record<'e, E>(executor: E, record: &NewSyncRecord, created_at: &str) -> Result<SyncRecordId>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO runtime_sync_records (
            workflow_id, project_code, workflow_code, status, snapshot_hash, snapshot_json,
            diff_json, version_id, error_code, error_message, operator, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.workflow_id)
    .bind(record.project_code)
    .bind(record.workflow_code)
    .bind(record.status.as_str())
    .bind(&record.snapshot_hash)
    .bind(&record.snapshot_json)
    .bind(&record.diff_json)
    .bind(record.version_id)
    .bind(&record.error_code)
    .bind(&record.error_message)
    .bind(&record.operator)
    .bind(created_at)
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn find_workflow(&self, project_code: i64, workflow_code: i64) -> Result<Option<WorkflowBinding>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE project_code = ? AND workflow_code = ?")
            .bind(project_code)
            .bind(workflow_code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(binding_from_row).transpose()
    }

    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowBinding>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(binding_from_row).transpose()
    }

    async fn ensure_workflow(&self, project_code: i64, workflow_code: i64, name: &str) -> Result<WorkflowBinding> {
        sqlx::query(
            r#"
            INSERT INTO workflows (project_code, workflow_code, name, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(project_code, workflow_code) DO NOTHING
            "#,
        )
        .bind(project_code)
        .bind(workflow_code)
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.find_workflow(project_code, workflow_code)
            .await?
            .ok_or_else(|| SyncError::Storage(anyhow::anyhow!("workflow {} vanished after insert", workflow_code)))
    }

    async fn get_version(&self, version_id: VersionId) -> Result<Option<VersionSnapshot>> {
        let row = sqlx::query(&format!("SELECT {} FROM workflow_versions WHERE id = ?", VERSION_COLUMNS))
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn current_version(&self, workflow_id: WorkflowId) -> Result<Option<VersionSnapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_versions WHERE id = (SELECT current_version_id FROM workflows WHERE id = ?)",
            VERSION_COLUMNS
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn list_versions(&self, workflow_id: WorkflowId) -> Result<Vec<VersionSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_versions WHERE workflow_id = ? ORDER BY version_no ASC",
            VERSION_COLUMNS
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(version_from_row).collect()
    }

    async fn append_version(
        &self,
        version: NewVersion,
        expected_version_no: u32,
        sync_record: Option<NewSyncRecord>,
    ) -> Result<CommitReceipt> {
        let next_no = expected_version_no + 1;
        let created_at = Utc::now();
        let created_at_text = created_at.to_rfc3339();
        let mut tx = self.pool.begin().await?;

        // Claim the next number; zero rows means someone else moved the head
        let claimed = sqlx::query(
            "UPDATE workflows SET current_version_no = ? WHERE id = ? AND current_version_no = ?",
        )
        .bind(i64::from(next_no))
        .bind(version.workflow_id)
        .bind(i64::from(expected_version_no))
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar("SELECT current_version_no FROM workflows WHERE id = ?")
                .bind(version.workflow_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return match actual {
                Some(actual) => Err(SyncError::VersionConflict {
                    workflow_id: version.workflow_id,
                    expected: expected_version_no,
                    actual: version_no(actual)?,
                }),
                None => Err(SyncError::WorkflowNotFound(version.workflow_id)),
            };
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_versions (
                workflow_id, version_no, structure_snapshot, content_hash, change_summary,
                trigger_source, rollback_from_version_id, created_by, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(version.workflow_id)
        .bind(i64::from(next_no))
        .bind(&version.structure_snapshot)
        .bind(&version.content_hash)
        .bind(&version.change_summary)
        .bind(version.trigger_source.as_str())
        .bind(version.rollback_from_version_id)
        .bind(&version.created_by)
        .bind(&created_at_text)
        .execute(&mut *tx)
        .await?;
        let version_id = inserted.last_insert_rowid();

        sqlx::query("UPDATE workflows SET current_version_id = ? WHERE id = ?")
            .bind(version_id)
            .bind(version.workflow_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM workflow_task_bindings WHERE workflow_id = ?")
            .bind(version.workflow_id)
            .execute(&mut *tx)
            .await?;
        for code in &version.task_codes {
            sqlx::query("INSERT OR REPLACE INTO workflow_task_bindings (task_code, workflow_id) VALUES (?, ?)")
                .bind(code)
                .bind(version.workflow_id)
                .execute(&mut *tx)
                .await?;
        }

        let sync_record = match sync_record {
            Some(mut record) => {
                record.version_id = Some(version_id);
                record.workflow_id = Some(version.workflow_id);
                let id = insert_record(&mut *tx, &record, &created_at_text).await?;
                Some((id, record))
            }
            None => None,
        };

        tx.commit().await?;

        let snapshot = VersionSnapshot {
            id: version_id,
            workflow_id: version.workflow_id,
            version_no: next_no,
            structure_snapshot: version.structure_snapshot,
            content_hash: version.content_hash,
            change_summary: version.change_summary,
            trigger_source: version.trigger_source,
            rollback_from_version_id: version.rollback_from_version_id,
            created_by: version.created_by,
            created_at,
        };
        let sync_record = sync_record.map(|(id, record)| SyncRecord {
            id,
            workflow_id: record.workflow_id,
            project_code: record.project_code,
            workflow_code: record.workflow_code,
            status: record.status,
            snapshot_hash: record.snapshot_hash,
            snapshot_json: record.snapshot_json,
            diff_json: record.diff_json,
            version_id: record.version_id,
            error_code: record.error_code,
            error_message: record.error_message,
            operator: record.operator,
            created_at,
        });

        Ok(CommitReceipt {
            version: snapshot,
            sync_record,
        })
    }

    async fn append_sync_record(&self, record: NewSyncRecord) -> Result<SyncRecord> {
        let created_at = Utc::now().to_rfc3339();
        let id = insert_record(&self.pool, &record, &created_at).await?;
        self.get_sync_record(id)
            .await?
            .ok_or_else(|| SyncError::Storage(anyhow::anyhow!("sync record {} vanished after insert", id)))
    }

    async fn list_sync_records(&self, workflow_id: WorkflowId) -> Result<Vec<SyncRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runtime_sync_records WHERE workflow_id = ? ORDER BY id DESC",
            RECORD_COLUMNS
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_sync_record(&self, record_id: SyncRecordId) -> Result<Option<SyncRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM runtime_sync_records WHERE id = ?", RECORD_COLUMNS))
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn task_owners(&self, task_codes: &[TaskCode]) -> Result<BTreeMap<TaskCode, WorkflowId>> {
        let mut owners = BTreeMap::new();
        for code in task_codes {
            let owner: Option<i64> =
                sqlx::query_scalar("SELECT workflow_id FROM workflow_task_bindings WHERE task_code = ?")
                    .bind(code)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(owner) = owner {
                owners.insert(*code, owner);
            }
        }
        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Task, WorkflowDefinition};
    use crate::workflow::version::VersionManager;
    use std::sync::Arc;

    fn definition(sql: &str) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new(1, 100, "orders");
        definition.tasks = vec![Task::sql(11, "load", sql)];
        definition
    }

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_versions_round_trip() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let binding = store.ensure_workflow(1, 100, "orders").await.unwrap();
        assert_eq!(binding.current_version_no, 0);

        let manager = VersionManager::new(store.clone(), 2);
        let v1 = manager
            .commit(binding.id, &definition("select 1"), TriggerSource::Import, Some("import".into()), "alice")
            .await
            .unwrap();
        let v2 = manager
            .commit(binding.id, &definition("select 2"), TriggerSource::Manual, None, "alice")
            .await
            .unwrap();

        assert_eq!((v1.version_no, v2.version_no), (1, 2));
        let current = store.current_version(binding.id).await.unwrap().unwrap();
        assert_eq!(current.id, v2.id);
        assert_eq!(current.definition().unwrap(), definition("select 2").canonical());

        let listed = store.list_versions(binding.id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].trigger_source, TriggerSource::Import);
        assert_eq!(store.task_owners(&[11, 12]).await.unwrap().get(&11), Some(&binding.id));
    }

    #[tokio::test]
    async fn test_conflicting_append_is_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let binding = store.ensure_workflow(1, 100, "orders").await.unwrap();
        let version = NewVersion::from_definition(
            binding.id,
            &definition("select 1"),
            TriggerSource::RuntimeSync,
            None,
            "runtime-sync",
        )
        .unwrap();

        store.append_version(version.clone(), 0, None).await.unwrap();
        let err = store.append_version(version, 0, None).await.unwrap_err();

        assert!(matches!(err, SyncError::VersionConflict { expected: 0, actual: 1, .. }));
        assert_eq!(store.list_versions(binding.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_unknown_workflow() {
        let store = SqliteStore::in_memory().await.unwrap();
        let version = NewVersion::from_definition(9, &definition("select 1"), TriggerSource::Manual, None, "a").unwrap();

        let err = store.append_version(version, 0, None).await.unwrap_err();
        assert!(matches!(err, SyncError::WorkflowNotFound(9)));
    }

    #[tokio::test]
    async fn test_sync_record_written_with_version() {
        let store = SqliteStore::in_memory().await.unwrap();
        let binding = store.ensure_workflow(1, 100, "orders").await.unwrap();
        let version = NewVersion::from_definition(
            binding.id,
            &definition("select 1"),
            TriggerSource::RuntimeSync,
            None,
            "runtime-sync",
        )
        .unwrap();
        let record = NewSyncRecord {
            project_code: 1,
            workflow_code: 100,
            status: SyncStatus::Success,
            snapshot_hash: Some(version.content_hash.clone()),
            operator: "runtime-sync".to_string(),
            ..NewSyncRecord::default()
        };

        let receipt = store.append_version(version, 0, Some(record)).await.unwrap();
        let written = receipt.sync_record.unwrap();
        let stored = store.get_sync_record(written.id).await.unwrap().unwrap();

        assert_eq!(stored.version_id, Some(receipt.version.id));
        assert_eq!(stored.status, SyncStatus::Success);
        assert_eq!(store.list_sync_records(binding.id).await.unwrap().len(), 1);

        let failed = store
            .append_sync_record(NewSyncRecord {
                workflow_id: Some(binding.id),
                project_code: 1,
                workflow_code: 100,
                error_code: Some("SYNC_FAILED".into()),
                operator: "bob".into(),
                ..NewSyncRecord::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(store.list_sync_records(binding.id).await.unwrap()[0].id, failed.id);
    }
}
