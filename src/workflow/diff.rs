/// Structural diff over workflow snapshots
///
/// Compares two workflow definitions section by section: workflow fields, tasks,
/// edges and schedule. Used for version-to-version comparison and for comparing a
/// freshly fetched scheduler definition against the last committed version.
///
/// Both sides are reduced to their canonical form first, so collection order never
/// shows up as a change. A SHA-256 content hash over the canonical JSON short-circuits
/// the field-by-field pass when nothing changed.

use crate::error::{Result, SyncError};
use crate::workflow::types::{Edge, Task, TaskCode, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One differing scalar field, e.g. `task.sql` or `schedule.crontab`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub kind: ChangeKind,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl FieldChange {
    pub fn describe(&self) -> String {
        format!(
            "{}: {} -> {}",
            self.field,
            self.before.as_deref().unwrap_or("null"),
            self.after.as_deref().unwrap_or("null")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskChange {
    pub task_code: TaskCode,
    pub task_name: String,
    /// Per-field changes, only filled for modified tasks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldChange>,
}

impl TaskChange {
    fn of(task: &Task) -> Self {
        Self {
            task_code: task.task_code,
            task_name: task.name.clone(),
            fields: Vec::new(),
        }
    }

    pub fn describe(&self) -> String {
        let label = format!("{}({})", self.task_name, self.task_code);
        if self.fields.is_empty() {
            return label;
        }
        let fields: Vec<&str> = self
            .fields
            .iter()
            .map(|change| change.field.trim_start_matches("task."))
            .collect();
        format!("{}: {}", label, fields.join(", "))
    }
}

/// Partition of a keyed collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDiff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
    pub modified: Vec<T>,
    pub unchanged: Vec<T>,
}

impl<T> Default for CollectionDiff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            modified: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCounts {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    /// Unchanged tasks and edges
    pub unchanged: usize,
}

impl DiffCounts {
    pub fn changes(&self) -> usize {
        self.added + self.removed + self.modified
    }
}

/// Result of comparing a baseline snapshot with a current one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// True iff the content hashes differ
    pub changed: bool,
    pub baseline_hash: Option<String>,
    pub current_hash: String,
    pub workflow_fields: Vec<FieldChange>,
    pub tasks: CollectionDiff<TaskChange>,
    pub edges: CollectionDiff<Edge>,
    pub schedule_fields: Vec<FieldChange>,
    pub counts: DiffCounts,
}

/// Human-readable lines for one change class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSection {
    pub workflow_fields: Vec<String>,
    pub tasks: Vec<String>,
    pub edges: Vec<String>,
    pub schedules: Vec<String>,
}

impl DiffSection {
    pub fn is_empty(&self) -> bool {
        self.workflow_fields.is_empty() && self.tasks.is_empty() && self.edges.is_empty() && self.schedules.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSections {
    pub added: DiffSection,
    pub removed: DiffSection,
    pub modified: DiffSection,
    pub unchanged: DiffSection,
}

impl DiffSummary {
    fn unchanged(current: &WorkflowDefinition, hash: String) -> Self {
        let tasks = CollectionDiff {
            unchanged: current.tasks.iter().map(TaskChange::of).collect(),
            ..CollectionDiff::default()
        };
        let edges = CollectionDiff {
            unchanged: current.edges.clone(),
            ..CollectionDiff::default()
        };
        let counts = DiffCounts {
            unchanged: tasks.unchanged.len() + edges.unchanged.len(),
            ..DiffCounts::default()
        };
        Self {
            changed: false,
            baseline_hash: Some(hash.clone()),
            current_hash: hash,
            workflow_fields: Vec::new(),
            tasks,
            edges,
            schedule_fields: Vec::new(),
            counts,
        }
    }

    /// Group every change into added/removed/modified/unchanged sections
    pub fn sections(&self) -> DiffSections {
        let mut sections = DiffSections::default();

        for change in &self.workflow_fields {
            section_for(&mut sections, change.kind).workflow_fields.push(change.describe());
        }
        for change in &self.schedule_fields {
            section_for(&mut sections, change.kind).schedules.push(change.describe());
        }

        sections.added.tasks = self.tasks.added.iter().map(TaskChange::describe).collect();
        sections.removed.tasks = self.tasks.removed.iter().map(TaskChange::describe).collect();
        sections.modified.tasks = self.tasks.modified.iter().map(TaskChange::describe).collect();
        sections.unchanged.tasks = self.tasks.unchanged.iter().map(TaskChange::describe).collect();

        sections.added.edges = self.edges.added.iter().map(Edge::key).collect();
        sections.removed.edges = self.edges.removed.iter().map(Edge::key).collect();
        sections.unchanged.edges = self.edges.unchanged.iter().map(Edge::key).collect();

        sections
    }

    /// One-line change summary stored alongside versions
    pub fn describe(&self) -> String {
        if !self.changed {
            return "no structural change".to_string();
        }
        format!(
            "{} added, {} removed, {} modified",
            self.counts.added, self.counts.removed, self.counts.modified
        )
    }
}

fn section_for(sections: &mut DiffSections, kind: ChangeKind) -> &mut DiffSection {
    match kind {
        ChangeKind::Added => &mut sections.added,
        ChangeKind::Removed => &mut sections.removed,
        ChangeKind::Modified => &mut sections.modified,
    }
}

pub struct StructuralDiffEngine;

impl StructuralDiffEngine {
    /// Order-independent content hash, hex-encoded SHA-256 of the canonical JSON
    pub fn content_hash(definition: &WorkflowDefinition) -> Result<String> {
        hash_canonical(&definition.canonical())
    }

    /// Canonical JSON stored as the version snapshot
    pub fn snapshot_json(definition: &WorkflowDefinition) -> Result<String> {
        serde_json::to_string(&definition.canonical()).map_err(SyncError::internal)
    }

    /// Pretty canonical JSON for line diffs; empty for a missing side
    pub fn pretty_snapshot(definition: Option<&WorkflowDefinition>) -> Result<String> {
        match definition {
            Some(definition) => serde_json::to_string_pretty(&definition.canonical()).map_err(SyncError::internal),
            None => Ok(String::new()),
        }
    }

    /// Diff `current` against `baseline`; a missing baseline makes everything added
    pub fn diff(baseline: Option<&WorkflowDefinition>, current: &WorkflowDefinition) -> Result<DiffSummary> {
        let current = current.canonical();
        let current_hash = hash_canonical(&current)?;
        let baseline = baseline.map(WorkflowDefinition::canonical);
        let baseline_hash = baseline.as_ref().map(hash_canonical).transpose()?;

        if baseline_hash.as_deref() == Some(current_hash.as_str()) {
            return Ok(DiffSummary::unchanged(&current, current_hash));
        }

        let workflow_fields = field_changes(
            "workflow",
            baseline.as_ref().map(WorkflowDefinition::diff_fields),
            Some(current.diff_fields()),
        );
        let schedule_fields = field_changes(
            "schedule",
            baseline.as_ref().and_then(|b| b.schedule.as_ref()).map(|s| s.diff_fields()),
            current.schedule.as_ref().map(|s| s.diff_fields()),
        );

        let before_tasks: &[Task] = baseline.as_ref().map(|b| b.tasks.as_slice()).unwrap_or(&[]);
        let tasks = diff_tasks(before_tasks, &current.tasks);

        let before_edges: BTreeSet<Edge> = baseline
            .as_ref()
            .map(|b| b.edges.iter().copied().collect())
            .unwrap_or_default();
        let after_edges: BTreeSet<Edge> = current.edges.iter().copied().collect();
        let edges = CollectionDiff {
            added: after_edges.difference(&before_edges).copied().collect(),
            removed: before_edges.difference(&after_edges).copied().collect(),
            modified: Vec::new(),
            unchanged: after_edges.intersection(&before_edges).copied().collect(),
        };

        let count = |kind: ChangeKind| {
            workflow_fields
                .iter()
                .chain(schedule_fields.iter())
                .filter(|change| change.kind == kind)
                .count()
        };
        let counts = DiffCounts {
            added: count(ChangeKind::Added) + tasks.added.len() + edges.added.len(),
            removed: count(ChangeKind::Removed) + tasks.removed.len() + edges.removed.len(),
            modified: count(ChangeKind::Modified) + tasks.modified.len(),
            unchanged: tasks.unchanged.len() + edges.unchanged.len(),
        };

        Ok(DiffSummary {
            changed: true,
            baseline_hash,
            current_hash,
            workflow_fields,
            tasks,
            edges,
            schedule_fields,
            counts,
        })
    }
}

fn hash_canonical(canonical: &WorkflowDefinition) -> Result<String> {
    let bytes = serde_json::to_vec(canonical).map_err(SyncError::internal)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

type Fields = Vec<(&'static str, Option<String>)>;

fn field_changes(prefix: &str, before: Option<Fields>, after: Option<Fields>) -> Vec<FieldChange> {
    let before: BTreeMap<&str, Option<String>> = before.unwrap_or_default().into_iter().collect();
    let after: BTreeMap<&str, Option<String>> = after.unwrap_or_default().into_iter().collect();
    let keys: BTreeSet<&str> = before.keys().chain(after.keys()).copied().collect();

    keys.into_iter()
        .filter_map(|key| {
            let old = before.get(key).cloned().flatten();
            let new = after.get(key).cloned().flatten();
            let kind = match (&old, &new) {
                (None, None) => return None,
                (None, Some(_)) => ChangeKind::Added,
                (Some(_), None) => ChangeKind::Removed,
                (Some(a), Some(b)) if a == b => return None,
                _ => ChangeKind::Modified,
            };
            Some(FieldChange {
                field: format!("{}.{}", prefix, key),
                kind,
                before: old,
                after: new,
            })
        })
        .collect()
}

fn diff_tasks(before: &[Task], after: &[Task]) -> CollectionDiff<TaskChange> {
    let before: BTreeMap<TaskCode, &Task> = before.iter().map(|t| (t.task_code, t)).collect();
    let after: BTreeMap<TaskCode, &Task> = after.iter().map(|t| (t.task_code, t)).collect();
    let codes: BTreeSet<TaskCode> = before.keys().chain(after.keys()).copied().collect();

    let mut diff = CollectionDiff::default();
    for code in codes {
        match (before.get(&code), after.get(&code)) {
            (None, Some(task)) => diff.added.push(TaskChange::of(task)),
            (Some(task), None) => diff.removed.push(TaskChange::of(task)),
            (Some(old), Some(new)) => {
                let fields = field_changes("task", Some(old.diff_fields()), Some(new.diff_fields()));
                let mut change = TaskChange::of(new);
                if fields.is_empty() {
                    diff.unchanged.push(change);
                } else {
                    change.fields = fields;
                    diff.modified.push(change);
                }
            }
            (None, None) => {}
        }
    }
    diff
}

/// Unified line diff between two texts
///
/// Longest-common-subsequence over lines; output starts with `--- left`,
/// `+++ right` and a single `@@ JSON Snapshot @@` hunk header.
pub fn unified_diff(left_label: &str, left: &str, right_label: &str, right: &str) -> String {
    let a: Vec<&str> = left.lines().collect();
    let b: Vec<&str> = right.lines().collect();

    // lcs[i][j] = LCS length of a[i..] and b[j..]
    let mut lcs = vec![vec![0u32; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut out = vec![
        format!("--- {}", left_label),
        format!("+++ {}", right_label),
        "@@ JSON Snapshot @@".to_string(),
    ];
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            out.push(format!(" {}", a[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(format!("-{}", a[i]));
            i += 1;
        } else {
            out.push(format!("+{}", b[j]));
            j += 1;
        }
    }
    out.extend(a[i..].iter().map(|line| format!("-{}", line)));
    out.extend(b[j..].iter().map(|line| format!("+{}", line)));

    out.join("\n")
}
