/// Declared vs. inferred edge reconciliation
///
/// Compares the dependencies a workflow states explicitly with the ones its SQL
/// lineage implies. Entry/exit marker edges only carry topology hints and are left
/// out of the comparison. Any disagreement must be confirmed by a person; nothing
/// here ever picks a side.

use crate::runtime::types::SyncIssue;
use crate::workflow::types::{Edge, WorkflowDefinition};
use serde::Serialize;
use std::collections::BTreeSet;

pub const EDGE_MISMATCH: &str = "EDGE_MISMATCH";
pub const EXPLICIT_EDGE_MISSING: &str = "EXPLICIT_EDGE_MISSING";

/// Declared and inferred edge sets with their overlap and differences
///
/// Every list holds `upstream->downstream` keys in edge order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationCompareDetail {
    pub declared: Vec<String>,
    pub inferred: Vec<String>,
    pub common: Vec<String>,
    pub only_in_declared: Vec<String>,
    pub only_in_inferred: Vec<String>,
}

impl RelationCompareDetail {
    pub fn has_mismatch(&self) -> bool {
        !self.only_in_declared.is_empty() || !self.only_in_inferred.is_empty()
    }
}

/// Mismatch report shown to the person confirming a sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeMismatchDetail {
    pub explicit_edges: Vec<String>,
    pub inferred_edges: Vec<String>,
    pub only_in_explicit: Vec<String>,
    pub only_in_inferred: Vec<String>,
    /// `name(code) -> name(code) [up->down]` for each edge only in the explicit set
    pub only_in_explicit_display: Vec<String>,
    pub only_in_inferred_display: Vec<String>,
}

/// Outcome of reconciling one definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeReconciliation {
    pub relation: RelationCompareDetail,
    pub mismatch: Option<EdgeMismatchDetail>,
    pub requires_confirmation: bool,
    pub issues: Vec<SyncIssue>,
}

pub struct EdgeReconciler;

impl EdgeReconciler {
    /// Set comparison over non-marker edges
    pub fn compare(declared: &BTreeSet<Edge>, inferred: &BTreeSet<Edge>) -> RelationCompareDetail {
        let declared = without_markers(declared);
        let inferred = without_markers(inferred);

        RelationCompareDetail {
            declared: keys(declared.iter()),
            inferred: keys(inferred.iter()),
            common: keys(declared.intersection(&inferred)),
            only_in_declared: keys(declared.difference(&inferred)),
            only_in_inferred: keys(inferred.difference(&declared)),
        }
    }

    /// Reconcile a definition's explicit edges with lineage-inferred ones
    ///
    /// A workflow with no explicit dependencies but inferred ones is an error: the
    /// scheduler would run its tasks without any ordering. Other mismatches are
    /// warnings that require confirmation.
    pub fn reconcile(definition: &WorkflowDefinition, inferred: &BTreeSet<Edge>) -> EdgeReconciliation {
        let explicit = definition.dependency_edges();
        let relation = Self::compare(&explicit, inferred);
        let mut issues = Vec::new();

        if !relation.has_mismatch() {
            return EdgeReconciliation {
                relation,
                mismatch: None,
                requires_confirmation: false,
                issues,
            };
        }

        let explicit = without_markers(&explicit);
        let inferred = without_markers(inferred);
        let mismatch = EdgeMismatchDetail {
            explicit_edges: relation.declared.clone(),
            inferred_edges: relation.inferred.clone(),
            only_in_explicit: relation.only_in_declared.clone(),
            only_in_inferred: relation.only_in_inferred.clone(),
            only_in_explicit_display: describe(definition, explicit.difference(&inferred)),
            only_in_inferred_display: describe(definition, inferred.difference(&explicit)),
        };

        if relation.declared.is_empty() {
            issues.push(
                SyncIssue::error(
                    EXPLICIT_EDGE_MISSING,
                    format!(
                        "workflow declares no dependencies but lineage implies {}",
                        relation.inferred.len()
                    ),
                )
                .with_workflow(definition),
            );
        } else {
            issues.push(
                SyncIssue::warning(
                    EDGE_MISMATCH,
                    format!(
                        "declared and inferred dependencies differ: {} only declared, {} only inferred",
                        relation.only_in_declared.len(),
                        relation.only_in_inferred.len()
                    ),
                )
                .with_workflow(definition),
            );
        }

        tracing::info!(
            "Edge mismatch in workflow {}: only declared {:?}, only inferred {:?}",
            definition.workflow_code,
            relation.only_in_declared,
            relation.only_in_inferred
        );

        EdgeReconciliation {
            relation,
            mismatch: Some(mismatch),
            requires_confirmation: true,
            issues,
        }
    }
}

fn without_markers(edges: &BTreeSet<Edge>) -> BTreeSet<Edge> {
    edges.iter().filter(|edge| !edge.is_sentinel()).copied().collect()
}

fn describe<'a>(definition: &WorkflowDefinition, edges: impl Iterator<Item = &'a Edge>) -> Vec<String> {
    edges
        .map(|edge| {
            format!(
                "{} -> {} [{}]",
                definition.task_label(edge.upstream),
                definition.task_label(edge.downstream),
                edge.key()
            )
        })
        .collect()
}

fn keys<'a>(edges: impl Iterator<Item = &'a Edge>) -> Vec<String> {
    edges.map(Edge::key).collect()
}
