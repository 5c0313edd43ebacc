/// Workflow topology analysis
///
/// Folds a task set and its dependency edges into upstream/downstream adjacency
/// and entry/exit sets. The graph must be acyclic; a cycle is reported as an error
/// and no result is produced.

use crate::error::{Result, SyncError};
use crate::workflow::types::{Edge, TaskCode, WorkflowDefinition, ENTRY_SENTINEL};
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{depth_first_search, Control, DfsEvent};
use petgraph::Direction;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Derived topology of one workflow
///
/// Maps only hold tasks that have neighbors; a missing key means none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyResult {
    pub upstream_map: BTreeMap<TaskCode, BTreeSet<TaskCode>>,
    pub downstream_map: BTreeMap<TaskCode, BTreeSet<TaskCode>>,
    pub entry_task_ids: BTreeSet<TaskCode>,
    pub exit_task_ids: BTreeSet<TaskCode>,
}

impl TopologyResult {
    pub fn upstream_of(&self, task_code: TaskCode) -> impl Iterator<Item = TaskCode> + '_ {
        self.upstream_map.get(&task_code).into_iter().flatten().copied()
    }

    pub fn downstream_of(&self, task_code: TaskCode) -> impl Iterator<Item = TaskCode> + '_ {
        self.downstream_map.get(&task_code).into_iter().flatten().copied()
    }
}

pub struct TopologyAnalyzer;

impl TopologyAnalyzer {
    pub fn analyze_definition(definition: &WorkflowDefinition) -> Result<TopologyResult> {
        Self::analyze(&definition.task_codes(), &definition.edges)
    }

    /// Compute adjacency and entry/exit sets
    ///
    /// A task is an entry when it has no upstream neighbor or is the target of an
    /// entry edge; exits are symmetric. Edges naming unknown tasks and cycles are
    /// rejected.
    pub fn analyze(task_codes: &BTreeSet<TaskCode>, edges: &[Edge]) -> Result<TopologyResult> {
        let mut graph: DiGraphMap<TaskCode, ()> = DiGraphMap::with_capacity(task_codes.len(), edges.len());
        for &code in task_codes {
            graph.add_node(code);
        }

        let mut marked_entries = BTreeSet::new();
        let mut marked_exits = BTreeSet::new();

        for edge in edges {
            let known = |code: TaskCode| code == ENTRY_SENTINEL || task_codes.contains(&code);
            let both_sentinel = edge.upstream == ENTRY_SENTINEL && edge.downstream == ENTRY_SENTINEL;
            if both_sentinel || !known(edge.upstream) || !known(edge.downstream) {
                return Err(SyncError::UnknownTask {
                    upstream: edge.upstream,
                    downstream: edge.downstream,
                });
            }

            if edge.upstream == ENTRY_SENTINEL {
                marked_entries.insert(edge.downstream);
            } else if edge.downstream == ENTRY_SENTINEL {
                marked_exits.insert(edge.upstream);
            } else {
                graph.add_edge(edge.upstream, edge.downstream, ());
            }
        }

        // A back edge in DFS means we reached a node still on the stack
        let back_edge = depth_first_search(&graph, graph.nodes(), |event| match event {
            DfsEvent::BackEdge(upstream, downstream) => Control::Break((upstream, downstream)),
            _ => Control::Continue,
        });
        if let Some((upstream, downstream)) = back_edge.break_value() {
            return Err(SyncError::GraphCycle { upstream, downstream });
        }

        let mut result = TopologyResult::default();
        for &code in task_codes {
            let upstream: BTreeSet<TaskCode> = graph.neighbors_directed(code, Direction::Incoming).collect();
            let downstream: BTreeSet<TaskCode> = graph.neighbors_directed(code, Direction::Outgoing).collect();

            if upstream.is_empty() || marked_entries.contains(&code) {
                result.entry_task_ids.insert(code);
            }
            if downstream.is_empty() || marked_exits.contains(&code) {
                result.exit_task_ids.insert(code);
            }
            if !upstream.is_empty() {
                result.upstream_map.insert(code, upstream);
            }
            if !downstream.is_empty() {
                result.downstream_map.insert(code, downstream);
            }
        }

        tracing::debug!(
            "Topology: {} tasks, {} entries, {} exits",
            task_codes.len(),
            result.entry_task_ids.len(),
            result.exit_task_ids.len()
        );

        Ok(result)
    }
}
