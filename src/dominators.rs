//! Post-dominance and control dependence over the call structure
//!
//! Post-dominators come from running the Cooper/Harvey/Kennedy dominator
//! algorithm (petgraph's `simple_fast`) on the reversed Calls projection
//! from an exit entry point. Control dependence then follows the classic
//! formulation: a node is control-dependent on `m` when it lies on a path
//! from one of `m`'s successors up the post-dominator tree that stops just
//! short of `ipdom(m)`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::dominators::simple_fast;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::GraphError;
use crate::graph::Graph;
use crate::types::RelationType;

/// Immediate post-dominator tree for a call graph, rooted at `entry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DominatorTree {
    pub entry: String,
    /// Node -> its immediate post-dominator. The entry has no entry here.
    pub immediate_dom: HashMap<String, String>,
}

/// Control-dependence relation plus aggregate statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlDependence {
    /// Controlled node -> its controllers.
    pub dependencies: HashMap<String, Vec<String>>,
    /// Controller -> the nodes it controls.
    pub dependents: HashMap<String, Vec<String>>,
    pub stats: ControlDependenceStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlDependenceStats {
    /// Total (controller, controlled) pairs.
    pub edge_count: usize,
    /// Largest controller set over any controlled node.
    pub max_fan_in: usize,
    /// Largest controlled set over any controller.
    pub max_fan_out: usize,
    pub nodes_with_dependencies: usize,
    pub nodes_with_dependents: usize,
}

/// Compute the immediate post-dominator tree of the Calls subgraph, rooted
/// at `entry` (typically the program's exit or a synthetic sink).
#[instrument(skip(graph))]
pub fn post_dominators(graph: &Arc<Graph>, entry: &str) -> Result<DominatorTree, GraphError> {
    if graph.get_node(entry).is_none() {
        return Err(GraphError::NodeNotFound(entry.to_string()));
    }

    // Reversed Calls projection: post-dominance is dominance on the
    // edge-reversed graph.
    let mut projection = DiGraph::<(), ()>::new();
    let mut ids: Vec<String> = Vec::with_capacity(graph.node_count());
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
    for node in graph.nodes() {
        let idx = projection.add_node(());
        ids.push(node.id.clone());
        index_of.insert(node.id.as_str(), idx);
    }
    for node in graph.nodes() {
        for edge in node.outgoing() {
            if edge.relation_type == RelationType::Calls {
                projection.add_edge(
                    index_of[edge.to_id.as_str()],
                    index_of[edge.from_id.as_str()],
                    (),
                );
            }
        }
    }

    let dominators = simple_fast(&projection, index_of[entry]);
    let mut immediate_dom = HashMap::new();
    for (idx, id) in ids.iter().enumerate() {
        if id == entry {
            continue;
        }
        if let Some(idom) = dominators.immediate_dominator(NodeIndex::new(idx)) {
            immediate_dom.insert(id.clone(), ids[idom.index()].clone());
        }
        // Nodes that cannot reach the entry have no post-dominator and are
        // left out of the map.
    }

    Ok(DominatorTree {
        entry: entry.to_string(),
        immediate_dom,
    })
}

/// Compute control dependence from a post-dominator tree: for every branch
/// node `m` (two or more outgoing Calls edges), walk the tree upward from
/// each successor until `ipdom(m)`; every node passed on the way is
/// control-dependent on `m`. The walk is capped at `len(immediate_dom) + 1`
/// steps as a safety bound against a malformed tree.
#[instrument(skip(graph, dom_tree, token))]
pub async fn control_dependence(
    graph: &Arc<Graph>,
    dom_tree: &DominatorTree,
    token: &CancellationToken,
    cancel_check_stride: usize,
) -> Result<ControlDependence, GraphError> {
    let stride = cancel_check_stride.max(1);
    let chain_cap = dom_tree.immediate_dom.len() + 1;

    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    let mut recorded: HashSet<(String, String)> = HashSet::new();
    let mut walked = 0usize;

    for node in graph.nodes() {
        let successors: Vec<&str> = node
            .outgoing()
            .iter()
            .filter(|edge| edge.relation_type == RelationType::Calls)
            .map(|edge| edge.to_id.as_str())
            .collect();
        if successors.len() < 2 {
            continue;
        }
        let ipdom_m = dom_tree.immediate_dom.get(&node.id);

        for successor in successors {
            let mut runner = successor.to_string();
            let mut steps = 0usize;
            loop {
                walked += 1;
                if walked % stride == 0 && token.is_cancelled() {
                    return Err(GraphError::BuildCancelled);
                }
                if Some(&runner) == ipdom_m || runner == node.id {
                    break;
                }
                steps += 1;
                if steps > chain_cap {
                    break;
                }
                if recorded.insert((node.id.clone(), runner.clone())) {
                    dependencies
                        .entry(runner.clone())
                        .or_default()
                        .push(node.id.clone());
                    dependents
                        .entry(node.id.clone())
                        .or_default()
                        .push(runner.clone());
                }
                match dom_tree.immediate_dom.get(&runner) {
                    Some(next) => runner = next.clone(),
                    None => break,
                }
            }
        }
    }

    let stats = ControlDependenceStats {
        edge_count: recorded.len(),
        max_fan_in: dependencies.values().map(Vec::len).max().unwrap_or(0),
        max_fan_out: dependents.values().map(Vec::len).max().unwrap_or(0),
        nodes_with_dependencies: dependencies.len(),
        nodes_with_dependents: dependents.len(),
    };

    Ok(ControlDependence {
        dependencies,
        dependents,
        stats,
    })
}
