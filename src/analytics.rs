//! Read-only analytics over a frozen graph
//!
//! Hotspots, dead code, SCC cycles, PageRank, and package communities.
//! Everything here is safe for concurrent readers; the long computations
//! honor cancellation at a configurable stride so a slow PageRank run never
//! outlives an abandoned request.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::errors::GraphError;
use crate::graph::Graph;

/// PageRank damping factor.
const PAGE_RANK_DAMPING: f64 = 0.85;
/// PageRank iteration cap.
const PAGE_RANK_MAX_ITERATIONS: usize = 20;
/// PageRank convergence threshold on the max per-node delta.
const PAGE_RANK_EPSILON: f64 = 1e-6;
/// Default cancellation-check stride in long inner loops.
pub const DEFAULT_CANCEL_CHECK_STRIDE: usize = 1024;

/// A node ranked by combined degree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotSpot {
    pub node_id: String,
    pub in_degree: usize,
    pub out_degree: usize,
}

impl HotSpot {
    pub fn score(&self) -> usize {
        self.in_degree + self.out_degree
    }
}

/// A package-level grouping with a crude modularity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub package: String,
    pub node_ids: Vec<String>,
    /// Placeholder heuristic: `size / (total + 1)`.
    pub modularity: f64,
}

/// Read-only analytics over a stable graph snapshot.
pub struct GraphAnalytics {
    graph: Arc<Graph>,
    cancel_check_stride: usize,
}

impl GraphAnalytics {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self {
            graph,
            cancel_check_stride: DEFAULT_CANCEL_CHECK_STRIDE,
        }
    }

    pub fn with_cancel_check_stride(mut self, stride: usize) -> Self {
        self.cancel_check_stride = stride.max(1);
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Top-`k` nodes by combined in/out degree. Ties keep insertion order.
    #[instrument(skip(self))]
    pub fn hot_spots(&self, k: usize) -> Vec<HotSpot> {
        let mut spots: Vec<HotSpot> = self
            .graph
            .nodes()
            .map(|node| HotSpot {
                node_id: node.id.clone(),
                in_degree: node.incoming().len(),
                out_degree: node.outgoing().len(),
            })
            .collect();
        // Stable sort: equal scores stay in graph insertion order.
        spots.sort_by(|a, b| b.score().cmp(&a.score()));
        spots.truncate(k);
        spots
    }

    /// Nodes with no incoming edges of any type, in insertion order.
    #[instrument(skip(self))]
    pub fn dead_code(&self) -> Vec<String> {
        self.graph
            .nodes()
            .filter(|node| node.incoming().is_empty())
            .map(|node| node.id.clone())
            .collect()
    }

    /// Strongly connected components with more than one node, each as a
    /// list of node IDs.
    #[instrument(skip(self))]
    pub fn cyclic_dependencies(&self) -> Vec<Vec<String>> {
        let (projection, ids) = self.project();
        tarjan_scc(&projection)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                component
                    .into_iter()
                    .map(|idx| ids[idx.index()].clone())
                    .collect()
            })
            .collect()
    }

    /// PageRank over all edges: damping 0.85, up to 20 iterations or until
    /// the max per-node delta drops below 1e-6. Dangling nodes redistribute
    /// their damped mass across all nodes. Checks cancellation once per
    /// iteration and every `cancel_check_stride` nodes inside one.
    #[instrument(skip(self, token))]
    pub async fn page_rank(
        &self,
        token: &CancellationToken,
    ) -> Result<HashMap<String, f64>, GraphError> {
        let n = self.graph.node_count();
        if n == 0 {
            return Ok(HashMap::new());
        }

        let ids: Vec<String> = self.graph.nodes().map(|node| node.id.clone()).collect();
        let index_of: HashMap<&str, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        // Incoming adjacency and out-degrees over all edge types.
        let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut out_degree: Vec<usize> = vec![0; n];
        for node in self.graph.nodes() {
            let from = index_of[node.id.as_str()];
            out_degree[from] = node.outgoing().len();
            for edge in node.outgoing() {
                let to = index_of[edge.to_id.as_str()];
                incoming[to].push(from);
            }
        }

        let uniform = 1.0 / n as f64;
        let mut scores = vec![uniform; n];
        let mut next = vec![0.0f64; n];

        for iteration in 0..PAGE_RANK_MAX_ITERATIONS {
            if token.is_cancelled() {
                return Err(GraphError::BuildCancelled);
            }

            let dangling_mass: f64 = (0..n)
                .filter(|&i| out_degree[i] == 0)
                .map(|i| scores[i])
                .sum();

            let mut max_delta = 0.0f64;
            for (i, slot) in next.iter_mut().enumerate() {
                if i % self.cancel_check_stride == 0 && token.is_cancelled() {
                    return Err(GraphError::BuildCancelled);
                }
                let inbound: f64 = incoming[i]
                    .iter()
                    .map(|&j| scores[j] / out_degree[j] as f64)
                    .sum();
                let score =
                    (1.0 - PAGE_RANK_DAMPING) * uniform
                        + PAGE_RANK_DAMPING * (inbound + dangling_mass * uniform);
                max_delta = max_delta.max((score - scores[i]).abs());
                *slot = score;
            }
            std::mem::swap(&mut scores, &mut next);

            if max_delta < PAGE_RANK_EPSILON {
                debug!(iteration, max_delta, "page rank converged");
                break;
            }
        }

        Ok(ids.into_iter().zip(scores).collect())
    }

    /// Package communities: nodes grouped by parent directory with the
    /// `size / (total + 1)` heuristic as a stand-in modularity score.
    #[instrument(skip(self))]
    pub fn communities(&self) -> Vec<Community> {
        let total = self.graph.node_count();
        let mut packages: std::collections::BTreeMap<String, Vec<String>> =
            std::collections::BTreeMap::new();
        for node in self.graph.nodes() {
            let package = match node.symbol.file_path.rsplit_once('/') {
                Some((dir, _)) if !dir.is_empty() => dir.to_string(),
                _ => ".".to_string(),
            };
            packages.entry(package).or_default().push(node.id.clone());
        }
        packages
            .into_iter()
            .map(|(package, node_ids)| {
                let modularity = node_ids.len() as f64 / (total as f64 + 1.0);
                Community {
                    package,
                    node_ids,
                    modularity,
                }
            })
            .collect()
    }

    /// Project the graph into petgraph for the algorithms that want it.
    fn project(&self) -> (DiGraph<(), ()>, Vec<String>) {
        let mut projection = DiGraph::<(), ()>::new();
        let mut ids = Vec::with_capacity(self.graph.node_count());
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        for node in self.graph.nodes() {
            let idx = projection.add_node(());
            ids.push(node.id.clone());
            index_of.insert(node.id.as_str(), idx);
        }
        for edge in &self.graph.edges() {
            projection.add_edge(index_of[edge.from_id.as_str()], index_of[edge.to_id.as_str()], ());
        }
        (projection, ids)
    }
}
