//! Insertion-ordered, secondary-indexed code-relationship graph
//!
//! The graph is a directed, typed multigraph whose nodes mirror parsed
//! symbols and whose edges are semantic relationships (calls, imports,
//! implements, ...). It is built incrementally by a single writer, then
//! frozen; after the freeze every accessor is safe for concurrent readers
//! and hands out defensive copies.
//!
//! Edge instances are shared: the same `Arc<Edge>` appears in the source
//! node's outgoing list, the target node's incoming list, the master edge
//! list, and both edge indices. Identity checks use `Arc::ptr_eq`.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::errors::GraphError;
use crate::types::{now_millis, Location, ParseResult, RelationType, Symbol, SymbolKind};

/// Default node capacity for a single graph.
pub const DEFAULT_MAX_NODES: usize = 1_000_000;
/// Default edge capacity for a single graph.
pub const DEFAULT_MAX_EDGES: usize = 10_000_000;

/// Fixed seed for the structural hash so digests are reproducible across
/// process restarts, unlike the platform's randomized hasher.
const STRUCTURAL_HASH_SEED: u64 = 0x7265_6c67_7261_7068;

/// Lifecycle state of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphState {
    /// Mutable, single-writer construction phase.
    Building,
    /// Frozen; primary data and indices are immutable.
    ReadOnly,
}

/// Capacity options applied at construction.
#[derive(Debug, Clone, Copy)]
pub struct GraphOptions {
    pub max_nodes: usize,
    pub max_edges: usize,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
            max_edges: DEFAULT_MAX_EDGES,
        }
    }
}

impl GraphOptions {
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_max_edges(mut self, max_edges: usize) -> Self {
        self.max_edges = max_edges;
        self
    }
}

/// A typed directed relationship between two nodes, carrying the source
/// location where the relationship is expressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from_id: String,
    pub to_id: String,
    pub relation_type: RelationType,
    pub location: Location,
}

/// A graph vertex corresponding to exactly one symbol.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub symbol: Arc<Symbol>,
    outgoing: Vec<Arc<Edge>>,
    incoming: Vec<Arc<Edge>>,
}

impl Node {
    fn new(symbol: Arc<Symbol>) -> Self {
        Self {
            id: symbol.id.clone(),
            symbol,
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }

    /// Outgoing edges in insertion order.
    pub fn outgoing(&self) -> &[Arc<Edge>] {
        &self.outgoing
    }

    /// Incoming edges in insertion order.
    pub fn incoming(&self) -> &[Arc<Edge>] {
        &self.incoming
    }

    /// Combined in- and out-degree, used by hot-spot analytics.
    pub fn degree(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }
}

/// The code-relationship graph store.
pub struct Graph {
    project_root: String,
    nodes: IndexMap<String, Node>,
    /// Master edge list in insertion order.
    edges: Vec<Arc<Edge>>,
    state: GraphState,
    /// Unix milliseconds UTC, 0 until freeze.
    built_at_millis: i64,
    max_nodes: usize,
    max_edges: usize,

    // Secondary indices. Node indices store IDs so the primary arena stays
    // the single owner; per-key order is insertion order.
    nodes_by_file: HashMap<String, Vec<String>>,
    nodes_by_name: HashMap<String, Vec<String>>,
    nodes_by_kind: HashMap<SymbolKind, Vec<String>>,
    edges_by_type: HashMap<RelationType, Vec<Arc<Edge>>>,
    /// Keyed on the edge's expression site, not on either endpoint's file.
    edges_by_file: HashMap<String, Vec<Arc<Edge>>>,
}

impl Graph {
    /// Create an empty graph in `Building` state with default capacities.
    pub fn new(project_root: impl Into<String>) -> Self {
        Self::with_options(project_root, GraphOptions::default())
    }

    /// Create an empty graph with explicit capacity options.
    pub fn with_options(project_root: impl Into<String>, options: GraphOptions) -> Self {
        Self {
            project_root: project_root.into(),
            nodes: IndexMap::new(),
            edges: Vec::new(),
            state: GraphState::Building,
            built_at_millis: 0,
            max_nodes: options.max_nodes.max(1),
            max_edges: options.max_edges.max(1),
            nodes_by_file: HashMap::new(),
            nodes_by_name: HashMap::new(),
            nodes_by_kind: HashMap::new(),
            edges_by_type: HashMap::new(),
            edges_by_file: HashMap::new(),
        }
    }

    pub fn project_root(&self) -> &str {
        &self.project_root
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    /// Freeze timestamp in Unix milliseconds UTC; 0 while still building.
    pub fn built_at_millis(&self) -> i64 {
        self.built_at_millis
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn max_edges(&self) -> usize {
        self.max_edges
    }

    /// Add a node for `symbol`. The symbol ID must be unique in the graph.
    ///
    /// A symbol with an empty ID is rejected as invalid; an empty name is
    /// legal but is not entered into the name index.
    pub fn add_node(&mut self, symbol: Arc<Symbol>) -> Result<&Node, GraphError> {
        if self.state == GraphState::ReadOnly {
            return Err(GraphError::GraphFrozen);
        }
        if symbol.id.is_empty() {
            return Err(GraphError::InvalidNode);
        }
        if self.nodes.contains_key(&symbol.id) {
            return Err(GraphError::DuplicateNode(symbol.id.clone()));
        }
        if self.nodes.len() >= self.max_nodes {
            return Err(GraphError::MaxNodesExceeded(self.max_nodes));
        }

        let id = symbol.id.clone();
        self.nodes_by_file
            .entry(symbol.file_path.clone())
            .or_default()
            .push(id.clone());
        if !symbol.name.is_empty() {
            self.nodes_by_name
                .entry(symbol.name.clone())
                .or_default()
                .push(id.clone());
        }
        self.nodes_by_kind
            .entry(symbol.kind)
            .or_default()
            .push(id.clone());

        let node = Node::new(symbol);
        self.nodes.insert(id.clone(), node);
        Ok(&self.nodes[&id])
    }

    /// Add an edge between two existing nodes. Duplicate (from, to, type)
    /// edges with distinct locations are allowed; they model multiple call
    /// sites of the same relationship.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        relation_type: RelationType,
        location: Location,
    ) -> Result<Arc<Edge>, GraphError> {
        if self.state == GraphState::ReadOnly {
            return Err(GraphError::GraphFrozen);
        }
        if !self.nodes.contains_key(from) {
            return Err(GraphError::NodeNotFound(from.to_string()));
        }
        if !self.nodes.contains_key(to) {
            return Err(GraphError::NodeNotFound(to.to_string()));
        }
        if self.edges.len() >= self.max_edges {
            return Err(GraphError::MaxEdgesExceeded(self.max_edges));
        }

        let edge = Arc::new(Edge {
            from_id: from.to_string(),
            to_id: to.to_string(),
            relation_type,
            location: location.clone(),
        });

        self.nodes[from].outgoing.push(Arc::clone(&edge));
        self.nodes[to].incoming.push(Arc::clone(&edge));
        self.edges.push(Arc::clone(&edge));
        self.edges_by_type
            .entry(relation_type)
            .or_default()
            .push(Arc::clone(&edge));
        self.edges_by_file
            .entry(location.file_path)
            .or_default()
            .push(Arc::clone(&edge));

        Ok(edge)
    }

    /// O(1) node lookup.
    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes defined in `file_path`, in insertion order. Fresh container.
    pub fn nodes_by_file(&self, file_path: &str) -> Vec<&Node> {
        self.collect_index(self.nodes_by_file.get(file_path))
    }

    /// Nodes with the exact name, in insertion order. Fresh container.
    pub fn nodes_by_name(&self, name: &str) -> Vec<&Node> {
        self.collect_index(self.nodes_by_name.get(name))
    }

    /// Nodes of the given kind, in insertion order. Fresh container.
    pub fn nodes_by_kind(&self, kind: SymbolKind) -> Vec<&Node> {
        self.collect_index(self.nodes_by_kind.get(&kind))
    }

    fn collect_index(&self, ids: Option<&Vec<String>>) -> Vec<&Node> {
        ids.map(|ids| ids.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default()
    }

    /// Edges of the given relation type, in insertion order. Fresh container.
    pub fn edges_by_type(&self, relation_type: RelationType) -> Vec<Arc<Edge>> {
        self.edges_by_type
            .get(&relation_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Edges expressed in `file_path` (the relationship's source site, not
    /// either endpoint's file). Fresh container.
    pub fn edges_by_file(&self, file_path: &str) -> Vec<Arc<Edge>> {
        self.edges_by_file
            .get(file_path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// O(1) per-index counts.
    pub fn node_count_by_file(&self, file_path: &str) -> usize {
        self.nodes_by_file.get(file_path).map_or(0, Vec::len)
    }

    pub fn node_count_by_kind(&self, kind: SymbolKind) -> usize {
        self.nodes_by_kind.get(&kind).map_or(0, Vec::len)
    }

    pub fn edge_count_by_type(&self, relation_type: RelationType) -> usize {
        self.edges_by_type.get(&relation_type).map_or(0, Vec::len)
    }

    pub fn edge_count_by_file(&self, file_path: &str) -> usize {
        self.edges_by_file.get(file_path).map_or(0, Vec::len)
    }

    /// Iterate nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All edges in insertion order, as a copy.
    pub fn edges(&self) -> Vec<Arc<Edge>> {
        self.edges.clone()
    }

    /// Remove every node defined in `file_path` and every edge incident to
    /// any of them, updating all indices for the affected keys only.
    /// Returns the number of nodes removed. Idempotent.
    #[instrument(skip(self), fields(root = %self.project_root))]
    pub fn remove_file(&mut self, file_path: &str) -> Result<usize, GraphError> {
        if self.state == GraphState::ReadOnly {
            return Err(GraphError::GraphFrozen);
        }

        let removed_ids: Vec<String> = match self.nodes_by_file.remove(file_path) {
            Some(ids) => ids,
            None => return Ok(0),
        };
        let removed_set: std::collections::HashSet<&str> =
            removed_ids.iter().map(String::as_str).collect();

        // Partition the master edge list; everything touching a removed node
        // goes away regardless of where the edge was expressed.
        let mut removed_edges: Vec<Arc<Edge>> = Vec::new();
        self.edges.retain(|edge| {
            let doomed = removed_set.contains(edge.from_id.as_str())
                || removed_set.contains(edge.to_id.as_str());
            if doomed {
                removed_edges.push(Arc::clone(edge));
            }
            !doomed
        });

        // Detach removed edges from surviving endpoints.
        for edge in &removed_edges {
            if !removed_set.contains(edge.from_id.as_str()) {
                if let Some(node) = self.nodes.get_mut(&edge.from_id) {
                    node.outgoing.retain(|e| !Arc::ptr_eq(e, edge));
                }
            }
            if !removed_set.contains(edge.to_id.as_str()) {
                if let Some(node) = self.nodes.get_mut(&edge.to_id) {
                    node.incoming.retain(|e| !Arc::ptr_eq(e, edge));
                }
            }
        }

        // Rebuild only the index keys the removed edges participated in.
        for edge in &removed_edges {
            if let Some(list) = self.edges_by_type.get_mut(&edge.relation_type) {
                list.retain(|e| !Arc::ptr_eq(e, edge));
                if list.is_empty() {
                    self.edges_by_type.remove(&edge.relation_type);
                }
            }
            if let Some(list) = self.edges_by_file.get_mut(&edge.location.file_path) {
                list.retain(|e| !Arc::ptr_eq(e, edge));
                if list.is_empty() {
                    self.edges_by_file.remove(&edge.location.file_path);
                }
            }
        }

        for id in &removed_ids {
            if let Some(node) = self.nodes.shift_remove(id) {
                if !node.symbol.name.is_empty() {
                    if let Some(list) = self.nodes_by_name.get_mut(&node.symbol.name) {
                        list.retain(|n| n != id);
                        if list.is_empty() {
                            self.nodes_by_name.remove(&node.symbol.name);
                        }
                    }
                }
                if let Some(list) = self.nodes_by_kind.get_mut(&node.symbol.kind) {
                    list.retain(|n| n != id);
                    if list.is_empty() {
                        self.nodes_by_kind.remove(&node.symbol.kind);
                    }
                }
            }
        }

        debug!(
            file = file_path,
            nodes_removed = removed_ids.len(),
            edges_removed = removed_edges.len(),
            "removed file from graph"
        );
        Ok(removed_ids.len())
    }

    /// Merge a parser result: add each symbol whose ID is not yet present.
    /// Returns the number of nodes added together with the error that stopped
    /// the merge, if any; partial additions before a capacity stop are kept.
    pub fn merge_parse_result(&mut self, result: &ParseResult) -> (usize, Option<GraphError>) {
        if self.state == GraphState::ReadOnly {
            return (0, Some(GraphError::GraphFrozen));
        }

        let mut added = 0usize;
        for symbol in &result.symbols {
            if self.nodes.contains_key(&symbol.id) {
                continue;
            }
            match self.add_node(Arc::clone(symbol)) {
                Ok(_) => added += 1,
                Err(err @ GraphError::MaxNodesExceeded(_)) => return (added, Some(err)),
                Err(err) => {
                    warn!(symbol = %symbol.id, error = %err, "skipping symbol during merge");
                }
            }
        }
        (added, None)
    }

    /// Transition `Building` -> `ReadOnly`, stamping the build timestamp once
    /// and validating index consistency. Idempotent; a second call is a no-op.
    pub fn freeze(&mut self) {
        if self.state == GraphState::ReadOnly {
            return;
        }
        self.state = GraphState::ReadOnly;
        self.built_at_millis = now_millis();
        if let Err(err) = self.validate() {
            // Indices are derived data; inconsistency here is a bug in the
            // mutation paths, not in the caller.
            error!(error = %err, "index consistency validation failed at freeze");
        }
    }

    /// Verify that every index entry is consistent with primary node/edge
    /// membership and that edge instances are shared between endpoint lists.
    pub fn validate(&self) -> anyhow::Result<()> {
        use anyhow::bail;

        let mut outgoing_total = 0usize;
        let mut incoming_total = 0usize;
        for node in self.nodes.values() {
            outgoing_total += node.outgoing.len();
            incoming_total += node.incoming.len();
            for edge in &node.outgoing {
                let target = match self.nodes.get(&edge.to_id) {
                    Some(t) => t,
                    None => bail!("edge {} -> {} targets a missing node", edge.from_id, edge.to_id),
                };
                if !target.incoming.iter().any(|e| Arc::ptr_eq(e, edge)) {
                    bail!(
                        "edge {} -> {} missing from target incoming list",
                        edge.from_id,
                        edge.to_id
                    );
                }
            }
        }
        if outgoing_total != self.edges.len() || incoming_total != self.edges.len() {
            bail!(
                "edge count mismatch: {} edges, {} outgoing, {} incoming",
                self.edges.len(),
                outgoing_total,
                incoming_total
            );
        }

        for (file, ids) in &self.nodes_by_file {
            for id in ids {
                match self.nodes.get(id) {
                    Some(node) if node.symbol.file_path == *file => {}
                    _ => bail!("nodes_by_file[{file}] references stale node {id}"),
                }
            }
        }
        for (name, ids) in &self.nodes_by_name {
            for id in ids {
                match self.nodes.get(id) {
                    Some(node) if node.symbol.name == *name => {}
                    _ => bail!("nodes_by_name[{name}] references stale node {id}"),
                }
            }
        }
        for (kind, ids) in &self.nodes_by_kind {
            for id in ids {
                match self.nodes.get(id) {
                    Some(node) if node.symbol.kind == *kind => {}
                    _ => bail!("nodes_by_kind[{kind}] references stale node {id}"),
                }
            }
        }
        let indexed_by_type: usize = self.edges_by_type.values().map(Vec::len).sum();
        let indexed_by_file: usize = self.edges_by_file.values().map(Vec::len).sum();
        if indexed_by_type != self.edges.len() || indexed_by_file != self.edges.len() {
            bail!(
                "edge index mismatch: {} edges, {} by type, {} by file",
                self.edges.len(),
                indexed_by_type,
                indexed_by_file
            );
        }
        Ok(())
    }

    /// Deep copy in `Building` state. Symbol records are shared; nodes,
    /// edges, and indices are rebuilt, so mutations to the clone never touch
    /// the original.
    pub fn clone_building(&self) -> Graph {
        let mut clone = Graph::with_options(
            self.project_root.clone(),
            GraphOptions {
                max_nodes: self.max_nodes,
                max_edges: self.max_edges,
            },
        );
        for node in self.nodes.values() {
            // Source graph respected capacities, so replay cannot fail.
            let _ = clone.add_node(Arc::clone(&node.symbol));
        }
        for edge in &self.edges {
            let _ = clone.add_edge(
                &edge.from_id,
                &edge.to_id,
                edge.relation_type,
                edge.location.clone(),
            );
        }
        clone
    }

    /// Order-independent digest of the node and edge multisets: a wrapping
    /// sum of fixed-seed 64-bit fingerprints of each record's canonical
    /// serialization, truncated to 16 lowercase hex characters. The empty
    /// graph hashes to all zeros.
    pub fn structural_hash(&self) -> String {
        let mut acc: u64 = 0;
        for node in self.nodes.values() {
            let record = format!(
                "n|{}|{}|{}|{}",
                node.id, node.symbol.kind, node.symbol.name, node.symbol.file_path
            );
            acc = acc.wrapping_add(xxh3_64_with_seed(record.as_bytes(), STRUCTURAL_HASH_SEED));
        }
        for edge in &self.edges {
            let record = format!(
                "e|{}|{}|{}|{}|{}|{}|{}|{}",
                edge.from_id,
                edge.to_id,
                edge.relation_type,
                edge.location.file_path,
                edge.location.span.start_line,
                edge.location.span.start_column,
                edge.location.span.end_line,
                edge.location.span.end_column
            );
            acc = acc.wrapping_add(xxh3_64_with_seed(record.as_bytes(), STRUCTURAL_HASH_SEED));
        }
        format!("{acc:016x}")
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("project_root", &self.project_root)
            .field("node_count", &self.nodes.len())
            .field("edge_count", &self.edges.len())
            .field("state", &self.state)
            .finish()
    }
}
