//! Error taxonomy for the relationship graph core
//!
//! Every fallible operation in the crate surfaces one of these sentinels so
//! callers can branch on the failure kind with `==` or `matches!`. Layers that
//! compose several operations (builder, path engine, query service) wrap them
//! in `anyhow::Error` with context; the sentinel stays reachable through
//! `downcast_ref::<GraphError>()`.

use thiserror::Error;

/// Sentinel errors for graph construction, traversal, and query operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Mutation attempted after the graph transitioned to read-only.
    #[error("graph is frozen and cannot be mutated")]
    GraphFrozen,

    /// A referenced node ID does not exist in the graph.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A node with this ID was already added.
    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    /// Adding the node would exceed the configured node capacity.
    #[error("node capacity exceeded (max {0})")]
    MaxNodesExceeded(usize),

    /// Adding the edge would exceed the configured edge capacity.
    #[error("edge capacity exceeded (max {0})")]
    MaxEdgesExceeded(usize),

    /// A nil or structurally invalid symbol was supplied.
    #[error("invalid node: symbol is missing or malformed")]
    InvalidNode,

    /// The operation observed a cancelled context and stopped early.
    #[error("operation cancelled")]
    BuildCancelled,

    /// An internal memory budget was exhausted.
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,

    /// An edge type name did not parse to a known relation.
    #[error("invalid edge type: {0}")]
    InvalidEdgeType(String),

    /// The query service was closed; no further operations are served.
    #[error("graph query service is closed")]
    GraphQueryClosed,

    /// A forest path query crossed tree boundaries.
    #[error("nodes are in different trees: {0} and {1}")]
    NodesInDifferentTrees(String, String),

    /// No graph is attached to the component that needs one.
    #[error("graph not available")]
    GraphNotAvailable,
}

impl GraphError {
    /// Metric label for the error category, used by the path-query error
    /// counter. Cancellation and capacity collapse into stable label names so
    /// dashboards do not explode on per-node cardinality.
    pub fn metric_label(&self) -> &'static str {
        match self {
            GraphError::GraphFrozen => "frozen",
            GraphError::NodeNotFound(_) => "node_not_found",
            GraphError::DuplicateNode(_) => "duplicate_node",
            GraphError::MaxNodesExceeded(_) | GraphError::MaxEdgesExceeded(_) => "capacity",
            GraphError::InvalidNode => "invalid_node",
            GraphError::BuildCancelled => "cancelled",
            GraphError::MemoryLimitExceeded => "memory_limit",
            GraphError::InvalidEdgeType(_) => "invalid_edge_type",
            GraphError::GraphQueryClosed => "closed",
            GraphError::NodesInDifferentTrees(_, _) => "cross_tree",
            GraphError::GraphNotAvailable => "unavailable",
        }
    }
}

/// Check whether an `anyhow` error chain bottoms out in the given sentinel.
pub fn is_graph_error(err: &anyhow::Error, sentinel: &GraphError) -> bool {
    err.downcast_ref::<GraphError>() == Some(sentinel)
}
