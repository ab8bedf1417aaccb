//! Level-synchronous parallel BFS over call edges
//!
//! Forward traversal follows outgoing `Calls` edges, reverse traversal
//! follows incoming ones. Each frontier level is expanded either
//! sequentially (narrow levels, better cache locality) or by a small worker
//! pool consuming a bounded channel. Workers keep local accumulators that
//! merge at the level barrier, so the shared visited set is the only
//! contended structure; it sits behind a reader-writer lock with
//! double-check locking on insert.
//!
//! Ordering inside a level is non-deterministic whenever the parallel path
//! ran; callers must treat `visited_nodes` as a set with level structure.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::errors::GraphError;
use crate::graph::{Edge, Graph};
use crate::types::RelationType;

/// Frontier width above which a level is expanded by the worker pool.
const PARALLEL_THRESHOLD: usize = 32;
/// Hard cap on workers per level.
const MAX_WORKERS: usize = 8;
/// Hard cap on the work channel's buffer.
const MAX_CHANNEL_CAPACITY: usize = 256;

/// Bounds for a traversal.
#[derive(Debug, Clone, Copy)]
pub struct TraversalOptions {
    /// Maximum BFS depth from the root.
    pub max_depth: usize,
    /// Maximum total visited nodes, root included.
    pub limit: usize,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            max_depth: 100,
            limit: 100_000,
        }
    }
}

/// Outcome of a traversal. On cancellation or when the visit limit is hit,
/// the partial result accumulated so far is returned with `truncated` set.
#[derive(Debug, Clone)]
pub struct TraversalResult {
    pub start_node: String,
    pub visited_nodes: Vec<String>,
    /// Discovery edges: one per visited node beyond the root.
    pub edges: Vec<Arc<Edge>>,
    /// Deepest level that contributed a node.
    pub depth: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// BFS over outgoing `Calls` edges from `root`.
#[instrument(skip(graph, token))]
pub async fn call_graph_parallel(
    graph: &Arc<Graph>,
    root: &str,
    options: TraversalOptions,
    token: &CancellationToken,
) -> Result<TraversalResult, GraphError> {
    traverse(graph, root, Direction::Forward, options, token).await
}

/// BFS over incoming `Calls` edges toward `root`.
#[instrument(skip(graph, token))]
pub async fn reverse_call_graph_parallel(
    graph: &Arc<Graph>,
    root: &str,
    options: TraversalOptions,
    token: &CancellationToken,
) -> Result<TraversalResult, GraphError> {
    traverse(graph, root, Direction::Reverse, options, token).await
}

async fn traverse(
    graph: &Arc<Graph>,
    root: &str,
    direction: Direction,
    options: TraversalOptions,
    token: &CancellationToken,
) -> Result<TraversalResult, GraphError> {
    if graph.get_node(root).is_none() {
        return Err(GraphError::NodeNotFound(root.to_string()));
    }

    let limit = options.limit.max(1);
    let visited: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));
    visited.write().insert(root.to_string());

    let mut result = TraversalResult {
        start_node: root.to_string(),
        visited_nodes: vec![root.to_string()],
        edges: Vec::new(),
        depth: 0,
        truncated: false,
    };

    let mut frontier = vec![root.to_string()];
    for depth in 1..=options.max_depth {
        if token.is_cancelled() {
            result.truncated = true;
            return Ok(result);
        }
        if frontier.is_empty() {
            break;
        }

        let level = if frontier.len() > PARALLEL_THRESHOLD {
            expand_level_parallel(graph, direction, &frontier, &visited, limit, token).await
        } else {
            expand_level_sequential(graph, direction, &frontier, &visited, limit, token)
        };

        if !level.nodes.is_empty() {
            result.depth = depth;
        }
        result.visited_nodes.extend(level.nodes.iter().cloned());
        result.edges.extend(level.edges);
        if level.truncated {
            result.truncated = true;
            return Ok(result);
        }
        frontier = level.nodes;
    }

    Ok(result)
}

/// Accumulated output of one expanded level.
struct LevelResult {
    nodes: Vec<String>,
    edges: Vec<Arc<Edge>>,
    truncated: bool,
}

fn expand_level_sequential(
    graph: &Graph,
    direction: Direction,
    frontier: &[String],
    visited: &RwLock<HashSet<String>>,
    limit: usize,
    token: &CancellationToken,
) -> LevelResult {
    let mut level = LevelResult {
        nodes: Vec::new(),
        edges: Vec::new(),
        truncated: false,
    };
    for node_id in frontier {
        if token.is_cancelled() {
            level.truncated = true;
            return level;
        }
        if expand_node(
            graph,
            direction,
            node_id,
            visited,
            limit,
            &mut level.nodes,
            &mut level.edges,
        ) {
            level.truncated = true;
            return level;
        }
    }
    level
}

async fn expand_level_parallel(
    graph: &Arc<Graph>,
    direction: Direction,
    frontier: &[String],
    visited: &Arc<RwLock<HashSet<String>>>,
    limit: usize,
    token: &CancellationToken,
) -> LevelResult {
    let worker_count = frontier.len().min(num_cpus::get()).min(MAX_WORKERS);
    let capacity = frontier.len().min(MAX_CHANNEL_CAPACITY);
    let (tx, rx) = mpsc::channel::<String>(capacity);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    debug!(
        frontier = frontier.len(),
        workers = worker_count,
        "expanding level in parallel"
    );

    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let graph = Arc::clone(graph);
        let visited = Arc::clone(visited);
        let rx = Arc::clone(&rx);
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            let mut local = LevelResult {
                nodes: Vec::new(),
                edges: Vec::new(),
                truncated: false,
            };
            loop {
                let node_id = { rx.lock().await.recv().await };
                let node_id = match node_id {
                    Some(id) => id,
                    None => break,
                };
                // On cancellation or a hit limit keep draining the channel
                // so the feeder never blocks on a full buffer.
                if local.truncated || token.is_cancelled() {
                    local.truncated = true;
                    continue;
                }
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    expand_node(
                        &graph,
                        direction,
                        &node_id,
                        &visited,
                        limit,
                        &mut local.nodes,
                        &mut local.edges,
                    )
                }));
                match outcome {
                    Ok(limit_hit) => {
                        if limit_hit {
                            local.truncated = true;
                        }
                    }
                    Err(panic) => {
                        let backtrace = std::backtrace::Backtrace::force_capture();
                        error!(
                            node = %node_id,
                            panic = ?panic_message(&panic),
                            %backtrace,
                            "traversal worker panicked; continuing with partial level"
                        );
                    }
                }
            }
            local
        }));
    }

    for node_id in frontier {
        if tx.send(node_id.clone()).await.is_err() {
            break;
        }
    }
    drop(tx);

    let mut merged = LevelResult {
        nodes: Vec::new(),
        edges: Vec::new(),
        truncated: false,
    };
    for handle in handles {
        match handle.await {
            Ok(local) => {
                merged.nodes.extend(local.nodes);
                merged.edges.extend(local.edges);
                merged.truncated |= local.truncated;
            }
            Err(join_err) => {
                error!(error = %join_err, "traversal worker aborted");
                merged.truncated = true;
            }
        }
    }
    merged.truncated |= token.is_cancelled();
    merged
}

/// Visit all call neighbors of `node_id`, claiming unseen ones in the shared
/// visited set. Returns true when the visit limit was reached.
fn expand_node(
    graph: &Graph,
    direction: Direction,
    node_id: &str,
    visited: &RwLock<HashSet<String>>,
    limit: usize,
    local_nodes: &mut Vec<String>,
    local_edges: &mut Vec<Arc<Edge>>,
) -> bool {
    let node = match graph.get_node(node_id) {
        Some(node) => node,
        None => return false,
    };
    let edges = match direction {
        Direction::Forward => node.outgoing(),
        Direction::Reverse => node.incoming(),
    };
    for edge in edges {
        if edge.relation_type != RelationType::Calls {
            continue;
        }
        let neighbor = match direction {
            Direction::Forward => edge.to_id.as_str(),
            Direction::Reverse => edge.from_id.as_str(),
        };
        // Fast read-locked check, then the write-locked double check: a
        // sibling worker may have claimed the neighbor in between.
        if visited.read().contains(neighbor) {
            continue;
        }
        {
            let mut guard = visited.write();
            if guard.contains(neighbor) {
                continue;
            }
            if guard.len() >= limit {
                return true;
            }
            guard.insert(neighbor.to_string());
        }
        local_nodes.push(neighbor.to_string());
        local_edges.push(Arc::clone(edge));
    }
    false
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
