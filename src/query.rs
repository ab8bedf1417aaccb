//! Read-only query service over a frozen graph
//!
//! The service wraps a hierarchical graph view plus an optional external
//! symbol index, and serves symbol lookups, relationship queries, path
//! finding, and analytics behind caches and singleflight groups. Every
//! method is re-entrant and concurrency-safe; a closed service answers
//! everything with the closed sentinel.
//!
//! Cacheable queries (callers, callees, shortest paths) follow one
//! discipline: try the cache, enter the per-key singleflight on a miss,
//! re-check the cache inside the flight, compute, cache only non-truncated
//! results, and always hand the caller a fresh container. The singleflight
//! groups are statically typed, so the wrong-typed-entry hazard of untyped
//! groups cannot arise here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::analytics::{Community, GraphAnalytics, HotSpot};
use crate::errors::GraphError;
use crate::graph::{Edge, Graph};
use crate::hierarchy::HierarchicalGraph;
use crate::lru_cache::StatsCache;
use crate::singleflight::{flatten_shared, Group};
use crate::symbol_index::SymbolIndex;
use crate::types::{now_millis, RelationType, Symbol, SymbolKind};

/// Depth bound for cycle detection.
const CYCLE_DETECTION_MAX_DEPTH: usize = 1_000;
/// Clamp range for call-chain depth.
const CALL_CHAIN_MIN_DEPTH: usize = 1;
const CALL_CHAIN_MAX_DEPTH: usize = 100;

/// Tunables for the query service.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Result-list cap; longer lists are truncated and left uncached.
    pub max_results: usize,
    pub callers_cache_size: usize,
    pub callees_cache_size: usize,
    pub paths_cache_size: usize,
    pub page_rank_ttl_millis: i64,
    pub page_rank_timeout_millis: u64,
    pub communities_ttl_millis: i64,
    pub cancel_check_stride: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: 100,
            callers_cache_size: 500,
            callees_cache_size: 500,
            paths_cache_size: 200,
            page_rank_ttl_millis: 60_000,
            page_rank_timeout_millis: 10_000,
            communities_ttl_millis: 60_000,
            cancel_check_stride: 1024,
        }
    }
}

/// A list of symbols plus whether the computation hit the result cap.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub symbols: Vec<Arc<Symbol>>,
    pub truncated: bool,
}

/// A node path between two symbols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResult {
    pub path: Vec<String>,
    pub length: usize,
}

/// Counters for one adapter cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

/// Snapshot of all adapter cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryCacheStats {
    pub callers: CacheCounters,
    pub callees: CacheCounters,
    pub paths: CacheCounters,
    pub total_hits: u64,
    pub total_misses: u64,
    /// `hits / (hits + misses)`, 0 when nothing was asked yet.
    pub hit_rate: f64,
}

/// Read-only, cached, coalescing query adapter.
pub struct GraphQueryService {
    hierarchy: Arc<HierarchicalGraph>,
    symbol_index: Option<Arc<dyn SymbolIndex>>,
    analytics: Arc<GraphAnalytics>,
    /// Stamped by the caller on each rebuild; never incremented here.
    generation: u64,
    last_refresh_millis: i64,
    config: QueryConfig,
    closed: AtomicBool,

    callers_cache: Arc<StatsCache<String, QueryResult>>,
    callees_cache: Arc<StatsCache<String, QueryResult>>,
    paths_cache: Arc<StatsCache<String, PathResult>>,
    callers_group: Group<QueryResult>,
    callees_group: Group<QueryResult>,
    paths_group: Group<PathResult>,

    page_rank_cache: Arc<RwLock<Option<(i64, HashMap<String, f64>)>>>,
    communities_cache: Arc<RwLock<Option<(i64, Vec<Community>)>>>,
    page_rank_group: Group<HashMap<String, f64>>,
    communities_group: Group<Vec<Community>>,
    call_edge_count: RwLock<Option<usize>>,

    /// Guards stats snapshots against a concurrent invalidate.
    invalidate_lock: RwLock<()>,
}

impl GraphQueryService {
    /// Wrap a hierarchical view. `generation` and `last_refresh_millis` come
    /// from the caller; the service only reports them.
    pub fn new(
        hierarchy: Arc<HierarchicalGraph>,
        symbol_index: Option<Arc<dyn SymbolIndex>>,
        generation: u64,
        last_refresh_millis: i64,
        config: QueryConfig,
    ) -> Self {
        let analytics = Arc::new(
            GraphAnalytics::new(Arc::clone(hierarchy.graph()))
                .with_cancel_check_stride(config.cancel_check_stride),
        );
        Self {
            analytics,
            symbol_index,
            generation,
            last_refresh_millis,
            closed: AtomicBool::new(false),
            callers_cache: Arc::new(StatsCache::new(config.callers_cache_size)),
            callees_cache: Arc::new(StatsCache::new(config.callees_cache_size)),
            paths_cache: Arc::new(StatsCache::new(config.paths_cache_size)),
            callers_group: Group::new(),
            callees_group: Group::new(),
            paths_group: Group::new(),
            page_rank_cache: Arc::new(RwLock::new(None)),
            communities_cache: Arc::new(RwLock::new(None)),
            page_rank_group: Group::new(),
            communities_group: Group::new(),
            call_edge_count: RwLock::new(None),
            invalidate_lock: RwLock::new(()),
            config,
            hierarchy,
        }
    }

    fn graph(&self) -> &Arc<Graph> {
        self.hierarchy.graph()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_refresh_millis(&self) -> i64 {
        self.last_refresh_millis
    }

    /// Close the service. Idempotent; every later call fails with
    /// [`GraphError::GraphQueryClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.is_closed() {
            Err(GraphError::GraphQueryClosed)
        } else {
            Ok(())
        }
    }

    /// Symbol lookup by exact ID. `Ok(None)` when the node does not exist.
    pub fn find_symbol_by_id(&self, id: &str) -> Result<Option<Arc<Symbol>>, GraphError> {
        self.ensure_open()?;
        Ok(self.graph().get_node(id).map(|node| Arc::clone(&node.symbol)))
    }

    /// Exact-name lookup; the external index answers first when present.
    pub async fn find_symbols_by_name(&self, name: &str) -> anyhow::Result<Vec<Arc<Symbol>>> {
        self.ensure_open()?;
        let mut symbols = match &self.symbol_index {
            Some(index) => index.search_by_name(name).await?,
            None => self
                .graph()
                .nodes_by_name(name)
                .into_iter()
                .map(|node| Arc::clone(&node.symbol))
                .collect(),
        };
        symbols.truncate(self.config.max_results);
        Ok(symbols)
    }

    pub fn find_symbols_by_kind(&self, kind: SymbolKind) -> Result<Vec<Arc<Symbol>>, GraphError> {
        self.ensure_open()?;
        let mut symbols: Vec<Arc<Symbol>> = self
            .graph()
            .nodes_by_kind(kind)
            .into_iter()
            .map(|node| Arc::clone(&node.symbol))
            .collect();
        symbols.truncate(self.config.max_results);
        Ok(symbols)
    }

    pub fn find_symbols_in_file(&self, file_path: &str) -> Result<Vec<Arc<Symbol>>, GraphError> {
        self.ensure_open()?;
        Ok(self
            .hierarchy
            .nodes_in_file(file_path)
            .into_iter()
            .map(|node| Arc::clone(&node.symbol))
            .collect())
    }

    /// Symbols that call `id`, behind the cache + singleflight discipline.
    #[instrument(skip(self, token))]
    pub async fn find_callers(
        &self,
        token: &CancellationToken,
        id: &str,
    ) -> anyhow::Result<QueryResult> {
        self.relationship_query(token, id, &self.callers_cache, &self.callers_group, "callers")
            .await
    }

    /// Symbols that `id` calls, behind the cache + singleflight discipline.
    #[instrument(skip(self, token))]
    pub async fn find_callees(
        &self,
        token: &CancellationToken,
        id: &str,
    ) -> anyhow::Result<QueryResult> {
        self.relationship_query(token, id, &self.callees_cache, &self.callees_group, "callees")
            .await
    }

    async fn relationship_query(
        &self,
        token: &CancellationToken,
        id: &str,
        cache: &Arc<StatsCache<String, QueryResult>>,
        group: &Group<QueryResult>,
        kind: &'static str,
    ) -> anyhow::Result<QueryResult> {
        self.ensure_open()?;
        if token.is_cancelled() {
            return Err(GraphError::BuildCancelled.into());
        }

        let key = format!("{kind}:{id}");
        if let Some(hit) = cache.get(&key) {
            // The cache clones on get; that clone is the defensive copy.
            return Ok(hit);
        }

        let hierarchy = Arc::clone(&self.hierarchy);
        let flight_cache = Arc::clone(cache);
        let flight_key = key.clone();
        let node_id = id.to_string();
        let max_results = self.config.max_results;
        group
            .run(&key, async move {
                if let Some(hit) = flight_cache.get(&flight_key) {
                    return Ok(hit);
                }
                let computed =
                    compute_relationship(hierarchy.graph(), &node_id, kind, max_results)?;
                if !computed.truncated {
                    flight_cache.set(flight_key, computed.clone());
                }
                Ok(computed)
            })
            .await
            .map_err(flatten_shared)
    }

    /// Symbols implementing the interface `id` (incoming Implements edges).
    pub fn find_implementations(&self, id: &str) -> anyhow::Result<Vec<Arc<Symbol>>> {
        self.ensure_open()?;
        self.incoming_sources(id, RelationType::Implements)
    }

    /// Symbols referencing `id` (incoming References edges).
    pub fn find_references(&self, id: &str) -> anyhow::Result<Vec<Arc<Symbol>>> {
        self.ensure_open()?;
        self.incoming_sources(id, RelationType::References)
    }

    fn incoming_sources(
        &self,
        id: &str,
        relation: RelationType,
    ) -> anyhow::Result<Vec<Arc<Symbol>>> {
        let graph = self.graph();
        let node = graph
            .get_node(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        Ok(node
            .incoming()
            .iter()
            .filter(|edge| edge.relation_type == relation)
            .filter_map(|edge| graph.get_node(&edge.from_id))
            .map(|source| Arc::clone(&source.symbol))
            .collect())
    }

    /// Edges expressed in `file_path`, as a fresh container.
    pub fn edges_by_file(&self, file_path: &str) -> Result<Vec<Arc<Edge>>, GraphError> {
        self.ensure_open()?;
        Ok(self.graph().edges_by_file(file_path))
    }

    pub fn edge_count_by_file(&self, file_path: &str) -> Result<usize, GraphError> {
        self.ensure_open()?;
        Ok(self.graph().edge_count_by_file(file_path))
    }

    /// Total Calls edges, computed once and cached until invalidation.
    pub fn call_edge_count(&self) -> Result<usize, GraphError> {
        self.ensure_open()?;
        if let Some(count) = *self.call_edge_count.read() {
            return Ok(count);
        }
        let count = self.graph().edge_count_by_type(RelationType::Calls);
        *self.call_edge_count.write() = Some(count);
        Ok(count)
    }

    /// DFS cycle detection from `id` over Calls edges only. Depth is capped
    /// at 1000; hitting the cap reports no cycle and notes the incomplete
    /// detection. Indirect dispatch is out of scope by contract.
    #[instrument(skip(self))]
    pub fn has_cycle_from(&self, id: &str) -> Result<bool, GraphError> {
        self.ensure_open()?;
        let graph = self.graph();
        if graph.get_node(id).is_none() {
            return Err(GraphError::NodeNotFound(id.to_string()));
        }

        enum Frame<'a> {
            Enter(&'a str),
            Exit(&'a str),
        }

        let mut visited: HashSet<&str> = HashSet::with_capacity(graph.node_count());
        let mut on_stack: HashSet<&str> = HashSet::with_capacity(graph.node_count());
        let mut stack: Vec<Frame> = vec![Frame::Enter(id)];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(node_id) => {
                    if on_stack.contains(node_id) {
                        return Ok(true);
                    }
                    if !visited.insert(node_id) {
                        continue;
                    }
                    if on_stack.len() >= CYCLE_DETECTION_MAX_DEPTH {
                        warn!(
                            start = id,
                            depth = on_stack.len(),
                            "cycle detection depth bound reached; detection incomplete"
                        );
                        return Ok(false);
                    }
                    on_stack.insert(node_id);
                    stack.push(Frame::Exit(node_id));
                    if let Some(node) = graph.get_node(node_id) {
                        for edge in node.outgoing() {
                            if edge.relation_type == RelationType::Calls {
                                stack.push(Frame::Enter(edge.to_id.as_str()));
                            }
                        }
                    }
                }
                Frame::Exit(node_id) => {
                    on_stack.remove(node_id);
                }
            }
        }
        Ok(false)
    }

    /// Shortest Calls chain from `from` to `to`, inclusive of endpoints.
    /// `max_depth` is clamped to [1, 100]. An absent path is an empty list,
    /// not an error.
    #[instrument(skip(self, token))]
    pub async fn get_call_chain(
        &self,
        token: &CancellationToken,
        from: &str,
        to: &str,
        max_depth: usize,
    ) -> anyhow::Result<Vec<String>> {
        self.ensure_open()?;
        if token.is_cancelled() {
            return Err(GraphError::BuildCancelled.into());
        }
        let max_depth = max_depth.clamp(CALL_CHAIN_MIN_DEPTH, CALL_CHAIN_MAX_DEPTH);
        Ok(bfs_path(
            self.graph(),
            from,
            to,
            max_depth,
            Some(RelationType::Calls),
        ))
    }

    /// Shortest path over all edge types, cached by endpoint pair.
    #[instrument(skip(self, token))]
    pub async fn shortest_path(
        &self,
        token: &CancellationToken,
        from: &str,
        to: &str,
    ) -> anyhow::Result<PathResult> {
        self.ensure_open()?;
        if token.is_cancelled() {
            return Err(GraphError::BuildCancelled.into());
        }

        let key = format!("path:{from}|{to}");
        if let Some(hit) = self.paths_cache.get(&key) {
            return Ok(hit);
        }

        let hierarchy = Arc::clone(&self.hierarchy);
        let cache = Arc::clone(&self.paths_cache);
        let flight_key = key.clone();
        let (from, to) = (from.to_string(), to.to_string());
        self.paths_group
            .run(&key, async move {
                if let Some(hit) = cache.get(&flight_key) {
                    return Ok(hit);
                }
                let path = bfs_path(hierarchy.graph(), &from, &to, usize::MAX, None);
                let result = PathResult {
                    length: path.len(),
                    path,
                };
                cache.set(flight_key, result.clone());
                Ok(result)
            })
            .await
            .map_err(flatten_shared)
    }

    /// Top-`k` hotspots by combined degree.
    pub fn hot_spots(&self, k: usize) -> Result<Vec<HotSpot>, GraphError> {
        self.ensure_open()?;
        Ok(self.analytics.hot_spots(k))
    }

    /// Nodes with no incoming edges.
    pub fn dead_code(&self) -> Result<Vec<String>, GraphError> {
        self.ensure_open()?;
        Ok(self.analytics.dead_code())
    }

    /// Strongly connected components with more than one member.
    pub fn cyclic_dependencies(&self) -> Result<Vec<Vec<String>>, GraphError> {
        self.ensure_open()?;
        Ok(self.analytics.cyclic_dependencies())
    }

    /// PageRank scores with a TTL cache: read-locked fast path, coalesced
    /// slow path under the configured inner timeout.
    #[instrument(skip(self, token))]
    pub async fn page_rank(
        &self,
        token: &CancellationToken,
    ) -> anyhow::Result<HashMap<String, f64>> {
        self.ensure_open()?;
        if token.is_cancelled() {
            return Err(GraphError::BuildCancelled.into());
        }

        let ttl = self.config.page_rank_ttl_millis;
        if let Some((stored_at, scores)) = self.page_rank_cache.read().as_ref() {
            if now_millis() - stored_at <= ttl {
                return Ok(scores.clone());
            }
        }

        let analytics = Arc::clone(&self.analytics);
        let cache = Arc::clone(&self.page_rank_cache);
        let timeout = Duration::from_millis(self.config.page_rank_timeout_millis);
        let flight_token = token.clone();
        self.page_rank_group
            .run("pagerank", async move {
                if let Some((stored_at, scores)) = cache.read().as_ref() {
                    if now_millis() - stored_at <= ttl {
                        return Ok(scores.clone());
                    }
                }
                let scores = tokio::time::timeout(timeout, analytics.page_rank(&flight_token))
                    .await
                    .map_err(|_| anyhow::anyhow!("page rank timed out after {timeout:?}"))??;
                *cache.write() = Some((now_millis(), scores.clone()));
                Ok(scores)
            })
            .await
            .map_err(flatten_shared)
    }

    /// Package communities with the same TTL discipline as PageRank.
    #[instrument(skip(self))]
    pub async fn communities(&self) -> anyhow::Result<Vec<Community>> {
        self.ensure_open()?;

        let ttl = self.config.communities_ttl_millis;
        if let Some((stored_at, communities)) = self.communities_cache.read().as_ref() {
            if now_millis() - stored_at <= ttl {
                return Ok(communities.clone());
            }
        }

        let analytics = Arc::clone(&self.analytics);
        let cache = Arc::clone(&self.communities_cache);
        self.communities_group
            .run("communities", async move {
                if let Some((stored_at, communities)) = cache.read().as_ref() {
                    if now_millis() - stored_at <= ttl {
                        return Ok(communities.clone());
                    }
                }
                let communities = analytics.communities();
                *cache.write() = Some((now_millis(), communities.clone()));
                Ok(communities)
            })
            .await
            .map_err(flatten_shared)
    }

    /// Drop every cached result: callers, callees, paths, PageRank,
    /// communities, and the call-edge count.
    pub fn invalidate_cache(&self) {
        let _guard = self.invalidate_lock.write();
        self.callers_cache.purge();
        self.callees_cache.purge();
        self.paths_cache.purge();
        *self.page_rank_cache.write() = None;
        *self.communities_cache.write() = None;
        *self.call_edge_count.write() = None;
        debug!("query caches invalidated");
    }

    /// Consistent snapshot of cache counters.
    pub fn query_cache_stats(&self) -> QueryCacheStats {
        let _guard = self.invalidate_lock.read();
        let counters = |cache: &StatsCache<String, QueryResult>| {
            let (hits, misses) = cache.stats();
            CacheCounters {
                hits,
                misses,
                evictions: cache.evictions(),
                size: cache.len(),
            }
        };
        let callers = counters(&self.callers_cache);
        let callees = counters(&self.callees_cache);
        let (path_hits, path_misses) = self.paths_cache.stats();
        let paths = CacheCounters {
            hits: path_hits,
            misses: path_misses,
            evictions: self.paths_cache.evictions(),
            size: self.paths_cache.len(),
        };

        let total_hits = callers.hits + callees.hits + paths.hits;
        let total_misses = callers.misses + callees.misses + paths.misses;
        let hit_rate = if total_hits + total_misses == 0 {
            0.0
        } else {
            total_hits as f64 / (total_hits + total_misses) as f64
        };
        QueryCacheStats {
            callers,
            callees,
            paths,
            total_hits,
            total_misses,
            hit_rate,
        }
    }
}

/// Incoming or outgoing call neighbors of a node, as a symbol list.
fn compute_relationship(
    graph: &Arc<Graph>,
    id: &str,
    kind: &str,
    max_results: usize,
) -> Result<QueryResult, GraphError> {
    let node = graph
        .get_node(id)
        .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
    let edges = if kind == "callers" {
        node.incoming()
    } else {
        node.outgoing()
    };

    let mut symbols = Vec::new();
    let mut truncated = false;
    for edge in edges {
        if edge.relation_type != RelationType::Calls {
            continue;
        }
        if symbols.len() >= max_results {
            truncated = true;
            break;
        }
        let neighbor_id = if kind == "callers" {
            &edge.from_id
        } else {
            &edge.to_id
        };
        if let Some(neighbor) = graph.get_node(neighbor_id) {
            symbols.push(Arc::clone(&neighbor.symbol));
        }
    }
    Ok(QueryResult { symbols, truncated })
}

/// BFS with parent pointers; reconstructs the path by forward-appending and
/// reversing in place. Returns an empty vec when no path exists.
fn bfs_path(
    graph: &Arc<Graph>,
    from: &str,
    to: &str,
    max_depth: usize,
    relation: Option<RelationType>,
) -> Vec<String> {
    if graph.get_node(from).is_none() || graph.get_node(to).is_none() {
        return Vec::new();
    }
    if from == to {
        return vec![from.to_string()];
    }

    let mut parents: HashMap<String, String> = HashMap::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(from.to_string());
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((from.to_string(), 0));

    'search: while let Some((current, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let node = match graph.get_node(&current) {
            Some(node) => node,
            None => continue,
        };
        for edge in node.outgoing() {
            if let Some(required) = relation {
                if edge.relation_type != required {
                    continue;
                }
            }
            if !visited.insert(edge.to_id.clone()) {
                continue;
            }
            parents.insert(edge.to_id.clone(), current.clone());
            if edge.to_id == to {
                break 'search;
            }
            queue.push_back((edge.to_id.clone(), depth + 1));
        }
    }

    if !parents.contains_key(to) {
        return Vec::new();
    }
    let mut path = vec![to.to_string()];
    let mut cursor = to;
    while let Some(parent) = parents.get(cursor) {
        path.push(parent.clone());
        cursor = parent;
    }
    path.reverse();
    path
}
