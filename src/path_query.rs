//! Path-aggregate query engine over HLD + segment tree
//!
//! Composes a heavy-light decomposition (single tree or forest) with a
//! segment tree of matching size to answer aggregate queries over arbitrary
//! tree paths in O(log^2 N). Layered around the core computation: a cached
//! LCA with its own singleflight, an optional result cache keyed by the
//! structural hash (so a rebuilt graph invalidates itself), per-query
//! timeouts, metrics, and optional sub-step recording for the orchestrating
//! reasoning-state recorder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::errors::GraphError;
use crate::hld::{Hld, PathSegment};
use crate::hld_forest::HldForest;
use crate::lru_cache::StatsCache;
use crate::metrics::path_query_metrics;
use crate::recorder::{StepOutcome, StepRecord, StepRecorder};
use crate::segment_tree::{Aggregation, SegmentTree};
use crate::singleflight::{flatten_shared, Group};
use crate::types::now_millis;

/// Default LCA cache capacity.
pub const DEFAULT_LCA_CACHE_SIZE: usize = 10_000;
/// Default query cache capacity.
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 1_000;
/// Default per-query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default cap on segments per decomposed path.
pub const DEFAULT_MAX_TREE_DEPTH: usize = 10_000;
/// Default slow-query warning threshold.
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_secs(5);

/// The tree structure a path engine runs over.
pub enum PathSource {
    Single(Arc<Hld>),
    Forest(Arc<HldForest>),
}

impl PathSource {
    fn total_nodes(&self) -> usize {
        match self {
            PathSource::Single(hld) => hld.node_count(),
            PathSource::Forest(forest) => forest.total_nodes(),
        }
    }

    fn graph_hash(&self) -> String {
        match self {
            PathSource::Single(hld) => hld.graph_hash(),
            PathSource::Forest(forest) => forest.graph_hash(),
        }
    }

    /// The decomposition owning `node` plus its global position offset.
    fn resolve(&self, node: &str) -> Result<(Arc<Hld>, usize), GraphError> {
        match self {
            PathSource::Single(hld) => {
                hld.node_to_idx(node)
                    .ok_or_else(|| GraphError::NodeNotFound(node.to_string()))?;
                Ok((Arc::clone(hld), 0))
            }
            PathSource::Forest(forest) => {
                let hld = Arc::clone(forest.hld_for(node)?);
                let offset = forest.tree_offset(node)?;
                Ok((hld, offset))
            }
        }
    }

    /// Node occupying a global position; used when laying out values.
    pub fn node_at_global_position(&self, position: usize) -> Option<&str> {
        match self {
            PathSource::Single(hld) => hld.node_at_position(position),
            PathSource::Forest(forest) => forest.node_at_global_position(position),
        }
    }
}

/// Construction options for [`PathQueryEngine`].
pub struct PathQueryOptions {
    pub lca_cache_enabled: bool,
    pub lca_cache_size: usize,
    pub query_cache_enabled: bool,
    pub query_cache_size: usize,
    pub query_timeout: Duration,
    /// Upper bound on decomposition segments per query.
    pub max_tree_depth: usize,
    pub slow_query_threshold: Duration,
    /// Optional sink for LCA / decomposition sub-step records.
    pub recorder: Option<Arc<dyn StepRecorder>>,
}

impl Default for PathQueryOptions {
    fn default() -> Self {
        Self {
            lca_cache_enabled: true,
            lca_cache_size: DEFAULT_LCA_CACHE_SIZE,
            query_cache_enabled: false,
            query_cache_size: DEFAULT_QUERY_CACHE_SIZE,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
            slow_query_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
            recorder: None,
        }
    }
}

impl PathQueryOptions {
    pub fn with_query_cache(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    pub fn with_lca_cache(mut self, enabled: bool) -> Self {
        self.lca_cache_enabled = enabled;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_max_tree_depth(mut self, max: usize) -> Self {
        self.max_tree_depth = max;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn StepRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }
}

/// Aggregate statistics over an engine's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct PathQueryStats {
    pub query_count: u64,
    pub total_latency: Duration,
    pub avg_latency: Duration,
    /// Unix milliseconds UTC of the most recent query, 0 if none ran.
    pub last_query_millis: i64,
    pub segments_per_query: f64,
    pub cache_hit_ratio: f64,
}

struct EngineInner {
    source: PathSource,
    tree: Arc<SegmentTree>,
    aggregation: Aggregation,
    query_timeout: Duration,
    max_tree_depth: usize,
    slow_query_threshold: Duration,
    graph_hash: String,
    lca_cache: Option<StatsCache<String, String>>,
    query_cache: Option<StatsCache<String, i64>>,
    lca_group: Group<String>,
    query_group: Group<i64>,
    recorder: Option<Arc<dyn StepRecorder>>,
    session_id: String,
    step_counter: AtomicU64,
    query_count: AtomicU64,
    total_latency_micros: AtomicU64,
    last_query_millis: AtomicI64,
    segments_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Path-aggregate query engine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct PathQueryEngine {
    inner: Arc<EngineInner>,
}

impl PathQueryEngine {
    /// Build an engine over `source` and a segment tree of matching size and
    /// aggregation.
    pub fn new(
        source: PathSource,
        tree: Arc<SegmentTree>,
        aggregation: Aggregation,
        options: PathQueryOptions,
    ) -> anyhow::Result<Self> {
        if tree.size() != source.total_nodes() {
            anyhow::bail!(
                "segment tree size {} does not match decomposition node count {}",
                tree.size(),
                source.total_nodes()
            );
        }
        if tree.aggregation() != aggregation {
            anyhow::bail!(
                "segment tree aggregates {} but the engine was asked for {}",
                tree.aggregation(),
                aggregation
            );
        }

        let graph_hash = source.graph_hash();
        Ok(Self {
            inner: Arc::new(EngineInner {
                source,
                tree,
                aggregation,
                query_timeout: options.query_timeout,
                max_tree_depth: options.max_tree_depth.max(1),
                slow_query_threshold: options.slow_query_threshold,
                graph_hash,
                lca_cache: options
                    .lca_cache_enabled
                    .then(|| StatsCache::new(options.lca_cache_size)),
                query_cache: options
                    .query_cache_enabled
                    .then(|| StatsCache::new(options.query_cache_size)),
                lca_group: Group::new(),
                query_group: Group::new(),
                recorder: options.recorder,
                session_id: Uuid::new_v4().to_string(),
                step_counter: AtomicU64::new(0),
                query_count: AtomicU64::new(0),
                total_latency_micros: AtomicU64::new(0),
                last_query_millis: AtomicI64::new(0),
                segments_total: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
            }),
        })
    }

    pub fn aggregation(&self) -> Aggregation {
        self.inner.aggregation
    }

    /// Cache key for a query, exposed for tests. Embeds the structural hash
    /// of the decomposed tree, so a rebuilt graph invalidates stale entries;
    /// symmetric aggregations canonicalize the endpoint order.
    pub fn path_query_cache_key(&self, u: &str, v: &str) -> String {
        let (a, b) = canonical_pair(self.inner.aggregation.symmetric_cache_key(), u, v);
        format!(
            "pathquery:{}:{}:{}:{}",
            self.inner.graph_hash, a, b, self.inner.aggregation
        )
    }

    /// Aggregate over the `u` -> `v` tree path.
    #[instrument(skip(self, token), fields(agg = %self.inner.aggregation))]
    pub async fn path_query(
        &self,
        token: &CancellationToken,
        u: &str,
        v: &str,
    ) -> anyhow::Result<i64> {
        let started = Instant::now();
        let agg = self.inner.aggregation.as_str();
        let metrics = path_query_metrics();

        let result = tokio::time::timeout(
            self.inner.query_timeout,
            Self::query_outer(
                Arc::clone(&self.inner),
                token.clone(),
                u.to_string(),
                v.to_string(),
            ),
        )
        .await;

        let elapsed = started.elapsed();
        match result {
            Ok(Ok(value)) => {
                self.note_query(elapsed);
                metrics.observe_query_duration(agg, elapsed);
                if elapsed >= self.inner.slow_query_threshold {
                    warn!(
                        u,
                        v,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow path query"
                    );
                }
                Ok(value)
            }
            Ok(Err(err)) => {
                let label = err
                    .downcast_ref::<GraphError>()
                    .map(GraphError::metric_label)
                    .unwrap_or("internal");
                metrics.record_query("error", agg);
                metrics.record_error(label);
                Err(err)
            }
            Err(_elapsed) => {
                metrics.record_query("error", agg);
                metrics.record_error("timeout");
                anyhow::bail!(
                    "path query {u} -> {v} timed out after {:?}",
                    self.inner.query_timeout
                )
            }
        }
    }

    /// Sum over the path; fails fast unless the engine aggregates with SUM.
    pub async fn path_sum(
        &self,
        token: &CancellationToken,
        u: &str,
        v: &str,
    ) -> anyhow::Result<i64> {
        self.require_aggregation(Aggregation::Sum)?;
        self.path_query(token, u, v).await
    }

    /// Minimum over the path; requires a MIN engine.
    pub async fn path_min(
        &self,
        token: &CancellationToken,
        u: &str,
        v: &str,
    ) -> anyhow::Result<i64> {
        self.require_aggregation(Aggregation::Min)?;
        self.path_query(token, u, v).await
    }

    /// Maximum over the path; requires a MAX engine.
    pub async fn path_max(
        &self,
        token: &CancellationToken,
        u: &str,
        v: &str,
    ) -> anyhow::Result<i64> {
        self.require_aggregation(Aggregation::Max)?;
        self.path_query(token, u, v).await
    }

    /// GCD over the path; requires a GCD engine.
    pub async fn path_gcd(
        &self,
        token: &CancellationToken,
        u: &str,
        v: &str,
    ) -> anyhow::Result<i64> {
        self.require_aggregation(Aggregation::Gcd)?;
        self.path_query(token, u, v).await
    }

    fn require_aggregation(&self, expected: Aggregation) -> anyhow::Result<()> {
        if self.inner.aggregation != expected {
            anyhow::bail!(
                "engine aggregates with {}, not {}",
                self.inner.aggregation,
                expected
            );
        }
        Ok(())
    }

    /// Lifetime statistics snapshot.
    pub fn stats(&self) -> PathQueryStats {
        let inner = &self.inner;
        let query_count = inner.query_count.load(Ordering::Relaxed);
        let total_micros = inner.total_latency_micros.load(Ordering::Relaxed);
        let segments = inner.segments_total.load(Ordering::Relaxed);
        let hits = inner.cache_hits.load(Ordering::Relaxed);
        let misses = inner.cache_misses.load(Ordering::Relaxed);
        PathQueryStats {
            query_count,
            total_latency: Duration::from_micros(total_micros),
            avg_latency: if query_count == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total_micros / query_count)
            },
            last_query_millis: inner.last_query_millis.load(Ordering::Relaxed),
            segments_per_query: if query_count == 0 {
                0.0
            } else {
                segments as f64 / query_count as f64
            },
            cache_hit_ratio: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
        }
    }

    fn note_query(&self, elapsed: Duration) {
        let inner = &self.inner;
        inner.query_count.fetch_add(1, Ordering::Relaxed);
        inner
            .total_latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        inner.last_query_millis.store(now_millis(), Ordering::Relaxed);
    }

    /// Validation, the same-node fast path, cross-tree rejection, and the
    /// query cache sit in front of the coalesced computation.
    async fn query_outer(
        inner: Arc<EngineInner>,
        token: CancellationToken,
        u: String,
        v: String,
    ) -> anyhow::Result<i64> {
        if token.is_cancelled() {
            return Err(GraphError::BuildCancelled.into());
        }
        if u.is_empty() || v.is_empty() {
            return Err(GraphError::InvalidNode.into());
        }
        let metrics = path_query_metrics();
        let agg = inner.aggregation.as_str();

        // Single-node path: one leaf query, no decomposition.
        if u == v {
            let (hld, offset) = inner.source.resolve(&u)?;
            let pos = hld
                .pos(&u)
                .ok_or_else(|| GraphError::NodeNotFound(u.clone()))?
                + offset;
            let tree_started = Instant::now();
            let value = inner.tree.query(pos, pos)?;
            metrics.observe_segment_tree_duration(tree_started.elapsed());
            metrics.observe_segment_count(1);
            metrics.record_query("success", agg);
            inner.segments_total.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        // In forest mode both endpoints must share a tree; rejected before
        // any segment-tree traffic.
        if let PathSource::Forest(forest) = &inner.source {
            let tu = forest.tree_id(&u)?;
            let tv = forest.tree_id(&v)?;
            if tu != tv {
                return Err(GraphError::NodesInDifferentTrees(u, v).into());
            }
        }

        let key = {
            let (a, b) = canonical_pair(inner.aggregation.symmetric_cache_key(), &u, &v);
            format!("pathquery:{}:{}:{}:{}", inner.graph_hash, a, b, inner.aggregation)
        };
        if let Some(cache) = &inner.query_cache {
            if let Some(value) = cache.get(&key) {
                metrics.record_cache_hit("query");
                metrics.record_query("cache_hit", agg);
                inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            metrics.record_cache_miss("query");
            inner.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let flight_inner = Arc::clone(&inner);
        let flight_key = key.clone();
        let value = inner
            .query_group
            .run(&key, async move {
                Self::compute(flight_inner, token, flight_key, u, v).await
            })
            .await
            .map_err(flatten_shared)?;
        Ok(value)
    }

    /// The leader's computation inside the singleflight group.
    async fn compute(
        inner: Arc<EngineInner>,
        token: CancellationToken,
        cache_key: String,
        u: String,
        v: String,
    ) -> anyhow::Result<i64> {
        let metrics = path_query_metrics();

        // A concurrent populator may have finished between the cache miss
        // and this flight starting.
        if let Some(cache) = &inner.query_cache {
            if let Some(value) = cache.get(&cache_key) {
                return Ok(value);
            }
        }

        let (hld, offset) = inner.source.resolve(&u)?;

        let _lca = Self::lca_cached(&inner, &token, &hld, &u, &v).await?;

        // Decompose and shift every segment into global position space.
        let decompose_started = Instant::now();
        let decomposed = hld.decompose_path(&token, &u, &v);
        Self::record_step(
            &inner,
            "hld.decompose_path",
            &u,
            &v,
            decompose_started,
            &decomposed,
            |segments| format!("segments={}", segments.len()),
        );
        let mut segments: Vec<PathSegment> = decomposed?;
        for segment in &mut segments {
            segment.start += offset;
            segment.end += offset;
        }

        if segments.len() > inner.max_tree_depth {
            anyhow::bail!(
                "path {u} -> {v} decomposed into {} segments, over the {} cap",
                segments.len(),
                inner.max_tree_depth
            );
        }

        let mut result = inner.aggregation.identity();
        for segment in &segments {
            if token.is_cancelled() {
                return Err(GraphError::BuildCancelled.into());
            }
            let (start, end) = if segment.start <= segment.end {
                (segment.start, segment.end)
            } else {
                (segment.end, segment.start)
            };
            let tree_started = Instant::now();
            let part = inner.tree.query(start, end)?;
            metrics.observe_segment_tree_duration(tree_started.elapsed());
            result = inner.aggregation.combine(result, part);
        }

        metrics.observe_segment_count(segments.len());
        metrics.record_query("success", inner.aggregation.as_str());
        inner
            .segments_total
            .fetch_add(segments.len() as u64, Ordering::Relaxed);

        if let Some(cache) = &inner.query_cache {
            cache.set(cache_key, result);
        }
        Ok(result)
    }

    /// LCA with caching and its own singleflight; the pair is always
    /// canonicalized since LCA is symmetric in its arguments.
    async fn lca_cached(
        inner: &Arc<EngineInner>,
        token: &CancellationToken,
        hld: &Arc<Hld>,
        u: &str,
        v: &str,
    ) -> anyhow::Result<String> {
        let metrics = path_query_metrics();
        let (a, b) = canonical_pair(true, u, v);
        let key = format!("lca:{}:{}:{}", inner.graph_hash, a, b);

        let lca_started = Instant::now();
        if let Some(cache) = &inner.lca_cache {
            if let Some(lca) = cache.get(&key) {
                metrics.record_cache_hit("lca");
                Self::record_step(
                    inner,
                    "hld.lca",
                    u,
                    v,
                    lca_started,
                    &Ok::<_, anyhow::Error>(lca.clone()),
                    |w| format!("LCA({u},{v})={w} [cached]"),
                );
                return Ok(lca);
            }
            metrics.record_cache_miss("lca");
        }

        let flight_inner = Arc::clone(inner);
        let flight_hld = Arc::clone(hld);
        let flight_token = token.clone();
        let flight_key = key.clone();
        let (fu, fv) = (u.to_string(), v.to_string());
        let computed = inner
            .lca_group
            .run(&key, async move {
                if let Some(cache) = &flight_inner.lca_cache {
                    if let Some(lca) = cache.get(&flight_key) {
                        return Ok(lca);
                    }
                }
                let lca = flight_hld.lca(&flight_token, &fu, &fv)?;
                if let Some(cache) = &flight_inner.lca_cache {
                    cache.set(flight_key, lca.clone());
                }
                Ok(lca)
            })
            .await
            .map_err(flatten_shared);

        Self::record_step(inner, "hld.lca", u, v, lca_started, &computed, |w| {
            format!("LCA({u},{v})={w}")
        });
        computed
    }

    /// Emit a sub-step record if a recorder is configured. Failures are
    /// swallowed; observation must never fail the query being observed.
    fn record_step<T>(
        inner: &Arc<EngineInner>,
        tool: &str,
        u: &str,
        v: &str,
        started: Instant,
        outcome: &anyhow::Result<T>,
        summarize: impl FnOnce(&T) -> String,
    ) {
        let recorder = match &inner.recorder {
            Some(recorder) => recorder,
            None => return,
        };
        let step = inner.step_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut record = StepRecord::begin(&inner.session_id, step, tool, u, v);
        record.duration_micros = started.elapsed().as_micros() as i64;
        match outcome {
            Ok(value) => {
                record.outcome = StepOutcome::Success;
                record.summary = summarize(value);
            }
            Err(err) => {
                record.outcome = StepOutcome::Failure;
                record.error_category = Some(
                    err.downcast_ref::<GraphError>()
                        .map(GraphError::metric_label)
                        .unwrap_or("internal")
                        .to_string(),
                );
                record.summary = format!("{tool} failed");
            }
        }
        if let Err(err) = recorder.record(record) {
            debug!(error = %err, tool, "sub-step recording failed; continuing");
        }
    }
}

/// Order a pair canonically (lexicographic) when the operation is symmetric.
fn canonical_pair<'a>(symmetric: bool, u: &'a str, v: &'a str) -> (&'a str, &'a str) {
    if symmetric && v < u {
        (v, u)
    } else {
        (u, v)
    }
}

/// Lay out per-node values into global position order for building the
/// engine's segment tree. Missing nodes get `default`.
pub fn layout_values(
    source: &PathSource,
    values: &HashMap<String, i64>,
    default: i64,
) -> Vec<i64> {
    let total = match source {
        PathSource::Single(hld) => hld.node_count(),
        PathSource::Forest(forest) => forest.total_nodes(),
    };
    (0..total)
        .map(|pos| {
            source
                .node_at_global_position(pos)
                .and_then(|node| values.get(node).copied())
                .unwrap_or(default)
        })
        .collect()
}
