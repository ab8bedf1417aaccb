// RelGraph - Code-Relationship Graph Core
// Root library module

pub mod analytics;
pub mod builder;
pub mod dominators;
pub mod errors;
pub mod graph;
pub mod hierarchy;
pub mod hld;
pub mod hld_forest;
pub mod lru_cache;
pub mod metrics;
pub mod observability;
pub mod path_query;
pub mod query;
pub mod recorder;
pub mod segment_tree;
pub mod singleflight;
pub mod symbol_index;
pub mod traversal;
pub mod types;
pub mod watcher;

// Re-export key types
pub use errors::{is_graph_error, GraphError};

pub use types::{
    now_micros, now_millis, Language, Location, ParseResult, RawRelation, RelationType,
    SourceSpan, Symbol, SymbolKind,
};

pub use graph::{
    Edge, Graph, GraphOptions, GraphState, Node, DEFAULT_MAX_EDGES, DEFAULT_MAX_NODES,
};

pub use builder::{BuildResult, BuildStats, EdgeError, FileError, GraphBuilder};

pub use hierarchy::HierarchicalGraph;

// Re-export the path-aggregate engine surface
pub use hld::{Hld, PathSegment};
pub use hld_forest::HldForest;
pub use path_query::{
    layout_values, PathQueryEngine, PathQueryOptions, PathQueryStats, PathSource,
};
pub use segment_tree::{Aggregation, SegmentTree};

// Re-export traversal
pub use traversal::{
    call_graph_parallel, reverse_call_graph_parallel, TraversalOptions, TraversalResult,
};

// Re-export analytics
pub use analytics::{Community, GraphAnalytics, HotSpot};
pub use dominators::{
    control_dependence, post_dominators, ControlDependence, ControlDependenceStats, DominatorTree,
};

// Re-export the query adapter
pub use query::{
    CacheCounters, GraphQueryService, PathResult, QueryCacheStats, QueryConfig, QueryResult,
};
pub use symbol_index::{GraphSymbolIndex, SymbolIndex};

// Re-export caching and coalescing primitives
pub use lru_cache::StatsCache;
pub use singleflight::Group;

// Re-export sub-step recording contract
pub use recorder::{StepOutcome, StepRecord, StepRecorder, VecRecorder};

// Re-export observability helpers
pub use metrics::{path_query_metrics, MetricsSnapshot, PathQueryMetrics};
pub use observability::{
    init_logging, init_logging_with_level, operation_counters, with_trace_id, OpTimer, Operation,
};

// Re-export the file watcher
pub use watcher::{ChangeKind, FileChange, FileWatcher, WatcherConfig};
