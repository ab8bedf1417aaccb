//! Integration tests for the read-only query adapter: caching discipline,
//! invalidation, and the closed-state latch.

use std::sync::Arc;

use relgraph::{
    now_millis, Graph, GraphError, GraphQueryService, HierarchicalGraph, Language, Location,
    QueryConfig, RelationType, SourceSpan, Symbol, SymbolKind,
};
use tokio_util::sync::CancellationToken;

fn sym(id: &str, name: &str, file: &str) -> Arc<Symbol> {
    Symbol::new(
        id,
        name,
        SymbolKind::Function,
        file,
        SourceSpan::point(1, 1),
        Language::Go,
    )
}

fn loc(file: &str, line: u32) -> Location {
    Location::new(file, SourceSpan::point(line, 1))
}

/// Scenario graph: A -> B, B -> C, A -> C (Calls), plus an interface edge.
fn service() -> GraphQueryService {
    let mut g = Graph::new("/proj");
    g.add_node(sym("a.go:1:A", "A", "a.go")).unwrap();
    g.add_node(sym("b.go:1:B", "B", "b.go")).unwrap();
    g.add_node(sym("c.go:1:C", "C", "c.go")).unwrap();
    g.add_node(
        Symbol::new(
            "i.go:1:Iface",
            "Iface",
            SymbolKind::Interface,
            "i.go",
            SourceSpan::point(1, 1),
            Language::Go,
        ),
    )
    .unwrap();
    g.add_edge("a.go:1:A", "b.go:1:B", RelationType::Calls, loc("a.go", 10))
        .unwrap();
    g.add_edge("b.go:1:B", "c.go:1:C", RelationType::Calls, loc("b.go", 10))
        .unwrap();
    g.add_edge("a.go:1:A", "c.go:1:C", RelationType::Calls, loc("a.go", 20))
        .unwrap();
    g.add_edge(
        "c.go:1:C",
        "i.go:1:Iface",
        RelationType::Implements,
        loc("c.go", 1),
    )
    .unwrap();
    g.freeze();

    GraphQueryService::new(
        Arc::new(HierarchicalGraph::new(Arc::new(g))),
        None,
        7,
        now_millis(),
        QueryConfig::default(),
    )
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn call_chain_is_shortest_and_copy_safe() {
    let service = service();
    let chain = service
        .get_call_chain(&token(), "a.go:1:A", "c.go:1:C", 10)
        .await
        .unwrap();
    assert_eq!(chain, vec!["a.go:1:A", "c.go:1:C"]);

    // Mutating the returned container must not poison later calls.
    let mut stolen = chain;
    stolen.push("poison".to_string());
    let chain2 = service
        .get_call_chain(&token(), "a.go:1:A", "c.go:1:C", 10)
        .await
        .unwrap();
    assert_eq!(chain2, vec!["a.go:1:A", "c.go:1:C"]);
}

#[tokio::test]
async fn callers_cache_miss_after_invalidation() {
    let service = service();

    let first = service.find_callers(&token(), "c.go:1:C").await.unwrap();
    let baseline = service.query_cache_stats();

    service.invalidate_cache();
    let second = service.find_callers(&token(), "c.go:1:C").await.unwrap();
    let after = service.query_cache_stats();

    assert_eq!(after.callers.misses, baseline.callers.misses + 1);
    let mut a: Vec<&str> = first.symbols.iter().map(|s| s.id.as_str()).collect();
    let mut b: Vec<&str> = second.symbols.iter().map(|s| s.id.as_str()).collect();
    a.sort_unstable();
    b.sort_unstable();
    assert_eq!(a, b);
}

#[tokio::test]
async fn hit_rate_reflects_cache_traffic() {
    let service = service();
    service.find_callers(&token(), "c.go:1:C").await.unwrap();
    service.find_callers(&token(), "c.go:1:C").await.unwrap();
    let stats = service.query_cache_stats();
    assert!(stats.total_hits >= 1);
    assert!(stats.total_misses >= 1);
    assert!(stats.hit_rate > 0.0 && stats.hit_rate <= 1.0);
}

#[tokio::test]
async fn implementations_and_references_read_incoming_edges() {
    let service = service();
    let impls = service.find_implementations("i.go:1:Iface").unwrap();
    assert_eq!(impls.len(), 1);
    assert_eq!(impls[0].name, "C");

    let refs = service.find_references("c.go:1:C").unwrap();
    assert!(refs.is_empty());
}

#[tokio::test]
async fn closed_service_refuses_everything() {
    let service = service();
    service.close();
    service.close();

    assert!(service.is_closed());
    assert_eq!(
        service.find_symbol_by_id("a.go:1:A").unwrap_err(),
        GraphError::GraphQueryClosed
    );
    assert_eq!(
        service.call_edge_count().unwrap_err(),
        GraphError::GraphQueryClosed
    );
    assert_eq!(
        service.dead_code().unwrap_err(),
        GraphError::GraphQueryClosed
    );
    let err = service
        .get_call_chain(&token(), "a.go:1:A", "c.go:1:C", 10)
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<GraphError>(),
        Some(&GraphError::GraphQueryClosed)
    );
    let err = service.communities().await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<GraphError>(),
        Some(&GraphError::GraphQueryClosed)
    );
}

#[tokio::test]
async fn generation_and_refresh_metadata_are_reported_verbatim() {
    let service = service();
    assert_eq!(service.generation(), 7);
    assert!(service.last_refresh_millis() > 0);
}

#[tokio::test]
async fn cycle_detection_over_the_calls_subgraph() {
    let service = service();
    assert!(!service.has_cycle_from("a.go:1:A").unwrap());
    assert_eq!(
        service.has_cycle_from("ghost").unwrap_err(),
        GraphError::NodeNotFound("ghost".to_string())
    );
}

#[tokio::test]
async fn analytics_subsystem_is_reachable_through_the_adapter() {
    let service = service();

    let hotspots = service.hot_spots(2).unwrap();
    assert_eq!(hotspots.len(), 2);

    let dead = service.dead_code().unwrap();
    assert_eq!(dead, vec!["a.go:1:A"]);

    assert!(service.cyclic_dependencies().unwrap().is_empty());

    let ranks = service.page_rank(&token()).await.unwrap();
    assert_eq!(ranks.len(), 4);

    let communities = service.communities().await.unwrap();
    assert!(!communities.is_empty());
}

#[tokio::test]
async fn call_chain_depth_is_clamped() {
    let service = service();
    // max_depth of 0 clamps to 1; the direct edge is still found.
    let chain = service
        .get_call_chain(&token(), "a.go:1:A", "c.go:1:C", 0)
        .await
        .unwrap();
    assert_eq!(chain.len(), 2);

    // B -> C is one hop; A -> B -> C needs two, A -> C needs one.
    let chain = service
        .get_call_chain(&token(), "b.go:1:B", "a.go:1:A", 100)
        .await
        .unwrap();
    assert!(chain.is_empty());
}
