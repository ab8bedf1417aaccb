//! Integration tests for the level-synchronous parallel BFS. Ordering at
//! parallel levels is not asserted, only membership and uniqueness.

use std::collections::HashSet;
use std::sync::Arc;

use relgraph::{
    call_graph_parallel, reverse_call_graph_parallel, Graph, Language, Location, RelationType,
    SourceSpan, Symbol, SymbolKind, TraversalOptions,
};
use tokio_util::sync::CancellationToken;

fn add_fn(graph: &mut Graph, id: &str) {
    graph
        .add_node(Symbol::new(
            id,
            id,
            SymbolKind::Function,
            format!("{id}.go"),
            SourceSpan::point(1, 1),
            Language::Go,
        ))
        .unwrap();
}

fn call(graph: &mut Graph, from: &str, to: &str) {
    graph
        .add_edge(
            from,
            to,
            RelationType::Calls,
            Location::new(format!("{from}.go"), SourceSpan::point(5, 1)),
        )
        .unwrap();
}

/// Star scenario: root R, 64 children c_i, 5 grandchildren each.
fn star() -> Arc<Graph> {
    let mut g = Graph::new("/proj");
    add_fn(&mut g, "R");
    for i in 0..64 {
        let child = format!("c{i}");
        add_fn(&mut g, &child);
        call(&mut g, "R", &child);
        for j in 0..5 {
            let grandchild = format!("c{i}g{j}");
            add_fn(&mut g, &grandchild);
            call(&mut g, &child, &grandchild);
        }
    }
    g.freeze();
    Arc::new(g)
}

#[tokio::test]
async fn star_membership_is_exact_at_the_parallel_boundary() {
    let graph = star();
    let result = call_graph_parallel(
        &graph,
        "R",
        TraversalOptions {
            max_depth: 3,
            limit: 1000,
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.visited_nodes.len(), 385);
    assert!(!result.truncated);

    let unique: HashSet<&str> = result.visited_nodes.iter().map(String::as_str).collect();
    assert_eq!(unique.len(), 385, "every node appears exactly once");
    assert!(unique.contains("R"));
    for i in 0..64 {
        assert!(unique.contains(format!("c{i}").as_str()));
        for j in 0..5 {
            assert!(unique.contains(format!("c{i}g{j}").as_str()));
        }
    }

    // One discovery edge per non-root node.
    assert_eq!(result.edges.len(), 384);
}

#[tokio::test]
async fn forward_and_reverse_traversals_mirror_each_other() {
    let mut g = Graph::new("/proj");
    for id in ["a", "b", "c"] {
        add_fn(&mut g, id);
    }
    call(&mut g, "a", "b");
    call(&mut g, "b", "c");
    g.freeze();
    let graph = Arc::new(g);
    let token = CancellationToken::new();

    let forward = call_graph_parallel(&graph, "a", TraversalOptions::default(), &token)
        .await
        .unwrap();
    let reverse = reverse_call_graph_parallel(&graph, "c", TraversalOptions::default(), &token)
        .await
        .unwrap();

    assert_eq!(forward.visited_nodes, vec!["a", "b", "c"]);
    assert_eq!(reverse.visited_nodes, vec!["c", "b", "a"]);
    assert_eq!(forward.depth, 2);
    assert_eq!(reverse.depth, 2);
}

#[tokio::test]
async fn limit_reached_sets_truncated_and_respects_the_bound() {
    let graph = star();
    let result = call_graph_parallel(
        &graph,
        "R",
        TraversalOptions {
            max_depth: 3,
            limit: 50,
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(result.truncated);
    assert!(result.visited_nodes.len() <= 50);
}

#[tokio::test]
async fn concurrent_traversals_share_the_frozen_graph() {
    let graph = star();
    let token = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let graph = Arc::clone(&graph);
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            call_graph_parallel(&graph, "R", TraversalOptions::default(), &token).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.visited_nodes.len(), 385);
    }
}

#[tokio::test]
async fn diamond_shared_target_is_visited_once() {
    let mut g = Graph::new("/proj");
    for id in ["a", "b", "c", "d"] {
        add_fn(&mut g, id);
    }
    call(&mut g, "a", "b");
    call(&mut g, "a", "c");
    call(&mut g, "b", "d");
    call(&mut g, "c", "d");
    g.freeze();
    let graph = Arc::new(g);

    let result = call_graph_parallel(
        &graph,
        "a",
        TraversalOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(result.visited_nodes.len(), 4);
    assert_eq!(result.edges.len(), 3);
}
