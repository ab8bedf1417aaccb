//! End-to-end tests for the HLD + segment-tree path-aggregate engine.

use std::collections::HashMap;
use std::sync::Arc;

use relgraph::{
    layout_values, Aggregation, GraphError, Hld, HldForest, PathQueryEngine, PathQueryOptions,
    PathSource, SegmentTree,
};
use tokio_util::sync::CancellationToken;

/// The scenario tree: A -> B, A -> C, B -> D, D -> E, C -> F, F -> G, F -> H.
fn scenario_children() -> HashMap<String, Vec<String>> {
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    children.insert("A".into(), vec!["B".into(), "C".into()]);
    children.insert("B".into(), vec!["D".into()]);
    children.insert("D".into(), vec!["E".into()]);
    children.insert("C".into(), vec!["F".into()]);
    children.insert("F".into(), vec!["G".into(), "H".into()]);
    children
}

/// Same tree, children listed in a different adjacency order.
fn scenario_children_reordered() -> HashMap<String, Vec<String>> {
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    children.insert("A".into(), vec!["C".into(), "B".into()]);
    children.insert("B".into(), vec!["D".into()]);
    children.insert("D".into(), vec!["E".into()]);
    children.insert("C".into(), vec!["F".into()]);
    children.insert("F".into(), vec!["H".into(), "G".into()]);
    children
}

fn engine_over(
    children: &HashMap<String, Vec<String>>,
    aggregation: Aggregation,
    options: PathQueryOptions,
) -> PathQueryEngine {
    let hld = Arc::new(Hld::build("A", children).unwrap());
    let source = PathSource::Single(hld);
    let values: HashMap<String, i64> = ["A", "B", "C", "D", "E", "F", "G", "H"]
        .iter()
        .map(|n| (n.to_string(), 1i64))
        .collect();
    let laid_out = layout_values(&source, &values, 0);
    let tree = Arc::new(SegmentTree::build(&laid_out, aggregation));
    PathQueryEngine::new(source, tree, aggregation, options).unwrap()
}

#[tokio::test]
async fn path_sum_over_the_scenario_tree() {
    let engine = engine_over(
        &scenario_children(),
        Aggregation::Sum,
        PathQueryOptions::default(),
    );
    let token = CancellationToken::new();

    // A..E passes through A, B, D, E.
    assert_eq!(engine.path_sum(&token, "A", "E").await.unwrap(), 4);
    assert_eq!(engine.path_sum(&token, "A", "A").await.unwrap(), 1);
}

#[tokio::test]
async fn path_sum_is_insertion_order_independent() {
    let token = CancellationToken::new();
    let first = engine_over(
        &scenario_children(),
        Aggregation::Sum,
        PathQueryOptions::default(),
    );
    let second = engine_over(
        &scenario_children_reordered(),
        Aggregation::Sum,
        PathQueryOptions::default(),
    );

    for (u, v) in [("A", "E"), ("E", "G"), ("G", "H"), ("B", "C"), ("A", "A")] {
        assert_eq!(
            first.path_sum(&token, u, v).await.unwrap(),
            second.path_sum(&token, u, v).await.unwrap(),
            "path {u} -> {v}"
        );
    }
}

#[tokio::test]
async fn min_max_are_symmetric_in_endpoint_order() {
    let token = CancellationToken::new();
    for aggregation in [Aggregation::Min, Aggregation::Max] {
        let engine = engine_over(&scenario_children(), aggregation, PathQueryOptions::default());
        for (u, v) in [("E", "H"), ("A", "G"), ("B", "F")] {
            assert_eq!(
                engine.path_query(&token, u, v).await.unwrap(),
                engine.path_query(&token, v, u).await.unwrap(),
                "{aggregation:?} {u} <-> {v}"
            );
        }
    }
}

#[tokio::test]
async fn distance_properties() {
    let children = scenario_children();
    let hld = Hld::build("A", &children).unwrap();
    let token = CancellationToken::new();

    for node in ["A", "B", "E", "H"] {
        assert_eq!(hld.distance(&token, node, node).unwrap(), 0);
    }
    for (u, v) in [("E", "H"), ("A", "G"), ("B", "C")] {
        let d = hld.distance(&token, u, v).unwrap();
        assert_eq!(d, hld.distance(&token, v, u).unwrap());
        assert!(d > 0);
    }
}

#[tokio::test]
async fn repeated_query_hits_the_cache_with_an_identical_value() {
    let engine = engine_over(
        &scenario_children(),
        Aggregation::Sum,
        PathQueryOptions::default().with_query_cache(true),
    );
    let token = CancellationToken::new();

    let key = engine.path_query_cache_key("E", "G");
    assert!(key.starts_with("pathquery:"));
    assert!(key.ends_with(":sum"));

    let first = engine.path_query(&token, "E", "G").await.unwrap();
    let stats_before = engine.stats();
    let second = engine.path_query(&token, "E", "G").await.unwrap();
    let stats_after = engine.stats();

    assert_eq!(first, second);
    assert!(stats_after.cache_hit_ratio > stats_before.cache_hit_ratio);
}

#[tokio::test]
async fn gcd_engine_aggregates_over_paths() {
    let children = scenario_children();
    let hld = Arc::new(Hld::build("A", &children).unwrap());
    let source = PathSource::Single(hld);
    let values: HashMap<String, i64> = [
        ("A", 12i64),
        ("B", 18),
        ("C", 9),
        ("D", 24),
        ("E", 6),
        ("F", 27),
        ("G", 81),
        ("H", 3),
    ]
    .iter()
    .map(|(n, v)| (n.to_string(), *v))
    .collect();
    let laid_out = layout_values(&source, &values, 0);
    let tree = Arc::new(SegmentTree::build(&laid_out, Aggregation::Gcd));
    let engine =
        PathQueryEngine::new(source, tree, Aggregation::Gcd, PathQueryOptions::default()).unwrap();

    let token = CancellationToken::new();
    // gcd(12, 18, 24, 6) over A -> E.
    assert_eq!(engine.path_gcd(&token, "A", "E").await.unwrap(), 6);
    // gcd over G -> H passes F: gcd(81, 27, 3) = 3.
    assert_eq!(engine.path_gcd(&token, "G", "H").await.unwrap(), 3);
}

#[tokio::test]
async fn forest_rejects_cross_tree_and_serves_within_tree() {
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    children.insert("R1".into(), vec!["L1".into()]);
    children.insert("R2".into(), vec!["L2".into()]);
    let forest = Arc::new(HldForest::build(&["R1".into(), "R2".into()], &children).unwrap());
    let source = PathSource::Forest(forest);

    let values: HashMap<String, i64> = ["R1", "L1", "R2", "L2"]
        .iter()
        .map(|n| (n.to_string(), 1i64))
        .collect();
    let laid_out = layout_values(&source, &values, 0);
    let tree = Arc::new(SegmentTree::build(&laid_out, Aggregation::Sum));
    let engine =
        PathQueryEngine::new(source, tree, Aggregation::Sum, PathQueryOptions::default()).unwrap();

    let token = CancellationToken::new();
    let err = engine.path_query(&token, "L1", "L2").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GraphError>(),
        Some(GraphError::NodesInDifferentTrees(_, _))
    ));

    assert_eq!(engine.path_query(&token, "R1", "L1").await.unwrap(), 2);
    assert_eq!(engine.path_query(&token, "L2", "L2").await.unwrap(), 1);
}

#[tokio::test]
async fn hld_validates_on_random_bushy_trees() {
    // A few deterministic shapes: chains, stars, and mixed fans.
    for fan in [1usize, 2, 3, 7] {
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut next_id = 1usize;
        let mut frontier = vec!["n0".to_string()];
        for _ in 0..4 {
            let mut new_frontier = Vec::new();
            for parent in &frontier {
                let kids: Vec<String> = (0..fan)
                    .map(|_| {
                        let id = format!("n{next_id}");
                        next_id += 1;
                        id
                    })
                    .collect();
                children.insert(parent.clone(), kids.clone());
                new_frontier.extend(kids);
            }
            frontier = new_frontier;
        }

        let hld = Hld::build("n0", &children).unwrap();
        hld.validate().unwrap();
        assert_eq!(hld.node_count(), next_id);
    }
}
