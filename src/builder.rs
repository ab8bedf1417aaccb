//! Incremental graph construction from parser output
//!
//! The builder is the single writer for a graph in `Building` state. Build
//! failures accumulate instead of aborting: a file that fails to merge lands
//! in `file_errors`, an edge with a missing endpoint or bad type lands in
//! `edge_errors`, and the build keeps going. Only cancellation or a capacity
//! stop marks the whole result incomplete.
//!
//! Call targets that do not resolve to a known symbol ID are resolved by
//! name where unambiguous; unknown targets get placeholder nodes so the
//! call structure stays connected for later analysis.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::errors::GraphError;
use crate::graph::{Graph, GraphOptions};
use crate::types::{
    Language, ParseResult, RawRelation, RelationType, SourceSpan, Symbol, SymbolKind,
};

/// A file-level build failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileError {
    pub file_path: String,
    pub error: String,
}

/// An edge-level build failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeError {
    pub from_id: String,
    pub to_id: String,
    pub relation_type: RelationType,
    pub error: String,
}

/// Counters describing one build run. Durations are recorded in both
/// milliseconds and microseconds; small incremental builds routinely finish
/// under a millisecond.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildStats {
    pub files_processed: usize,
    pub files_failed: usize,
    pub nodes_created: usize,
    pub edges_created: usize,
    /// Nodes synthesized for call targets with no parsed symbol.
    pub placeholder_nodes: usize,
    /// Call sites whose target name matched more than one symbol.
    pub ambiguous_resolves: usize,
    pub interface_impl_edges: usize,
    pub resolved_call_edges: usize,
    pub unresolved_call_edges: usize,
    pub duration_millis: i64,
    pub duration_micros: i64,
}

/// Outcome of a build: the graph plus everything that went wrong on the way.
#[derive(Debug)]
pub struct BuildResult {
    pub graph: Graph,
    pub file_errors: Vec<FileError>,
    pub edge_errors: Vec<EdgeError>,
    pub stats: BuildStats,
    /// Set only when the build was cancelled or hit a capacity limit.
    pub incomplete: bool,
}

/// Single-writer incremental builder over a `Building` graph.
pub struct GraphBuilder {
    graph: Graph,
    file_errors: Vec<FileError>,
    edge_errors: Vec<EdgeError>,
    stats: BuildStats,
    incomplete: bool,
    started: Instant,
}

impl GraphBuilder {
    pub fn new(project_root: impl Into<String>, options: GraphOptions) -> Self {
        Self {
            graph: Graph::with_options(project_root, options),
            file_errors: Vec::new(),
            edge_errors: Vec::new(),
            stats: BuildStats::default(),
            incomplete: false,
            started: Instant::now(),
        }
    }

    /// The graph under construction, for inspection between applies.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Apply a batch of parse results, checking cancellation between files.
    #[instrument(skip(self, results, token), fields(files = results.len()))]
    pub fn apply(&mut self, results: &[ParseResult], token: &CancellationToken) {
        // Symbols across the whole batch land first so cross-file edges in
        // the same batch resolve by ID instead of by name.
        for result in results {
            if token.is_cancelled() {
                self.incomplete = true;
                return;
            }
            self.merge_symbols(result);
        }
        for result in results {
            if token.is_cancelled() {
                self.incomplete = true;
                return;
            }
            self.merge_relations(result);
        }
    }

    /// Re-parse support: drop every node from `path`, then merge the fresh
    /// parse result for it.
    #[instrument(skip(self, result))]
    pub fn replace_file(&mut self, path: &str, result: &ParseResult) {
        match self.graph.remove_file(path) {
            Ok(removed) => {
                debug!(path, removed, "replaced file contents");
            }
            Err(err) => {
                self.file_errors.push(FileError {
                    file_path: path.to_string(),
                    error: err.to_string(),
                });
                self.stats.files_failed += 1;
                return;
            }
        }
        self.merge_symbols(result);
        self.merge_relations(result);
    }

    fn merge_symbols(&mut self, result: &ParseResult) {
        let (added, err) = self.graph.merge_parse_result(result);
        self.stats.nodes_created += added;
        self.stats.files_processed += 1;
        if let Some(err) = err {
            self.file_errors.push(FileError {
                file_path: result.file_path.clone(),
                error: err.to_string(),
            });
            self.stats.files_failed += 1;
            if matches!(
                err,
                GraphError::MaxNodesExceeded(_) | GraphError::MemoryLimitExceeded
            ) {
                self.incomplete = true;
            }
        }
    }

    fn merge_relations(&mut self, result: &ParseResult) {
        for relation in &result.relations {
            if let Err(err) = self.add_relation(relation) {
                self.edge_errors.push(EdgeError {
                    from_id: relation.from_id.clone(),
                    to_id: relation.to_id.clone(),
                    relation_type: relation.relation_type,
                    error: err.to_string(),
                });
                if matches!(err, GraphError::MaxEdgesExceeded(_)) {
                    self.incomplete = true;
                    return;
                }
            }
        }
    }

    fn add_relation(&mut self, relation: &RawRelation) -> Result<(), GraphError> {
        if self.graph.get_node(&relation.from_id).is_none() {
            return Err(GraphError::NodeNotFound(relation.from_id.clone()));
        }

        let (target, via_placeholder) = self.resolve_target(relation);
        self.graph.add_edge(
            &relation.from_id,
            &target,
            relation.relation_type,
            relation.location.clone(),
        )?;
        self.stats.edges_created += 1;
        match relation.relation_type {
            RelationType::Implements => self.stats.interface_impl_edges += 1,
            RelationType::Calls if via_placeholder => self.stats.unresolved_call_edges += 1,
            RelationType::Calls => self.stats.resolved_call_edges += 1,
            _ => {}
        }
        Ok(())
    }

    /// Resolve a relation target to a node ID: exact ID first, then the
    /// name index, then a synthesized placeholder. The flag reports whether
    /// a placeholder had to stand in.
    fn resolve_target(&mut self, relation: &RawRelation) -> (String, bool) {
        if self.graph.get_node(&relation.to_id).is_some() {
            return (relation.to_id.clone(), false);
        }

        let matches: Vec<String> = self
            .graph
            .nodes_by_name(&relation.to_id)
            .iter()
            .map(|node| node.id.clone())
            .collect();
        match matches.len() {
            0 => (self.make_placeholder(relation), true),
            1 => (matches.into_iter().next().expect("one match"), false),
            _ => {
                // Counted per call site: each ambiguous record bumps it once.
                self.stats.ambiguous_resolves += 1;
                warn!(
                    target = %relation.to_id,
                    candidates = matches.len(),
                    "ambiguous call target; using first match"
                );
                (matches.into_iter().next().expect("at least one match"), false)
            }
        }
    }

    fn make_placeholder(&mut self, relation: &RawRelation) -> String {
        let id = format!("placeholder:{}", relation.to_id);
        if self.graph.get_node(&id).is_none() {
            let symbol = Symbol::new(
                id.clone(),
                relation.to_id.clone(),
                SymbolKind::Unknown,
                String::new(),
                SourceSpan::default(),
                Language::Other,
            );
            if self.graph.add_node(symbol).is_ok() {
                self.stats.placeholder_nodes += 1;
            }
        }
        id
    }

    /// Freeze the graph and hand back the accumulated result.
    pub fn finish(mut self) -> BuildResult {
        self.graph.freeze();
        let elapsed = self.started.elapsed();
        self.stats.duration_millis = elapsed.as_millis() as i64;
        self.stats.duration_micros = elapsed.as_micros() as i64;
        debug!(
            nodes = self.stats.nodes_created,
            edges = self.stats.edges_created,
            files = self.stats.files_processed,
            incomplete = self.incomplete,
            "build finished"
        );
        BuildResult {
            graph: self.graph,
            file_errors: self.file_errors,
            edge_errors: self.edge_errors,
            stats: self.stats,
            incomplete: self.incomplete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphState;
    use crate::types::Location;
    use std::sync::Arc;

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

    fn relation(from: &str, to: &str, rel: RelationType) -> RawRelation {
        RawRelation {
            from_id: from.to_string(),
            to_id: to.to_string(),
            relation_type: rel,
            location: Location::new("a.go", SourceSpan::point(10, 1)),
        }
    }

    fn parse_result(file: &str, symbols: Vec<Arc<Symbol>>, relations: Vec<RawRelation>) -> ParseResult {
        ParseResult {
            file_path: file.to_string(),
            symbols,
            relations,
        }
    }

    #[test]
    fn build_resolves_cross_file_edges_by_id() {
        let mut builder = GraphBuilder::new("/proj", GraphOptions::default());
        let results = vec![
            parse_result(
                "a.go",
                vec![sym("a.go:1:A", "A", "a.go")],
                vec![relation("a.go:1:A", "b.go:1:B", RelationType::Calls)],
            ),
            parse_result("b.go", vec![sym("b.go:1:B", "B", "b.go")], vec![]),
        ];
        builder.apply(&results, &CancellationToken::new());
        let result = builder.finish();

        assert!(!result.incomplete);
        assert!(result.file_errors.is_empty());
        assert!(result.edge_errors.is_empty());
        assert_eq!(result.stats.nodes_created, 2);
        assert_eq!(result.stats.edges_created, 1);
        assert_eq!(result.stats.resolved_call_edges, 1);
        assert_eq!(result.graph.state(), GraphState::ReadOnly);
    }

    #[test]
    fn unknown_targets_become_placeholders() {
        let mut builder = GraphBuilder::new("/proj", GraphOptions::default());
        let results = vec![parse_result(
            "a.go",
            vec![sym("a.go:1:A", "A", "a.go")],
            vec![relation("a.go:1:A", "externalFn", RelationType::Calls)],
        )];
        builder.apply(&results, &CancellationToken::new());
        let result = builder.finish();

        assert_eq!(result.stats.placeholder_nodes, 1);
        assert_eq!(result.stats.unresolved_call_edges, 1);
        let placeholder = result.graph.get_node("placeholder:externalFn").unwrap();
        assert_eq!(placeholder.symbol.kind, SymbolKind::Unknown);
        assert_eq!(placeholder.incoming().len(), 1);
    }

    #[test]
    fn targets_resolve_by_unique_name() {
        let mut builder = GraphBuilder::new("/proj", GraphOptions::default());
        let results = vec![
            parse_result("b.go", vec![sym("b.go:1:Helper", "Helper", "b.go")], vec![]),
            parse_result(
                "a.go",
                vec![sym("a.go:1:A", "A", "a.go")],
                vec![relation("a.go:1:A", "Helper", RelationType::Calls)],
            ),
        ];
        builder.apply(&results, &CancellationToken::new());
        let result = builder.finish();

        assert_eq!(result.stats.placeholder_nodes, 0);
        let helper = result.graph.get_node("b.go:1:Helper").unwrap();
        assert_eq!(helper.incoming().len(), 1);
    }

    #[test]
    fn ambiguous_names_are_counted_per_call_site() {
        let mut builder = GraphBuilder::new("/proj", GraphOptions::default());
        let results = vec![
            parse_result(
                "m.go",
                vec![
                    sym("a.go:1:Helper", "Helper", "a.go"),
                    sym("b.go:1:Helper", "Helper", "b.go"),
                    sym("m.go:1:Main", "Main", "m.go"),
                ],
                vec![
                    relation("m.go:1:Main", "Helper", RelationType::Calls),
                    relation("m.go:1:Main", "Helper", RelationType::Calls),
                ],
            ),
        ];
        builder.apply(&results, &CancellationToken::new());
        let result = builder.finish();
        assert_eq!(result.stats.ambiguous_resolves, 2);
    }

    #[test]
    fn missing_source_is_an_edge_error_not_a_failure() {
        let mut builder = GraphBuilder::new("/proj", GraphOptions::default());
        let results = vec![parse_result(
            "a.go",
            vec![sym("a.go:1:A", "A", "a.go")],
            vec![relation("ghost", "a.go:1:A", RelationType::Calls)],
        )];
        builder.apply(&results, &CancellationToken::new());
        let result = builder.finish();

        assert!(!result.incomplete);
        assert_eq!(result.edge_errors.len(), 1);
        assert_eq!(result.edge_errors[0].from_id, "ghost");
        assert_eq!(result.graph.edge_count(), 0);
    }

    #[test]
    fn cancellation_marks_the_build_incomplete() {
        let mut builder = GraphBuilder::new("/proj", GraphOptions::default());
        let token = CancellationToken::new();
        token.cancel();
        builder.apply(
            &[parse_result("a.go", vec![sym("a.go:1:A", "A", "a.go")], vec![])],
            &token,
        );
        let result = builder.finish();
        assert!(result.incomplete);
        assert_eq!(result.stats.nodes_created, 0);
    }

    #[test]
    fn capacity_stop_marks_incomplete_and_keeps_partials() {
        let mut builder =
            GraphBuilder::new("/proj", GraphOptions::default().with_max_nodes(2));
        let results = vec![parse_result(
            "a.go",
            vec![
                sym("a.go:1:A", "A", "a.go"),
                sym("a.go:2:B", "B", "a.go"),
                sym("a.go:3:C", "C", "a.go"),
            ],
            vec![],
        )];
        builder.apply(&results, &CancellationToken::new());
        let result = builder.finish();

        assert!(result.incomplete);
        assert_eq!(result.graph.node_count(), 2);
        assert_eq!(result.file_errors.len(), 1);
    }

    #[test]
    fn replace_file_swaps_contents() {
        let mut builder = GraphBuilder::new("/proj", GraphOptions::default());
        builder.apply(
            &[parse_result(
                "a.go",
                vec![sym("a.go:1:Old", "Old", "a.go")],
                vec![],
            )],
            &CancellationToken::new(),
        );
        builder.replace_file(
            "a.go",
            &parse_result("a.go", vec![sym("a.go:1:New", "New", "a.go")], vec![]),
        );
        let result = builder.finish();
        assert!(result.graph.get_node("a.go:1:Old").is_none());
        assert!(result.graph.get_node("a.go:1:New").is_some());
    }

    #[test]
    fn durations_are_recorded_in_both_units() {
        let builder = GraphBuilder::new("/proj", GraphOptions::default());
        let result = builder.finish();
        assert!(result.stats.duration_micros >= result.stats.duration_millis * 1000);
    }
}
