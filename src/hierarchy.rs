//! Package-level groupings over a frozen graph
//!
//! Derives a package for every node from the parent directory of its file
//! path. Built once at construction, then read-only; the query service
//! layers its symbol lookups on top of this view.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::graph::{Graph, Node};

/// Read-only hierarchical view of a graph: packages -> files -> nodes.
pub struct HierarchicalGraph {
    graph: Arc<Graph>,
    /// Package path -> node IDs, insertion order within each package.
    packages: BTreeMap<String, Vec<String>>,
}

impl HierarchicalGraph {
    /// Build the package grouping for `graph`.
    pub fn new(graph: Arc<Graph>) -> Self {
        let mut packages: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in graph.nodes() {
            let package = package_of(&node.symbol.file_path);
            packages.entry(package).or_default().push(node.id.clone());
        }
        Self { graph, packages }
    }

    /// The underlying graph.
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// All package paths, sorted.
    pub fn packages(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    /// Nodes grouped under `package`, in insertion order. Fresh container.
    pub fn nodes_in_package(&self, package: &str) -> Vec<&Node> {
        self.packages
            .get(package)
            .map(|ids| ids.iter().filter_map(|id| self.graph.get_node(id)).collect())
            .unwrap_or_default()
    }

    /// Nodes defined in `file_path`, in insertion order. Fresh container.
    pub fn nodes_in_file(&self, file_path: &str) -> Vec<&Node> {
        self.graph.nodes_by_file(file_path)
    }
}

/// Package of a file: its parent directory, or "." for a bare file name.
fn package_of(file_path: &str) -> String {
    match file_path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Language, SourceSpan, Symbol, SymbolKind};

    #[test]
    fn groups_nodes_by_parent_directory() {
        let mut g = Graph::new("/proj");
        for (id, file) in [
            ("pkg/a.go:1:A", "pkg/a.go"),
            ("pkg/b.go:1:B", "pkg/b.go"),
            ("other/c.go:1:C", "other/c.go"),
            ("root.go:1:R", "root.go"),
        ] {
            g.add_node(Symbol::new(
                id,
                id.rsplit(':').next().unwrap(),
                SymbolKind::Function,
                file,
                SourceSpan::point(1, 1),
                Language::Go,
            ))
            .unwrap();
        }
        g.freeze();

        let h = HierarchicalGraph::new(Arc::new(g));
        assert_eq!(h.packages(), vec![".", "other", "pkg"]);
        assert_eq!(h.nodes_in_package("pkg").len(), 2);
        assert_eq!(h.nodes_in_package("missing").len(), 0);
        assert_eq!(h.nodes_in_file("pkg/a.go").len(), 1);
    }
}
