//! Optional symbol index consulted by the query service
//!
//! A dedicated index (trigram, fuzzy, whatever the host service runs) can
//! answer name lookups better than the graph's exact-match name index. The
//! query service treats it as optional: when present it is asked first,
//! when absent the graph index answers alone.

use std::sync::Arc;

use async_trait::async_trait;

use crate::graph::Graph;
use crate::types::Symbol;

/// Name-lookup contract for an external symbol index.
#[async_trait]
pub trait SymbolIndex: Send + Sync {
    /// All symbols matching `name` exactly.
    async fn search_by_name(&self, name: &str) -> anyhow::Result<Vec<Arc<Symbol>>>;
}

/// Trivial index backed directly by a frozen graph's name index. Useful in
/// tests and as the fallback wiring when no dedicated index exists.
pub struct GraphSymbolIndex {
    graph: Arc<Graph>,
}

impl GraphSymbolIndex {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl SymbolIndex for GraphSymbolIndex {
    async fn search_by_name(&self, name: &str) -> anyhow::Result<Vec<Arc<Symbol>>> {
        Ok(self
            .graph
            .nodes_by_name(name)
            .into_iter()
            .map(|node| Arc::clone(&node.symbol))
            .collect())
    }
}
