//! Forest of heavy-light decompositions with a global position space
//!
//! Disconnected call structures decompose per tree; the forest assigns each
//! tree a contiguous, monotonically increasing offset block so one segment
//! tree over `[0, total_nodes)` can back path queries in any member tree.
//! Paths never cross trees; the engine rejects those before touching the
//! segment tree.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::errors::GraphError;
use crate::hld::Hld;

const FOREST_HASH_SEED: u64 = 0x666f_7265_7374_6873;

/// A set of per-tree decompositions sharing one position space.
pub struct HldForest {
    trees: Vec<Arc<Hld>>,
    /// Node ID -> index into `trees`.
    node_tree: HashMap<String, usize>,
    /// Position offset of each tree's block; blocks are contiguous and
    /// cover `[0, total_nodes)` in tree order.
    offsets: Vec<usize>,
    total_nodes: usize,
}

impl HldForest {
    /// Build one decomposition per root. Trees must be node-disjoint.
    pub fn build(
        roots: &[String],
        children: &HashMap<String, Vec<String>>,
    ) -> anyhow::Result<Self> {
        let mut trees = Vec::with_capacity(roots.len());
        let mut node_tree = HashMap::new();
        let mut offsets = Vec::with_capacity(roots.len());
        let mut next_offset = 0usize;

        for (tree_id, root) in roots.iter().enumerate() {
            let hld = Hld::build(root, children)?;
            for pos in 0..hld.node_count() {
                let node = hld
                    .node_at_position(pos)
                    .expect("every position maps to a node");
                if node_tree.insert(node.to_string(), tree_id).is_some() {
                    anyhow::bail!("node {node} belongs to more than one tree in the forest");
                }
            }
            offsets.push(next_offset);
            next_offset += hld.node_count();
            trees.push(Arc::new(hld));
        }

        debug!(
            trees = trees.len(),
            total_nodes = next_offset,
            "built decomposition forest"
        );
        Ok(Self {
            trees,
            node_tree,
            offsets,
            total_nodes: next_offset,
        })
    }

    /// Number of member trees.
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Total node count across all trees.
    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    /// The decomposition owning `node`.
    pub fn hld_for(&self, node: &str) -> Result<&Arc<Hld>, GraphError> {
        self.tree_id(node).map(|id| &self.trees[id])
    }

    /// Index of the tree owning `node`.
    pub fn tree_id(&self, node: &str) -> Result<usize, GraphError> {
        self.node_tree
            .get(node)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(node.to_string()))
    }

    /// Global position offset of the tree owning `node`.
    pub fn tree_offset(&self, node: &str) -> Result<usize, GraphError> {
        self.tree_id(node).map(|id| self.offsets[id])
    }

    /// Global position of `node`: its in-tree position plus its tree offset.
    pub fn global_pos(&self, node: &str) -> Result<usize, GraphError> {
        let tree_id = self.tree_id(node)?;
        let pos = self.trees[tree_id]
            .pos(node)
            .ok_or_else(|| GraphError::NodeNotFound(node.to_string()))?;
        Ok(self.offsets[tree_id] + pos)
    }

    /// Inverse of [`global_pos`]: the node occupying a global position.
    pub fn node_at_global_position(&self, position: usize) -> Option<&str> {
        if position >= self.total_nodes {
            return None;
        }
        let tree_id = match self.offsets.binary_search(&position) {
            Ok(exact) => exact,
            Err(insertion) => insertion - 1,
        };
        self.trees[tree_id].node_at_position(position - self.offsets[tree_id])
    }

    /// Validate every member tree plus the offset layout: blocks must be
    /// disjoint, contiguous, and cover `[0, total_nodes)`.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut expected_offset = 0usize;
        for (tree_id, tree) in self.trees.iter().enumerate() {
            tree.validate()?;
            if self.offsets[tree_id] != expected_offset {
                anyhow::bail!(
                    "tree {tree_id} starts at offset {} but the previous block ends at {expected_offset}",
                    self.offsets[tree_id]
                );
            }
            expected_offset += tree.node_count();
        }
        if expected_offset != self.total_nodes {
            anyhow::bail!(
                "offset blocks cover {expected_offset} positions but the forest claims {}",
                self.total_nodes
            );
        }
        Ok(())
    }

    /// Order-independent digest over the member trees' structural hashes.
    pub fn graph_hash(&self) -> String {
        let mut acc: u64 = 0;
        for tree in &self.trees {
            acc = acc.wrapping_add(xxh3_64_with_seed(
                tree.graph_hash().as_bytes(),
                FOREST_HASH_SEED,
            ));
        }
        format!("{acc:016x}")
    }
}

impl std::fmt::Debug for HldForest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HldForest")
            .field("trees", &self.trees.len())
            .field("total_nodes", &self.total_nodes)
            .finish()
    }
}
