//! Heavy-light decomposition of a rooted tree
//!
//! Decomposes a rooted tree into chains such that any root-to-leaf walk
//! crosses O(log N) chain boundaries, which lets the path-query engine
//! answer arbitrary path aggregates with O(log N) contiguous segment-tree
//! ranges. Construction is fully iterative; deep degenerate trees (long
//! call chains) must not blow the stack.
//!
//! Position layout: a DFS that always descends the heavy child first, so
//! every chain is a contiguous position run, every heavy child sits at
//! `pos(parent) + 1`, and every subtree occupies a contiguous block
//! (`[pos(v), pos(v) + size(v))`), giving O(1) ancestor tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::errors::GraphError;

/// Fixed seed shared with the graph's structural hash scheme.
const TREE_HASH_SEED: u64 = 0x686c_6474_7265_6573;

/// Upper bound on chain hops in a single LCA / decomposition loop. A healthy
/// decomposition needs O(log N) hops; hitting the cap means the parent or
/// head arrays are corrupted.
pub const DEFAULT_ITERATION_CAP: usize = 10_000;

/// A contiguous run of positions covering part of a tree path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathSegment {
    /// First position of the run (inclusive).
    pub start: usize,
    /// Last position of the run (inclusive).
    pub end: usize,
    /// True when the run was walked from descendant toward the root.
    pub upward: bool,
}

/// Heavy-light decomposition of one rooted tree.
pub struct Hld {
    root: usize,
    ids: Vec<String>,
    idx_of: HashMap<String, usize>,
    parent: Vec<Option<usize>>,
    depth: Vec<usize>,
    subtree_size: Vec<usize>,
    heavy: Vec<Option<usize>>,
    head: Vec<usize>,
    pos: Vec<usize>,
    node_at: Vec<usize>,
    iteration_cap: usize,
    lca_queries: AtomicU64,
    path_queries: AtomicU64,
    max_iterations_seen: AtomicU64,
}

impl Hld {
    /// Build the decomposition for the tree rooted at `root` described by a
    /// `parent -> ordered children` adjacency. Nodes unreachable from the
    /// root are ignored; a cycle in the adjacency is reported as an error.
    pub fn build(root: &str, children: &HashMap<String, Vec<String>>) -> anyhow::Result<Self> {
        if root.is_empty() {
            return Err(GraphError::InvalidNode.into());
        }

        // Breadth-first numbering; parents always precede children, which
        // lets every later pass run as a simple forward or backward sweep.
        let mut ids: Vec<String> = vec![root.to_string()];
        let mut idx_of: HashMap<String, usize> = HashMap::new();
        idx_of.insert(root.to_string(), 0);
        let mut parent: Vec<Option<usize>> = vec![None];
        let mut depth: Vec<usize> = vec![0];
        let mut order = 0usize;
        while order < ids.len() {
            let node_children = children.get(&ids[order]).cloned().unwrap_or_default();
            for child in node_children {
                if idx_of.contains_key(&child) {
                    anyhow::bail!(
                        "node {child} appears twice while building the decomposition; \
                         the adjacency is not a tree"
                    );
                }
                let idx = ids.len();
                idx_of.insert(child.clone(), idx);
                ids.push(child);
                parent.push(Some(order));
                depth.push(depth[order] + 1);
            }
            order += 1;
        }
        let n = ids.len();

        // Children in adjacency order per node; BFS numbering keeps each
        // list sorted by index already.
        let mut child_lists: Vec<Vec<usize>> = vec![Vec::new(); n];
        for idx in 1..n {
            child_lists[parent[idx].expect("non-root node has a parent")].push(idx);
        }

        // Subtree sizes (children before parents), then heavy children with
        // a deterministic tie-break: the first child in adjacency order wins.
        let mut subtree_size = vec![1usize; n];
        for idx in (1..n).rev() {
            let p = parent[idx].expect("non-root node has a parent");
            subtree_size[p] += subtree_size[idx];
        }
        let mut heavy: Vec<Option<usize>> = vec![None; n];
        for p in 0..n {
            let mut best: Option<usize> = None;
            for &child in &child_lists[p] {
                if best.map_or(true, |b| subtree_size[child] > subtree_size[b]) {
                    best = Some(child);
                }
            }
            heavy[p] = best;
        }

        // Chain-walking DFS: positions are assigned down each chain, then
        // light subtrees are popped most-recent-first, which keeps every
        // subtree contiguous in position space.
        let mut head = vec![0usize; n];
        let mut pos = vec![usize::MAX; n];
        let mut node_at = vec![usize::MAX; n];
        let mut next_pos = 0usize;
        let mut stack: Vec<usize> = vec![0];
        while let Some(chain_start) = stack.pop() {
            head[chain_start] = chain_start;
            let mut u = chain_start;
            loop {
                head[u] = head[chain_start];
                pos[u] = next_pos;
                node_at[next_pos] = u;
                next_pos += 1;
                for &child in &child_lists[u] {
                    if Some(child) != heavy[u] {
                        stack.push(child);
                    }
                }
                match heavy[u] {
                    Some(h) => u = h,
                    None => break,
                }
            }
        }
        debug_assert_eq!(next_pos, n);

        let hld = Self {
            root: 0,
            ids,
            idx_of,
            parent,
            depth,
            subtree_size,
            heavy,
            head,
            pos,
            node_at,
            iteration_cap: DEFAULT_ITERATION_CAP,
            lca_queries: AtomicU64::new(0),
            path_queries: AtomicU64::new(0),
            max_iterations_seen: AtomicU64::new(0),
        };
        debug!(nodes = n, root = %hld.ids[0], "built heavy-light decomposition");
        Ok(hld)
    }

    /// Node count of the decomposed tree.
    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    /// Root node ID.
    pub fn root_id(&self) -> &str {
        &self.ids[self.root]
    }

    /// Internal index of a node, if it belongs to this tree.
    pub fn node_to_idx(&self, node: &str) -> Option<usize> {
        self.idx_of.get(node).copied()
    }

    /// Position of a node in chain-ordered layout.
    pub fn pos(&self, node: &str) -> Option<usize> {
        self.node_to_idx(node).map(|idx| self.pos[idx])
    }

    /// Inverse of [`pos`]: the node occupying `position`.
    pub fn node_at_position(&self, position: usize) -> Option<&str> {
        self.node_at
            .get(position)
            .map(|&idx| self.ids[idx].as_str())
    }

    /// (lca queries, path decompositions, max chain hops seen).
    pub fn query_counters(&self) -> (u64, u64, u64) {
        (
            self.lca_queries.load(Ordering::Relaxed),
            self.path_queries.load(Ordering::Relaxed),
            self.max_iterations_seen.load(Ordering::Relaxed),
        )
    }

    fn require_idx(&self, node: &str) -> Result<usize, GraphError> {
        self.node_to_idx(node)
            .ok_or_else(|| GraphError::NodeNotFound(node.to_string()))
    }

    fn note_iterations(&self, iterations: usize) {
        self.max_iterations_seen
            .fetch_max(iterations as u64, Ordering::Relaxed);
    }

    /// Lowest common ancestor of `u` and `v`. Checks cancellation on every
    /// chain hop and fails if the hop count exceeds the iteration cap.
    pub fn lca(&self, token: &CancellationToken, u: &str, v: &str) -> anyhow::Result<String> {
        self.lca_queries.fetch_add(1, Ordering::Relaxed);
        let mut a = self.require_idx(u)?;
        let mut b = self.require_idx(v)?;

        let mut iterations = 0usize;
        while self.head[a] != self.head[b] {
            if token.is_cancelled() {
                return Err(GraphError::BuildCancelled.into());
            }
            iterations += 1;
            if iterations > self.iteration_cap {
                anyhow::bail!(
                    "lca({u}, {v}) exceeded {} chain hops; decomposition is corrupted",
                    self.iteration_cap
                );
            }
            if self.depth[self.head[a]] >= self.depth[self.head[b]] {
                a = self.parent[self.head[a]].expect("chain head above root");
            } else {
                b = self.parent[self.head[b]].expect("chain head above root");
            }
        }
        self.note_iterations(iterations);
        let lca = if self.depth[a] <= self.depth[b] { a } else { b };
        Ok(self.ids[lca].clone())
    }

    /// Decompose the `u` -> `v` path into O(log N) position segments whose
    /// union covers the path with the LCA counted exactly once.
    pub fn decompose_path(
        &self,
        token: &CancellationToken,
        u: &str,
        v: &str,
    ) -> anyhow::Result<Vec<PathSegment>> {
        self.path_queries.fetch_add(1, Ordering::Relaxed);
        let mut a = self.require_idx(u)?;
        let mut b = self.require_idx(v)?;

        let mut segments = Vec::new();
        let mut iterations = 0usize;
        while self.head[a] != self.head[b] {
            if token.is_cancelled() {
                return Err(GraphError::BuildCancelled.into());
            }
            iterations += 1;
            if iterations > self.iteration_cap {
                anyhow::bail!(
                    "decompose_path({u}, {v}) exceeded {} chain hops; decomposition is corrupted",
                    self.iteration_cap
                );
            }
            if self.depth[self.head[a]] >= self.depth[self.head[b]] {
                segments.push(PathSegment {
                    start: self.pos[self.head[a]],
                    end: self.pos[a],
                    upward: true,
                });
                a = self.parent[self.head[a]].expect("chain head above root");
            } else {
                segments.push(PathSegment {
                    start: self.pos[self.head[b]],
                    end: self.pos[b],
                    upward: false,
                });
                b = self.parent[self.head[b]].expect("chain head above root");
            }
        }
        self.note_iterations(iterations);

        // Both endpoints now share a chain; this final run contains the LCA.
        segments.push(PathSegment {
            start: self.pos[a].min(self.pos[b]),
            end: self.pos[a].max(self.pos[b]),
            upward: self.depth[a] >= self.depth[b],
        });
        Ok(segments)
    }

    /// Edge distance between two nodes.
    pub fn distance(&self, token: &CancellationToken, u: &str, v: &str) -> anyhow::Result<usize> {
        let lca = self.lca(token, u, v)?;
        let du = self.depth[self.require_idx(u)?];
        let dv = self.depth[self.require_idx(v)?];
        let dl = self.depth[self.require_idx(&lca)?];
        Ok(du + dv - 2 * dl)
    }

    /// O(1) ancestor test; every node is its own ancestor.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GraphError> {
        let a = self.require_idx(ancestor)?;
        let d = self.require_idx(descendant)?;
        let start = self.pos[a];
        Ok((start..start + self.subtree_size[a]).contains(&self.pos[d]))
    }

    /// Node IDs along the `u` -> `v` path, endpoints included, LCA once.
    pub fn path_nodes(
        &self,
        token: &CancellationToken,
        u: &str,
        v: &str,
    ) -> anyhow::Result<Vec<String>> {
        let lca = self.lca(token, u, v)?;
        let lca_idx = self.require_idx(&lca)?;

        let mut forward = Vec::new();
        let mut idx = self.require_idx(u)?;
        while idx != lca_idx {
            if token.is_cancelled() {
                return Err(GraphError::BuildCancelled.into());
            }
            if forward.len() > self.iteration_cap {
                anyhow::bail!("path_nodes walk exceeded {} steps", self.iteration_cap);
            }
            forward.push(self.ids[idx].clone());
            idx = self.parent[idx].expect("walk passed the root before the lca");
        }
        forward.push(lca.clone());

        let mut backward = Vec::new();
        let mut idx = self.require_idx(v)?;
        while idx != lca_idx {
            if token.is_cancelled() {
                return Err(GraphError::BuildCancelled.into());
            }
            if backward.len() > self.iteration_cap {
                anyhow::bail!("path_nodes walk exceeded {} steps", self.iteration_cap);
            }
            backward.push(self.ids[idx].clone());
            idx = self.parent[idx].expect("walk passed the root before the lca");
        }
        forward.extend(backward.into_iter().rev());
        Ok(forward)
    }

    /// Structural digest of the decomposed tree: order-independent over the
    /// (child, parent) edge multiset, 16 lowercase hex characters.
    pub fn graph_hash(&self) -> String {
        let mut acc: u64 =
            xxh3_64_with_seed(format!("r|{}", self.ids[self.root]).as_bytes(), TREE_HASH_SEED);
        for idx in 0..self.ids.len() {
            if let Some(p) = self.parent[idx] {
                let record = format!("t|{}|{}", self.ids[idx], self.ids[p]);
                acc = acc.wrapping_add(xxh3_64_with_seed(record.as_bytes(), TREE_HASH_SEED));
            }
        }
        format!("{acc:016x}")
    }

    /// Check the decomposition invariants: the position array is a
    /// permutation of `[0, N)`, every heavy child's position immediately
    /// follows its parent's, and every chain is contiguous.
    pub fn validate(&self) -> anyhow::Result<()> {
        use anyhow::bail;

        let n = self.ids.len();
        let mut seen = vec![false; n];
        for &p in &self.pos {
            if p >= n || seen[p] {
                bail!("position array is not a permutation of [0, {n})");
            }
            seen[p] = true;
        }
        for idx in 0..n {
            if self.node_at[self.pos[idx]] != idx {
                bail!("position inverse is inconsistent at node {}", self.ids[idx]);
            }
            if let Some(h) = self.heavy[idx] {
                if self.pos[h] != self.pos[idx] + 1 {
                    bail!(
                        "heavy child {} does not immediately follow {}",
                        self.ids[h],
                        self.ids[idx]
                    );
                }
            }
            // A non-head chain member must sit right after its predecessor.
            if self.head[idx] != idx {
                let p = self.parent[idx].expect("chain member below head has a parent");
                if self.head[p] != self.head[idx] || self.pos[idx] != self.pos[p] + 1 {
                    bail!("chain through {} is not contiguous", self.ids[idx]);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Hld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hld")
            .field("root", &self.ids[self.root])
            .field("nodes", &self.ids.len())
            .finish()
    }
}
