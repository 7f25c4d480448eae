//! Partition tree
//!
//! Bisects a range around its midpoint into an arena of nodes. Nodes closer
//! to the root than `max_depth` stay resident; children at `max_depth` are
//! offloaded to a [`NodeStore`] and referenced by [`StorageKey`].
//! Materializing an offloaded node expands a fresh subtree below it with the
//! same depth bound, so memory stays bounded however large the domain is.
//!
//! Ranges of at most `scan_len` keys are neither split nor offloaded. They
//! stay resident as scan leaves and are verified key by key.
//!
//! Coverage invariant: the midpoints of split nodes, the ranges of scan
//! leaves and the ranges of offloaded children partition the tree's range
//! exactly.
//!
//! Traversal is pre-order (midpoint, left, right) on an explicit stack.
//! Offloaded subtrees that were fully visited are recorded and reclaimed by
//! [`PartitionTree::collect_garbage`], never during traversal.

pub mod store;

pub use store::{BlobSource, LoadedNode, NodeStore, StorageKey};

use crate::oracle::FingerprintOracle;
use crate::pool::CancelToken;
use crate::range::{Key, SearchRange};
use crate::verifier::Verifier;
use std::sync::Arc;
use tracing::debug;

/// Index into the tree's arena
pub type NodeId = usize;

/// A child link: either a live arena node or a node in durable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Resident(NodeId),
    Offloaded(StorageKey),
}

/// One piece of the partition, in pre-order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Representative key of a split node
    Key(Key),
    /// Every key of a resident scan leaf
    Scan(SearchRange),
    /// Whole range of an offloaded subtree
    Offloaded(StorageKey),
}

/// Size bounds of a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    /// Resident levels below each materialized root
    pub max_depth: u32,
    /// Ranges this small become scan leaves
    pub scan_len: u128,
}

impl TreeShape {
    pub fn new(max_depth: u32, scan_len: u128) -> Self {
        Self {
            max_depth: max_depth.max(1),
            scan_len,
        }
    }

    fn is_scan(&self, range: SearchRange) -> bool {
        range.len() <= self.scan_len
    }
}

#[derive(Debug)]
struct PartitionNode {
    range: SearchRange,
    depth: u32,
    scan: bool,
    left: Option<NodeRef>,
    right: Option<NodeRef>,
    /// Storage key this node was materialized from
    origin: Option<StorageKey>,
}

impl PartitionNode {
    fn new(range: SearchRange, depth: u32, scan: bool) -> Self {
        Self {
            range,
            depth,
            scan,
            left: None,
            right: None,
            origin: None,
        }
    }
}

enum Step {
    Enter(NodeRef),
    Exit(NodeId),
}

#[derive(Debug)]
pub struct PartitionTree {
    arena: Vec<Option<PartitionNode>>,
    free: Vec<NodeId>,
    root: Option<NodeRef>,
    store: Arc<NodeStore>,
    shape: TreeShape,
    visited: Vec<StorageKey>,
}

impl PartitionTree {
    fn empty(store: Arc<NodeStore>, shape: TreeShape) -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            root: None,
            store,
            shape: TreeShape::new(shape.max_depth, shape.scan_len),
            visited: Vec::new(),
        }
    }

    /// Build a tree over `range`. Children at depth `max_depth` that are
    /// too large to scan are persisted to `store` as leaves.
    pub fn build(range: SearchRange, shape: TreeShape, store: Arc<NodeStore>) -> Self {
        let mut tree = Self::empty(store, shape);
        let root = tree.expand(range, 0);
        tree.root = Some(NodeRef::Resident(root));
        debug!(range = %range, resident = tree.resident_len(), offloaded = tree.frontier().len(), "partition tree built");
        tree
    }

    /// Take ownership of an offloaded subtree. Nothing is read until the
    /// tree is traversed.
    pub fn open(key: StorageKey, shape: TreeShape, store: Arc<NodeStore>) -> Self {
        let mut tree = Self::empty(store, shape);
        tree.root = Some(NodeRef::Offloaded(key));
        tree
    }

    pub fn root(&self) -> Option<NodeRef> {
        self.root
    }

    /// Nodes currently held in memory
    pub fn resident_len(&self) -> usize {
        self.arena.len() - self.free.len()
    }

    fn node(&self, id: NodeId) -> Option<&PartitionNode> {
        self.arena.get(id).and_then(Option::as_ref)
    }

    fn alloc(&mut self, node: PartitionNode) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.arena[id] = Some(node);
                id
            }
            None => {
                self.arena.push(Some(node));
                self.arena.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Option<PartitionNode> {
        let node = self.arena.get_mut(id)?.take()?;
        self.free.push(id);
        Some(node)
    }

    /// Bisect `range` into resident nodes down to `max_depth` levels below
    /// it, offloading the children at the bound. Returns the subtree root.
    fn expand(&mut self, range: SearchRange, base_depth: u32) -> NodeId {
        let scan = self.shape.is_scan(range);
        let root = self.alloc(PartitionNode::new(range, base_depth, scan));
        let mut pending = Vec::new();
        if !scan {
            pending.push((root, 0u32));
        }
        while let Some((id, relative)) = pending.pop() {
            let Some(split) = self.node(id).map(|n| n.range.split()) else { continue };
            let child_depth = relative + 1;
            let left = split
                .left
                .map(|r| self.link_child(r, base_depth, child_depth, &mut pending));
            let right = split
                .right
                .map(|r| self.link_child(r, base_depth, child_depth, &mut pending));
            if let Some(node) = self.arena[id].as_mut() {
                node.left = left;
                node.right = right;
            }
        }
        root
    }

    fn link_child(
        &mut self,
        range: SearchRange,
        base_depth: u32,
        relative: u32,
        pending: &mut Vec<(NodeId, u32)>,
    ) -> NodeRef {
        let depth = base_depth + relative;
        if self.shape.is_scan(range) {
            return NodeRef::Resident(self.alloc(PartitionNode::new(range, depth, true)));
        }
        if relative >= self.shape.max_depth {
            return NodeRef::Offloaded(self.store.offload(range, depth));
        }
        let id = self.alloc(PartitionNode::new(range, depth, false));
        pending.push((id, relative));
        NodeRef::Resident(id)
    }

    fn materialize(&mut self, node: NodeRef) -> NodeId {
        match node {
            NodeRef::Resident(id) => id,
            NodeRef::Offloaded(key) => {
                let loaded = self.store.load(&key);
                let id = self.expand(loaded.range, loaded.depth);
                if let Some(node) = self.arena[id].as_mut() {
                    node.origin = Some(key);
                }
                id
            }
        }
    }

    /// Pre-order listing of the resident partition without touching storage
    pub fn coverage(&self) -> Vec<Coverage> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeRef> = self.root.into_iter().collect();
        while let Some(node) = stack.pop() {
            match node {
                NodeRef::Offloaded(key) => out.push(Coverage::Offloaded(key)),
                NodeRef::Resident(id) => {
                    let Some(node) = self.node(id) else { continue };
                    if node.scan {
                        out.push(Coverage::Scan(node.range));
                        continue;
                    }
                    out.push(Coverage::Key(node.range.midpoint()));
                    stack.extend(node.right);
                    stack.extend(node.left);
                }
            }
        }
        out
    }

    /// Offloaded leaves, left to right
    pub fn frontier(&self) -> Vec<StorageKey> {
        self.coverage()
            .into_iter()
            .filter_map(|piece| match piece {
                Coverage::Offloaded(key) => Some(key),
                Coverage::Key(_) | Coverage::Scan(_) => None,
            })
            .collect()
    }

    /// Depth-first, pre-order search for the first key whose fingerprint
    /// matches the verifier's target.
    ///
    /// Offloaded nodes are loaded as they are reached. Visited nodes are
    /// released from the arena; offloaded subtrees that finish without a
    /// match are queued for [`collect_garbage`](Self::collect_garbage).
    /// Returns `None` when the whole tree was visited or `cancel` fired.
    pub fn search<O>(&mut self, verifier: &Verifier<O>, cancel: &CancelToken) -> Option<Key>
    where
        O: FingerprintOracle + ?Sized,
    {
        let mut stack: Vec<Step> = self.root.map(Step::Enter).into_iter().collect();
        while let Some(step) = stack.pop() {
            if cancel.is_cancelled() {
                return None;
            }
            match step {
                Step::Enter(node) => {
                    let id = self.materialize(node);
                    let Some((range, scan)) = self.node(id).map(|n| (n.range, n.scan)) else { continue };
                    if scan {
                        if let Some(key) = verifier.verify_range(range, cancel) {
                            return Some(key);
                        }
                        stack.push(Step::Exit(id));
                        continue;
                    }
                    let mid = range.midpoint();
                    if verifier.is_match(mid) {
                        return Some(mid);
                    }
                    let (left, right) = match self.arena[id].as_mut() {
                        Some(node) => (node.left.take(), node.right.take()),
                        None => (None, None),
                    };
                    stack.push(Step::Exit(id));
                    stack.extend(right.map(Step::Enter));
                    stack.extend(left.map(Step::Enter));
                }
                Step::Exit(id) => {
                    if let Some(origin) = self.release(id).and_then(|node| node.origin) {
                        self.visited.push(origin);
                    }
                }
            }
        }
        self.root = None;
        None
    }

    /// Delete the blobs of fully visited offloaded subtrees. Safe to call
    /// repeatedly; returns how many blobs were removed.
    pub fn collect_garbage(&mut self) -> usize {
        let removed = self
            .visited
            .drain(..)
            .filter(|key| self.store.delete(key))
            .count();
        if removed > 0 {
            debug!(removed, "reclaimed visited partition nodes");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Fingerprint, FnOracle};
    use crate::target::SearchTarget;

    fn store() -> (tempfile::TempDir, Arc<NodeStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(NodeStore::open(dir.path()).unwrap());
        (dir, store)
    }

    fn identity_verifier(target: Key) -> Verifier<dyn FingerprintOracle> {
        let oracle: Arc<dyn FingerprintOracle> = Arc::new(FnOracle::new(|key: Key| {
            Ok(Fingerprint::from_hex(&format!("{:08x}", key)).unwrap())
        }));
        let target = SearchTarget::new(&format!("{:08x}", target), 8).unwrap();
        Verifier::new(oracle, Arc::new(target))
    }

    #[test]
    fn test_depth_one_over_eight_keys() {
        let (_dir, store) = store();
        let tree = PartitionTree::build(SearchRange::new(0, 7).unwrap(), TreeShape::new(1, 0), store.clone());
        assert_eq!(
            tree.coverage(),
            vec![
                Coverage::Key(3),
                Coverage::Offloaded(StorageKey::new(SearchRange::new(0, 2).unwrap())),
                Coverage::Offloaded(StorageKey::new(SearchRange::new(4, 7).unwrap())),
            ]
        );
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(tree.resident_len(), 1);
    }

    #[test]
    fn test_search_visits_every_key_pre_order() {
        let (_dir, store) = store();
        for target in 0..=20u128 {
            let mut tree = PartitionTree::build(SearchRange::new(0, 20).unwrap(), TreeShape::new(2, 0), store.clone());
            assert_eq!(tree.search(&identity_verifier(target), &CancelToken::new()), Some(target));
        }
    }

    #[test]
    fn test_absent_target_consumes_tree_and_collects_garbage() {
        let (_dir, store) = store();
        let verifier = identity_verifier(1_000);
        let mut tree = PartitionTree::build(SearchRange::new(0, 63).unwrap(), TreeShape::new(2, 0), store.clone());
        assert_eq!(tree.search(&verifier, &CancelToken::new()), None);
        assert_eq!(verifier.fingerprints_computed(), 64);
        assert_eq!(tree.resident_len(), 0);
        assert!(tree.root().is_none());

        assert!(tree.collect_garbage() > 0);
        assert_eq!(tree.collect_garbage(), 0);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_open_offloaded_subtree() {
        let (_dir, store) = store();
        let tree = PartitionTree::build(SearchRange::new(100, 199).unwrap(), TreeShape::new(1, 0), store.clone());
        let right = tree.frontier()[1];
        let mut subtree = PartitionTree::open(right, TreeShape::new(3, 0), store.clone());
        assert_eq!(subtree.search(&identity_verifier(180), &CancelToken::new()), Some(180));
    }

    #[test]
    fn test_missing_blob_is_rebuilt_during_search() {
        let (_dir, store) = store();
        let mut tree = PartitionTree::build(SearchRange::new(0, 31).unwrap(), TreeShape::new(1, 0), store.clone());
        for key in tree.frontier() {
            store.delete(&key);
        }
        assert_eq!(tree.search(&identity_verifier(30), &CancelToken::new()), Some(30));
    }

    #[test]
    fn test_small_ranges_become_scan_leaves() {
        let (_dir, store) = store();
        let tree = PartitionTree::build(SearchRange::new(0, 20).unwrap(), TreeShape::new(3, 10), store.clone());
        assert_eq!(
            tree.coverage(),
            vec![
                Coverage::Key(10),
                Coverage::Scan(SearchRange::new(0, 9).unwrap()),
                Coverage::Scan(SearchRange::new(11, 20).unwrap()),
            ]
        );
        assert_eq!(store.offloads(), 0);
    }

    #[test]
    fn test_scan_leaves_bound_offloads() {
        let (_dir, store) = store();
        let verifier = identity_verifier(1_000_000);
        let range = SearchRange::new(0, 65_535).unwrap();
        let mut tree = PartitionTree::build(range, TreeShape::new(4, 1_024), store.clone());
        assert_eq!(tree.search(&verifier, &CancelToken::new()), None);
        assert_eq!(verifier.fingerprints_computed(), 65_536);
        // Only the sixteen depth-4 subtrees go to storage; their own
        // children are small enough to scan in place
        assert_eq!(store.offloads(), 16);
        assert_eq!(tree.collect_garbage(), 16);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_scan_leaf_search_is_ascending() {
        let (_dir, store) = store();
        for target in [0u128, 9, 10, 11, 20] {
            let mut tree = PartitionTree::build(SearchRange::new(0, 20).unwrap(), TreeShape::new(2, 10), store.clone());
            assert_eq!(tree.search(&identity_verifier(target), &CancelToken::new()), Some(target));
        }
    }
}
